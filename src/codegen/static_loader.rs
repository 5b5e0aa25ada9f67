//! Loading of precompiled images.
//!
//! A static deployment ships one image per unit in an [`ArtifactStore`]. The
//! loader never generates code: a missing image is a deployment defect and is
//! reported as [`GenerationError::MissingPrecompiledArtifact`].

use super::{CodeArtifact, CodeGenerator};
use crate::config::GenerationMode;
use crate::core::{CompilationUnit, GenerationError};
use crate::image::BinaryImage;
use crate::store::ArtifactStore;
use std::sync::Arc;

pub struct StaticLoader {
    store: Arc<dyn ArtifactStore>,
    verify_fingerprint: bool,
}

impl StaticLoader {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            verify_fingerprint: true,
        }
    }

    /// Accept images whose recorded fingerprint differs from the unit's.
    pub fn with_fingerprint_check(mut self, verify: bool) -> Self {
        self.verify_fingerprint = verify;
        self
    }
}

impl CodeGenerator for StaticLoader {
    fn mode(&self) -> GenerationMode {
        GenerationMode::StaticBytecode
    }

    fn generate(&self, unit: &CompilationUnit) -> Result<CodeArtifact, GenerationError> {
        let id = unit.id();
        let bytes = self
            .store
            .lookup(id)
            .map_err(|e| GenerationError::Store {
                unit: id.clone(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| {
                log::warn!("no precompiled artifact for {}; the store was not prepared for it", id);
                GenerationError::MissingPrecompiledArtifact { unit: id.clone() }
            })?;

        let image = BinaryImage::parse(bytes).map_err(|e| GenerationError::CorruptArtifact {
            unit: id.clone(),
            reason: e.to_string(),
        })?;

        let recorded = image.unit();
        if recorded.name() != id.name() {
            return Err(GenerationError::CorruptArtifact {
                unit: id.clone(),
                reason: format!("image records unit '{}'", recorded.name()),
            });
        }
        if self.verify_fingerprint && recorded.fingerprint() != id.fingerprint() {
            log::warn!("stale artifact for {}: built from {}", id, recorded);
            return Err(GenerationError::StaleArtifact {
                unit: id.clone(),
                found: recorded.to_string(),
            });
        }

        log::debug!("loaded precompiled {} ({} bytes)", id, image.len());
        Ok(CodeArtifact::Static(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::DynamicGenerator;
    use crate::store::MemoryStore;

    const SRC: &str = "one() {\nentry:\n  %r = const 1\n  ret %r\n}\n";

    fn prepared(unit: &CompilationUnit) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let artifact = DynamicGenerator::new().generate(unit).unwrap();
        store
            .persist(unit.id(), artifact.image().unwrap().bytes())
            .unwrap();
        store
    }

    #[test]
    fn test_missing_artifact() {
        let unit = CompilationUnit::from_source("Foo", SRC).unwrap();
        let loader = StaticLoader::new(Arc::new(MemoryStore::new()));
        assert_eq!(
            loader.generate(&unit).unwrap_err(),
            GenerationError::MissingPrecompiledArtifact {
                unit: unit.id().clone()
            }
        );
    }

    #[test]
    fn test_loads_prepared_image() {
        let unit = CompilationUnit::from_source("Foo", SRC).unwrap();
        let loader = StaticLoader::new(prepared(&unit));
        let artifact = loader.generate(&unit).unwrap();
        assert_eq!(artifact.mode(), GenerationMode::StaticBytecode);
        assert_eq!(artifact.unit(), unit.id());
        assert!(artifact.image().unwrap().function_code("one").is_some());
    }

    #[test]
    fn test_stale_artifact() {
        let old = CompilationUnit::from_source("Foo", SRC).unwrap();
        let new = CompilationUnit::from_source("Foo", "one() {\nentry:\n  %r = const 2\n  ret %r\n}\n").unwrap();
        let store = prepared(&old);

        let err = StaticLoader::new(store.clone()).generate(&new).unwrap_err();
        assert!(matches!(err, GenerationError::StaleArtifact { .. }), "{err:?}");

        let lenient = StaticLoader::new(store).with_fingerprint_check(false);
        assert!(lenient.generate(&new).is_ok());
    }

    #[test]
    fn test_corrupt_artifact() {
        let unit = CompilationUnit::from_source("Foo", SRC).unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_raw("Foo", b"\x7fELF garbage".to_vec());
        let err = StaticLoader::new(store).generate(&unit).unwrap_err();
        assert!(matches!(err, GenerationError::CorruptArtifact { .. }), "{err:?}");
    }
}
