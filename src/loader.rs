// The public entry point. A RuntimeLoader is built for exactly one GenerationMode and one
// generator implementing that mode; it refuses a generator for any other mode, and it
// never falls back from one strategy to another. load() goes through the artifact cache,
// so concurrent loads of one unit share a single generation, and turns the memoized
// artifact into what the caller needs: an ExecutableHandle for binary images, or an
// ExternalCompileRequired status carrying the emitted source when the unit still has to
// go through an external toolchain. Once that toolchain's output is registered with
// register_external_compile(), later loads of the same unit yield executable handles.
//
// A missing precompiled artifact is a deployment defect, logged at error level and
// reported with its own LoadError variant so callers can tell it from a failed lowering.

//! Runtime loading of compilation units.

use crate::cache::{ArtifactCache, CacheError};
use crate::codegen::{
    generator_for, CodeArtifact, CodeGenerator, DynamicGenerator, SourceArtifact, StaticLoader,
};
use crate::config::{ConfigError, GenerationConfig, GenerationMode};
use crate::core::{CompilationUnit, GenerationError, LoadError, UnitId};
use crate::image::{BinaryImage, SymbolInfo};
use crate::store::{ArtifactStore, DirectoryStore};
use hashbrown::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolchainError {
    pub message: String,
}

impl ToolchainError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A native toolchain that turns emitted source into an image.
pub trait ExternalToolchain {
    fn compile(&self, source: &SourceArtifact) -> Result<Vec<u8>, ToolchainError>;
}

/// An image ready to be linked into the process.
#[derive(Debug, Clone)]
pub struct ExecutableHandle {
    unit: UnitId,
    provenance: GenerationMode,
    image: BinaryImage,
}

impl ExecutableHandle {
    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    /// The mode whose pipeline produced the image.
    pub fn provenance(&self) -> GenerationMode {
        self.provenance
    }

    pub fn image(&self) -> &BinaryImage {
        &self.image
    }

    pub fn symbols(&self) -> &[SymbolInfo] {
        self.image.symbols()
    }

    pub fn symbol(&self, name: &str) -> Option<&SymbolInfo> {
        self.image.symbol(name)
    }

    pub fn function_code(&self, name: &str) -> Option<&[u8]> {
        self.image.function_code(name)
    }

    pub fn same_image(&self, other: &ExecutableHandle) -> bool {
        self.image.ptr_eq(&other.image)
    }
}

/// Outcome of a successful [`RuntimeLoader::load`].
#[derive(Debug, Clone)]
pub enum Loaded {
    Executable(ExecutableHandle),
    /// Source was emitted; an external toolchain has to compile it.
    ExternalCompileRequired(SourceArtifact),
}

impl Loaded {
    pub fn executable(self) -> Option<ExecutableHandle> {
        match self {
            Loaded::Executable(handle) => Some(handle),
            Loaded::ExternalCompileRequired(_) => None,
        }
    }

    pub fn is_external_compile_required(&self) -> bool {
        matches!(self, Loaded::ExternalCompileRequired(_))
    }
}

pub struct RuntimeLoader {
    mode: GenerationMode,
    generator: Arc<dyn CodeGenerator>,
    cache: ArtifactCache,
    compiled: RwLock<HashMap<UnitId, BinaryImage>>,
    wait_timeout: Option<Duration>,
}

impl RuntimeLoader {
    pub fn new(mode: GenerationMode, generator: Arc<dyn CodeGenerator>) -> Result<Self, ConfigError> {
        if generator.mode() != mode {
            return Err(ConfigError::InvariantViolation(format!(
                "loader configured for {} but generator implements {}",
                mode,
                generator.mode()
            )));
        }
        log::info!("runtime loader using {} generation", mode);
        Ok(Self {
            mode,
            generator,
            cache: ArtifactCache::new(),
            compiled: RwLock::new(HashMap::new()),
            wait_timeout: None,
        })
    }

    /// Bound how long a load waits for another caller's generation.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Wire the store and generator described by `config`.
    pub fn from_config(config: &GenerationConfig) -> Result<Self, ConfigError> {
        let mode = config.mode();
        // Only a static deployment reads the store; other modes leave the directory alone.
        let store: Option<Arc<dyn ArtifactStore>> = match &config.store_root {
            Some(root) if mode.is_static() => {
                let store = DirectoryStore::open(root.clone()).map_err(|e| {
                    ConfigError::StoreUnavailable {
                        path: root.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Some(Arc::new(store))
            }
            _ => None,
        };

        let generator: Arc<dyn CodeGenerator> = match (mode, store) {
            (GenerationMode::StaticBytecode, Some(store)) => {
                Arc::new(StaticLoader::new(store).with_fingerprint_check(config.verify_fingerprint))
            }
            (mode, store) => generator_for(mode, store)?,
        };

        let loader = Self::new(mode, generator)?;
        Ok(match config.wait_timeout {
            Some(timeout) => loader.with_wait_timeout(timeout),
            None => loader,
        })
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Make `unit` executable, or report that it needs an external compile.
    pub fn load(&self, unit: &CompilationUnit) -> Result<Loaded, LoadError> {
        let generate = |u: &CompilationUnit| self.generator.generate(u);
        let result = match self.wait_timeout {
            Some(timeout) => self.cache.get_or_generate_timeout(unit, generate, timeout),
            None => self.cache.get_or_generate(unit, generate).map_err(CacheError::from),
        };

        let artifact = result.map_err(|err| match err {
            CacheError::Generation(GenerationError::MissingPrecompiledArtifact { unit }) => {
                log::error!("missing precompiled artifact for {} in {} mode", unit, self.mode);
                LoadError::MissingPrecompiledArtifact { unit }
            }
            CacheError::Generation(other) => {
                log::debug!("load of {} failed: {}", other.unit(), other);
                LoadError::GenerationFailure(other)
            }
            CacheError::Timeout { unit, waited } => LoadError::Timeout { unit, waited },
        })?;

        if artifact.mode() != self.mode {
            return Err(ConfigError::InvariantViolation(format!(
                "{} loader received a {} artifact for {}",
                self.mode,
                artifact.mode(),
                unit.id()
            ))
            .into());
        }

        match artifact {
            CodeArtifact::Static(image) | CodeArtifact::Dynamic(image) => {
                Ok(Loaded::Executable(ExecutableHandle {
                    unit: unit.id().clone(),
                    provenance: self.mode,
                    image,
                }))
            }
            CodeArtifact::SourceText(source) => {
                let compiled = self
                    .compiled
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(unit.id())
                    .cloned();
                Ok(match compiled {
                    Some(image) => Loaded::Executable(ExecutableHandle {
                        unit: unit.id().clone(),
                        provenance: self.mode,
                        image,
                    }),
                    None => Loaded::ExternalCompileRequired(source),
                })
            }
        }
    }

    /// Accept an external toolchain's image for a source-emitted unit. The
    /// first registration for an identity wins.
    pub fn register_external_compile(
        &self,
        unit: &UnitId,
        bytes: Vec<u8>,
    ) -> Result<ExecutableHandle, LoadError> {
        if !self.mode.is_source_text() {
            return Err(ConfigError::InvariantViolation(format!(
                "external compile results are not accepted in {} mode",
                self.mode
            ))
            .into());
        }

        let image = BinaryImage::parse(bytes).map_err(|e| LoadError::InvalidImage {
            unit: unit.clone(),
            reason: e.to_string(),
        })?;
        if image.unit() != unit {
            return Err(LoadError::InvalidImage {
                unit: unit.clone(),
                reason: format!("image was built for {}", image.unit()),
            });
        }

        let image = self
            .compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(unit.clone())
            .or_insert(image)
            .clone();
        log::debug!("registered external compile of {}", unit);

        Ok(ExecutableHandle {
            unit: unit.clone(),
            provenance: self.mode,
            image,
        })
    }

    /// Load `unit`, handing emitted source to `toolchain` when needed.
    pub fn load_with_toolchain(
        &self,
        unit: &CompilationUnit,
        toolchain: &dyn ExternalToolchain,
    ) -> Result<ExecutableHandle, LoadError> {
        match self.load(unit)? {
            Loaded::Executable(handle) => Ok(handle),
            Loaded::ExternalCompileRequired(source) => {
                let bytes = toolchain.compile(&source).map_err(|e| LoadError::Toolchain {
                    unit: source.unit.clone(),
                    reason: e.message,
                })?;
                self.register_external_compile(&source.unit, bytes)
            }
        }
    }
}

/// Generate `unit` dynamically and persist the image for a static deployment.
pub fn precompile(
    unit: &CompilationUnit,
    store: &dyn ArtifactStore,
) -> Result<BinaryImage, GenerationError> {
    let artifact = DynamicGenerator::new().generate(unit)?;
    let image = match artifact {
        CodeArtifact::Dynamic(image) => image,
        other => {
            return Err(GenerationError::Lowering {
                unit: unit.id().clone(),
                function: String::new(),
                reason: format!("dynamic generator produced a {} artifact", other.mode()),
            })
        }
    };

    store
        .persist(unit.id(), image.bytes())
        .map_err(|e| GenerationError::Store {
            unit: unit.id().clone(),
            reason: e.to_string(),
        })?;
    log::info!("precompiled {} ({} bytes)", unit.id(), image.len());
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::SourceEmitter;

    const SRC: &str = "one() {\nentry:\n  %r = const 1\n  ret %r\n}\n";

    #[test]
    fn test_rejects_mismatched_generator() {
        let result = RuntimeLoader::new(GenerationMode::StaticBytecode, Arc::new(DynamicGenerator::new()));
        assert!(matches!(result, Err(ConfigError::InvariantViolation(_))));
    }

    #[test]
    fn test_external_compile_only_in_source_mode() {
        let loader =
            RuntimeLoader::new(GenerationMode::DynamicBytecode, Arc::new(DynamicGenerator::new())).unwrap();
        let unit = CompilationUnit::from_source("Foo", SRC).unwrap();
        let err = loader
            .register_external_compile(unit.id(), Vec::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::Config(ConfigError::InvariantViolation(_))));
    }

    #[test]
    fn test_registration_checks_unit_identity() {
        let loader = RuntimeLoader::new(GenerationMode::SourceText, Arc::new(SourceEmitter::new())).unwrap();
        let foo = CompilationUnit::from_source("Foo", SRC).unwrap();
        let bar = CompilationUnit::from_source("Bar", SRC).unwrap();
        let bar_image = DynamicGenerator::new().generate(&bar).unwrap();

        let err = loader
            .register_external_compile(foo.id(), bar_image.image().unwrap().bytes().to_vec())
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidImage { .. }), "{err:?}");

        let err = loader
            .register_external_compile(foo.id(), b"junk".to_vec())
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidImage { .. }), "{err:?}");
    }
}
