// The three code generation strategies behind one trait. A CodeGenerator turns a
// CompilationUnit into a CodeArtifact and reports which GenerationMode it implements; the
// runtime loader checks that this matches the mode it was configured with, so a process
// never mixes strategies. StaticLoader reads precompiled images from an ArtifactStore,
// DynamicGenerator lowers the IR to x86-64 in memory, SourceEmitter writes C for an
// external toolchain. Generators are stateless apart from their configuration and are
// shared between threads through Arc; all memoization lives in the artifact cache.

//! Code generators and the artifacts they produce.

pub mod dynamic;
pub mod source;
pub mod static_loader;

pub use dynamic::DynamicGenerator;
pub use source::SourceEmitter;
pub use static_loader::StaticLoader;

use crate::config::{ConfigError, GenerationMode};
use crate::core::{CompilationUnit, GenerationError, UnitId};
use crate::image::BinaryImage;
use crate::store::ArtifactStore;
use std::fmt;
use std::sync::Arc;

/// Language of emitted source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceLanguage {
    C,
}

impl fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLanguage::C => f.write_str("C"),
        }
    }
}

/// Source text awaiting compilation by an external toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArtifact {
    pub unit: UnitId,
    pub text: Arc<str>,
    pub language: SourceLanguage,
}

/// Output of one generator run.
#[derive(Debug, Clone)]
pub enum CodeArtifact {
    Static(BinaryImage),
    Dynamic(BinaryImage),
    SourceText(SourceArtifact),
}

impl CodeArtifact {
    pub fn mode(&self) -> GenerationMode {
        match self {
            CodeArtifact::Static(_) => GenerationMode::StaticBytecode,
            CodeArtifact::Dynamic(_) => GenerationMode::DynamicBytecode,
            CodeArtifact::SourceText(_) => GenerationMode::SourceText,
        }
    }

    pub fn unit(&self) -> &UnitId {
        match self {
            CodeArtifact::Static(image) | CodeArtifact::Dynamic(image) => image.unit(),
            CodeArtifact::SourceText(source) => &source.unit,
        }
    }

    pub fn image(&self) -> Option<&BinaryImage> {
        match self {
            CodeArtifact::Static(image) | CodeArtifact::Dynamic(image) => Some(image),
            CodeArtifact::SourceText(_) => None,
        }
    }

    pub fn source(&self) -> Option<&SourceArtifact> {
        match self {
            CodeArtifact::SourceText(source) => Some(source),
            _ => None,
        }
    }

    /// Both artifacts came out of the same generation.
    pub fn ptr_eq(&self, other: &CodeArtifact) -> bool {
        match (self, other) {
            (CodeArtifact::Static(a), CodeArtifact::Static(b))
            | (CodeArtifact::Dynamic(a), CodeArtifact::Dynamic(b)) => a.ptr_eq(b),
            (CodeArtifact::SourceText(a), CodeArtifact::SourceText(b)) => Arc::ptr_eq(&a.text, &b.text),
            _ => false,
        }
    }
}

/// A code generation strategy.
pub trait CodeGenerator: Send + Sync {
    fn mode(&self) -> GenerationMode;

    fn generate(&self, unit: &CompilationUnit) -> Result<CodeArtifact, GenerationError>;
}

/// Build the generator for `mode`. Static generation needs a store.
pub fn generator_for(
    mode: GenerationMode,
    store: Option<Arc<dyn ArtifactStore>>,
) -> Result<Arc<dyn CodeGenerator>, ConfigError> {
    let generator: Arc<dyn CodeGenerator> = match mode {
        GenerationMode::StaticBytecode => {
            Arc::new(StaticLoader::new(store.ok_or(ConfigError::MissingStore)?))
        }
        GenerationMode::DynamicBytecode => Arc::new(DynamicGenerator::new()),
        GenerationMode::SourceText => Arc::new(SourceEmitter::new()),
    };
    Ok(generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_generator_for_every_mode() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryStore::new());
        for mode in GenerationMode::ALL {
            let generator = generator_for(mode, Some(store.clone())).unwrap();
            assert_eq!(generator.mode(), mode);
        }
    }

    #[test]
    fn test_static_generator_needs_a_store() {
        assert_eq!(
            generator_for(GenerationMode::StaticBytecode, None).err(),
            Some(ConfigError::MissingStore)
        );
        assert!(generator_for(GenerationMode::DynamicBytecode, None).is_ok());
    }
}
