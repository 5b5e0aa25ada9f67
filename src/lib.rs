//! modgen - code generation backend selection for a managed runtime.
//!
//! A process makes compiled modules executable through exactly one of three
//! strategies, chosen once at startup:
//!
//! - **static**: precompiled images are loaded from an artifact store
//! - **dynamic**: images are generated in memory on demand
//! - **source**: C source is emitted for an external native toolchain
//!
//! # Primary Usage
//!
//! ```ignore
//! use modgen::{CompilationUnit, GenerationConfig, Loaded, RuntimeLoader};
//!
//! let config = GenerationConfig::from_env()?;
//! let loader = RuntimeLoader::from_config(&config)?;
//!
//! let unit = CompilationUnit::from_source("Cal.Core.Prelude", ir_text)?;
//! match loader.load(&unit)? {
//!     Loaded::Executable(handle) => { /* link handle.image() */ }
//!     Loaded::ExternalCompileRequired(source) => { /* hand source.text to cc */ }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`config`] - mode resolution from flags and environment
//! - [`ir`] - textual module IR
//! - [`core`] - unit identity, errors, lowering sessions
//! - [`x64`] - x86-64 instruction encoding
//! - [`image`] - ELF relocatable images
//! - [`codegen`] - the three generators
//! - [`store`] - persistent artifact stores
//! - [`cache`] - single-flight artifact cache
//! - [`loader`] - the runtime loader

pub mod cache;
pub mod codegen;
pub mod config;
pub mod core;
pub mod image;
pub mod ir;
pub mod loader;
pub mod store;
pub mod x64;

pub use cache::{ArtifactCache, CacheError, CacheState, CacheStats};
pub use codegen::{
    generator_for, CodeArtifact, CodeGenerator, DynamicGenerator, SourceArtifact, SourceEmitter,
    SourceLanguage, StaticLoader,
};
pub use config::{ConfigError, GenerationConfig, GenerationFlags, GenerationMode};
pub use self::core::{CompilationUnit, Fingerprint, GenerationError, LoadError, UnitId};
pub use image::{BinaryImage, ImageBuilder, ImageError, SymbolBinding, SymbolInfo};
pub use ir::{IrError, Module};
pub use loader::{
    precompile, ExecutableHandle, ExternalToolchain, Loaded, RuntimeLoader, ToolchainError,
};
pub use store::{ArtifactStore, DirectoryStore, MemoryStore, StoreError};
