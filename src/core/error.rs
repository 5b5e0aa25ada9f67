// Error taxonomy for artifact generation and loading, built with thiserror like the rest of
// the crate. GenerationError is what a code generator (static loader, dynamic generator,
// source emitter) reports; it is Clone because the artifact cache memoizes a failure and
// hands the same error to every current and future requester of that unit. The variants
// separate deployment defects (a precompiled artifact that is absent or stale) from code
// level failures (lowering or emission of unsupported IR). LoadError is what the runtime
// loader surfaces to its caller: missing precompiled artifacts keep their own variant so
// they are never confused with ordinary generation failures, and waits bounded by a
// timeout report Timeout instead of a failure.

//! Error types for generation and loading.

use crate::config::ConfigError;
use crate::core::unit::UnitId;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single generation attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("no precompiled artifact for unit {unit}")]
    MissingPrecompiledArtifact { unit: UnitId },

    #[error("precompiled artifact for unit {unit} is corrupt: {reason}")]
    CorruptArtifact { unit: UnitId, reason: String },

    #[error("precompiled artifact for unit {unit} was built from {found}")]
    StaleArtifact { unit: UnitId, found: String },

    #[error("artifact store failed for unit {unit}: {reason}")]
    Store { unit: UnitId, reason: String },

    #[error("lowering of {unit} failed in function '{function}': {reason}")]
    Lowering {
        unit: UnitId,
        function: String,
        reason: String,
    },

    #[error("source emission of {unit} failed in function '{function}': {reason}")]
    Emission {
        unit: UnitId,
        function: String,
        reason: String,
    },

    #[error("generator panicked while building {unit}")]
    GeneratorPanicked { unit: UnitId },
}

impl GenerationError {
    pub fn unit(&self) -> &UnitId {
        match self {
            GenerationError::MissingPrecompiledArtifact { unit }
            | GenerationError::CorruptArtifact { unit, .. }
            | GenerationError::StaleArtifact { unit, .. }
            | GenerationError::Store { unit, .. }
            | GenerationError::Lowering { unit, .. }
            | GenerationError::Emission { unit, .. }
            | GenerationError::GeneratorPanicked { unit } => unit,
        }
    }

    /// Deployment defects: the store was not prepared for this unit.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            GenerationError::MissingPrecompiledArtifact { .. } | GenerationError::StaleArtifact { .. }
        )
    }
}

/// Errors surfaced by [`RuntimeLoader`](crate::loader::RuntimeLoader).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("missing precompiled artifact for unit {unit}")]
    MissingPrecompiledArtifact { unit: UnitId },

    #[error("generation failed: {0}")]
    GenerationFailure(GenerationError),

    #[error("timed out after {waited:?} waiting for in-flight generation of {unit}")]
    Timeout { unit: UnitId, waited: Duration },

    #[error("invalid image for unit {unit}: {reason}")]
    InvalidImage { unit: UnitId, reason: String },

    #[error("external toolchain failed for unit {unit}: {reason}")]
    Toolchain { unit: UnitId, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<GenerationError> for LoadError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::MissingPrecompiledArtifact { unit } => {
                LoadError::MissingPrecompiledArtifact { unit }
            }
            other => LoadError::GenerationFailure(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::unit::Fingerprint;

    fn unit() -> UnitId {
        UnitId::new("Foo", Fingerprint::of(b"v1")).unwrap()
    }

    #[test]
    fn test_missing_artifact_keeps_its_own_variant() {
        let err: LoadError = GenerationError::MissingPrecompiledArtifact { unit: unit() }.into();
        assert_eq!(err, LoadError::MissingPrecompiledArtifact { unit: unit() });

        let lowering = GenerationError::Lowering {
            unit: unit(),
            function: "f".to_string(),
            reason: "too many parameters".to_string(),
        };
        let err: LoadError = lowering.clone().into();
        assert_eq!(err, LoadError::GenerationFailure(lowering));
    }

    #[test]
    fn test_fatal_configuration() {
        assert!(GenerationError::MissingPrecompiledArtifact { unit: unit() }.is_fatal_configuration());
        assert!(!GenerationError::GeneratorPanicked { unit: unit() }.is_fatal_configuration());
    }

    #[test]
    fn test_messages_name_the_unit() {
        let err = GenerationError::MissingPrecompiledArtifact { unit: unit() };
        assert!(err.to_string().contains("Foo#"), "{err}");
        assert_eq!(err.unit(), &unit());

        let emission = GenerationError::Emission {
            unit: unit(),
            function: "int".to_string(),
            reason: "reserved".to_string(),
        };
        assert_eq!(emission.unit().name(), "Foo");
    }
}
