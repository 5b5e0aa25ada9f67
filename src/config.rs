//! Generation mode resolution.
//!
//! A process picks exactly one [`GenerationMode`] at startup from two boolean
//! settings: whether the runtime is static (images come from a store) and
//! whether binary images are generated at all (otherwise C source is
//! emitted). Dynamic generation is what remains when neither of the other two
//! applies. The mode is a plain `Copy` value; hand it to whatever needs it.
//!
//! # Environment
//!
//! | Variable | Meaning |
//! |---|---|
//! | `MODGEN_STATIC_RUNTIME` | boolean, default `false` |
//! | `MODGEN_GENERATE_BYTECODE` | boolean, default `true` |
//! | `MODGEN_MODE` | `static`, `dynamic` or `source`; must agree with the booleans |
//! | `MODGEN_STORE` | artifact store directory |
//! | `MODGEN_WAIT_TIMEOUT_MS` | bound on waiting for another caller's generation |
//! | `MODGEN_VERIFY_FINGERPRINT` | boolean, default `true` |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_STATIC_RUNTIME: &str = "MODGEN_STATIC_RUNTIME";
pub const ENV_GENERATE_BYTECODE: &str = "MODGEN_GENERATE_BYTECODE";
pub const ENV_MODE: &str = "MODGEN_MODE";
pub const ENV_STORE: &str = "MODGEN_STORE";
pub const ENV_WAIT_TIMEOUT_MS: &str = "MODGEN_WAIT_TIMEOUT_MS";
pub const ENV_VERIFY_FINGERPRINT: &str = "MODGEN_VERIFY_FINGERPRINT";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{variable}: '{value}' is not a boolean")]
    InvalidFlag { variable: String, value: String },

    #[error("unknown generation mode '{0}' (expected static, dynamic or source)")]
    InvalidMode(String),

    #[error("{variable}: '{value}' is not a timeout in milliseconds")]
    InvalidTimeout { variable: String, value: String },

    #[error("generation mode invariant violated: {0}")]
    InvariantViolation(String),

    #[error("static bytecode mode requires an artifact store")]
    MissingStore,

    #[error("artifact store {path} is unusable: {reason}")]
    StoreUnavailable { path: PathBuf, reason: String },
}

/// The single active code generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationMode {
    /// Precompiled images are loaded from persistent storage.
    StaticBytecode,
    /// Images are generated in memory on demand.
    DynamicBytecode,
    /// C source is emitted for an external toolchain.
    SourceText,
}

impl GenerationMode {
    pub const ALL: [GenerationMode; 3] = [
        GenerationMode::StaticBytecode,
        GenerationMode::DynamicBytecode,
        GenerationMode::SourceText,
    ];

    pub fn is_static(self) -> bool {
        self == GenerationMode::StaticBytecode
    }

    pub fn is_source_text(self) -> bool {
        self == GenerationMode::SourceText
    }

    pub fn is_dynamic(self) -> bool {
        self == GenerationMode::DynamicBytecode
    }

    /// Build a mode from three independently computed predicates.
    ///
    /// Exactly one predicate must hold.
    pub fn from_predicates(
        is_static: bool,
        is_source_text: bool,
        is_dynamic: bool,
    ) -> Result<Self, ConfigError> {
        match (is_static, is_source_text, is_dynamic) {
            (true, false, false) => Ok(GenerationMode::StaticBytecode),
            (false, true, false) => Ok(GenerationMode::SourceText),
            (false, false, true) => Ok(GenerationMode::DynamicBytecode),
            _ => Err(ConfigError::InvariantViolation(format!(
                "static={}, source={}, dynamic={}: exactly one must hold",
                is_static, is_source_text, is_dynamic
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GenerationMode::StaticBytecode => "static",
            GenerationMode::DynamicBytecode => "dynamic",
            GenerationMode::SourceText => "source",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(GenerationMode::StaticBytecode),
            "dynamic" => Ok(GenerationMode::DynamicBytecode),
            "source" => Ok(GenerationMode::SourceText),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// The two process-start booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationFlags {
    pub runtime_static: bool,
    pub generate_bytecode: bool,
}

impl Default for GenerationFlags {
    fn default() -> Self {
        Self {
            runtime_static: false,
            generate_bytecode: true,
        }
    }
}

impl GenerationFlags {
    /// Total over all four combinations; a static runtime wins over source
    /// emission.
    pub fn resolve(self) -> GenerationMode {
        if self.runtime_static {
            GenerationMode::StaticBytecode
        } else if !self.generate_bytecode {
            GenerationMode::SourceText
        } else {
            GenerationMode::DynamicBytecode
        }
    }
}

/// Everything the loader needs from process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    pub flags: GenerationFlags,
    /// Explicit mode; when present it must agree with explicitly set flags.
    pub explicit_mode: Option<GenerationMode>,
    pub store_root: Option<PathBuf>,
    pub wait_timeout: Option<Duration>,
    pub verify_fingerprint: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            flags: GenerationFlags::default(),
            explicit_mode: None,
            store_root: None,
            wait_timeout: None,
            verify_fingerprint: true,
        }
    }
}

impl GenerationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let runtime_static = lookup(ENV_STATIC_RUNTIME)
            .map(|v| parse_bool(ENV_STATIC_RUNTIME, &v))
            .transpose()?;
        let generate_bytecode = lookup(ENV_GENERATE_BYTECODE)
            .map(|v| parse_bool(ENV_GENERATE_BYTECODE, &v))
            .transpose()?;
        let explicit_mode = lookup(ENV_MODE)
            .map(|v| v.parse::<GenerationMode>())
            .transpose()?;

        let mut config = GenerationConfig {
            flags: GenerationFlags::default(),
            explicit_mode,
            ..Default::default()
        };

        match explicit_mode {
            Some(mode) => {
                // Flags that were set must not contradict the explicit mode. The
                // bytecode flag is irrelevant once the runtime is static.
                let static_conflict = runtime_static.is_some_and(|s| s != mode.is_static());
                let source_conflict = !mode.is_static()
                    && generate_bytecode.is_some_and(|g| !g != mode.is_source_text());
                if static_conflict || source_conflict {
                    return Err(ConfigError::InvariantViolation(format!(
                        "{}={} contradicts {}={:?}, {}={:?}",
                        ENV_MODE,
                        mode,
                        ENV_STATIC_RUNTIME,
                        runtime_static,
                        ENV_GENERATE_BYTECODE,
                        generate_bytecode
                    )));
                }
                config.flags = flags_for(mode);
            }
            None => {
                config.flags = GenerationFlags {
                    runtime_static: runtime_static.unwrap_or(false),
                    generate_bytecode: generate_bytecode.unwrap_or(true),
                };
            }
        }

        config.store_root = lookup(ENV_STORE).filter(|v| !v.is_empty()).map(PathBuf::from);
        config.wait_timeout = lookup(ENV_WAIT_TIMEOUT_MS)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::InvalidTimeout {
                        variable: ENV_WAIT_TIMEOUT_MS.to_string(),
                        value: v.clone(),
                    })
            })
            .transpose()?;
        config.verify_fingerprint = lookup(ENV_VERIFY_FINGERPRINT)
            .map(|v| parse_bool(ENV_VERIFY_FINGERPRINT, &v))
            .transpose()?
            .unwrap_or(true);

        Ok(config)
    }

    pub fn mode(&self) -> GenerationMode {
        self.flags.resolve()
    }

    pub fn with_mode(mut self, mode: GenerationMode) -> Self {
        self.flags = flags_for(mode);
        self.explicit_mode = Some(mode);
        self
    }
}

/// Flags that resolve to `mode`.
pub fn flags_for(mode: GenerationMode) -> GenerationFlags {
    match mode {
        GenerationMode::StaticBytecode => GenerationFlags {
            runtime_static: true,
            generate_bytecode: true,
        },
        GenerationMode::DynamicBytecode => GenerationFlags {
            runtime_static: false,
            generate_bytecode: true,
        },
        GenerationMode::SourceText => GenerationFlags {
            runtime_static: false,
            generate_bytecode: false,
        },
    }
}

fn parse_bool(variable: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            variable: variable.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_exactly_one_predicate_for_every_flag_combination() {
        for runtime_static in [false, true] {
            for generate_bytecode in [false, true] {
                let mode = GenerationFlags {
                    runtime_static,
                    generate_bytecode,
                }
                .resolve();
                let held = [mode.is_static(), mode.is_dynamic(), mode.is_source_text()]
                    .iter()
                    .filter(|p| **p)
                    .count();
                assert_eq!(held, 1, "{runtime_static}/{generate_bytecode} -> {mode}");
                assert_eq!(mode.is_dynamic(), !mode.is_source_text() && !mode.is_static());
            }
        }
    }

    #[test]
    fn test_resolution_table() {
        let resolve = |s, g| {
            GenerationFlags {
                runtime_static: s,
                generate_bytecode: g,
            }
            .resolve()
        };
        assert_eq!(resolve(false, true), GenerationMode::DynamicBytecode);
        assert_eq!(resolve(false, false), GenerationMode::SourceText);
        assert_eq!(resolve(true, true), GenerationMode::StaticBytecode);
        assert_eq!(resolve(true, false), GenerationMode::StaticBytecode);
    }

    #[test]
    fn test_from_predicates() {
        for mode in GenerationMode::ALL {
            assert_eq!(
                GenerationMode::from_predicates(mode.is_static(), mode.is_source_text(), mode.is_dynamic()),
                Ok(mode)
            );
        }
        assert!(matches!(
            GenerationMode::from_predicates(false, false, false),
            Err(ConfigError::InvariantViolation(_))
        ));
        assert!(matches!(
            GenerationMode::from_predicates(true, true, false),
            Err(ConfigError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_env_defaults_to_dynamic() {
        let config = GenerationConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.mode(), GenerationMode::DynamicBytecode);
        assert!(config.verify_fingerprint);
        assert_eq!(config.store_root, None);
        assert_eq!(config.wait_timeout, None);
    }

    #[test]
    fn test_env_flags() {
        let config = GenerationConfig::from_lookup(lookup(&[
            (ENV_STATIC_RUNTIME, "yes"),
            (ENV_STORE, "/var/lib/modgen"),
            (ENV_WAIT_TIMEOUT_MS, "250"),
        ]))
        .unwrap();
        assert_eq!(config.mode(), GenerationMode::StaticBytecode);
        assert_eq!(config.store_root, Some(PathBuf::from("/var/lib/modgen")));
        assert_eq!(config.wait_timeout, Some(Duration::from_millis(250)));

        let config =
            GenerationConfig::from_lookup(lookup(&[(ENV_GENERATE_BYTECODE, "False")])).unwrap();
        assert_eq!(config.mode(), GenerationMode::SourceText);
    }

    #[test]
    fn test_env_explicit_mode() {
        let config = GenerationConfig::from_lookup(lookup(&[(ENV_MODE, "source")])).unwrap();
        assert_eq!(config.mode(), GenerationMode::SourceText);

        let config = GenerationConfig::from_lookup(lookup(&[
            (ENV_MODE, "static"),
            (ENV_STATIC_RUNTIME, "1"),
        ]))
        .unwrap();
        assert_eq!(config.mode(), GenerationMode::StaticBytecode);
    }

    #[test]
    fn test_env_contradictions_are_invariant_violations() {
        let err = GenerationConfig::from_lookup(lookup(&[
            (ENV_MODE, "dynamic"),
            (ENV_STATIC_RUNTIME, "true"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvariantViolation(_)), "{err:?}");

        let err = GenerationConfig::from_lookup(lookup(&[
            (ENV_MODE, "source"),
            (ENV_GENERATE_BYTECODE, "true"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvariantViolation(_)), "{err:?}");
    }

    #[test]
    fn test_env_malformed_values() {
        let err = GenerationConfig::from_lookup(lookup(&[(ENV_STATIC_RUNTIME, "maybe")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidFlag {
                variable: ENV_STATIC_RUNTIME.to_string(),
                value: "maybe".to_string()
            }
        );

        let err = GenerationConfig::from_lookup(lookup(&[(ENV_MODE, "jit")])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidMode("jit".to_string()));

        let err = GenerationConfig::from_lookup(lookup(&[(ENV_WAIT_TIMEOUT_MS, "-5")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimeout { .. }));
    }
}
