// Compilation unit identity. A unit is what the loader is asked to make executable: a
// qualified module name plus the SHA-256 fingerprint of its IR text, together with the
// parsed IR itself. UnitId (name + fingerprint) is the key everything downstream uses:
// the artifact cache memoizes per UnitId, images record the UnitId that produced them,
// and the static loader checks a stored image's recorded fingerprint against the unit
// being requested. Units are immutable and cheap to clone (the IR sits behind an Arc),
// so concurrent requesters can each hold their own copy.

//! Compilation units and their identities.

use crate::ir::{IrError, Module};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// SHA-256 digest of a unit's IR source.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_slice());
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// First 12 hex digits, for logs and display.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (idx, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[idx * 2..idx * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identity of a compilation unit: qualified name plus IR fingerprint.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId {
    name: Arc<str>,
    fingerprint: Fingerprint,
}

impl UnitId {
    pub fn new(name: &str, fingerprint: Fingerprint) -> Result<Self, IrError> {
        if !is_qualified_name(name) {
            return Err(IrError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(Self {
            name: Arc::from(name),
            fingerprint,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", self)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.fingerprint.short())
    }
}

/// Dot separated identifiers, e.g. `Cal.Core.Prelude`.
pub fn is_qualified_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// A resolved unit ready for code generation.
#[derive(Clone)]
pub struct CompilationUnit {
    id: UnitId,
    module: Arc<Module>,
}

impl CompilationUnit {
    /// Parse `source` and fingerprint it under `name`.
    pub fn from_source(name: &str, source: &str) -> Result<Self, IrError> {
        let id = UnitId::new(name, Fingerprint::of(source.as_bytes()))?;
        let module = Module::parse(source)?;
        log::debug!(
            "unit {} parsed: {} functions, {} blocks",
            id,
            module.functions.len(),
            module.blocks.len()
        );
        Ok(Self {
            id,
            module: Arc::new(module),
        })
    }

    /// Load a unit from a file; the file stem becomes the unit name.
    pub fn from_path(path: &Path) -> Result<Self, IrError> {
        let source = std::fs::read_to_string(path).map_err(|e| IrError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| IrError::InvalidName {
                name: path.display().to_string(),
            })?;
        Self::from_source(name, &source)
    }

    /// Same as [`from_path`](Self::from_path) with an explicit unit name.
    pub fn from_path_named(name: &str, path: &Path) -> Result<Self, IrError> {
        let source = std::fs::read_to_string(path).map_err(|e| IrError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_source(name, &source)
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.id.fingerprint()
    }

    pub fn module(&self) -> &Module {
        &self.module
    }
}

impl fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("id", &self.id)
            .field("functions", &self.module.functions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "id(%x) {\nentry:\n  ret %x\n}\n";

    #[test]
    fn test_fingerprint_hex_round_trip() {
        let fp = Fingerprint::of(SRC.as_bytes());
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(fp.short().len(), 12);
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn test_identity_depends_on_content() {
        let a = CompilationUnit::from_source("Foo", SRC).unwrap();
        let b = CompilationUnit::from_source("Foo", SRC).unwrap();
        let c = CompilationUnit::from_source("Foo", "id(%y) {\nentry:\n  ret %y\n}\n").unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.name(), "Foo");
        assert!(a.id().to_string().starts_with("Foo#"));
    }

    #[test]
    fn test_qualified_names() {
        assert!(is_qualified_name("Cal.Core.Prelude"));
        assert!(is_qualified_name("_private"));
        assert!(!is_qualified_name(""));
        assert!(!is_qualified_name("Foo..Bar"));
        assert!(!is_qualified_name("9lives"));
        assert!(!is_qualified_name("Foo#v1"));

        let err = CompilationUnit::from_source("bad name", SRC).unwrap_err();
        assert!(matches!(err, IrError::InvalidName { .. }));
    }
}
