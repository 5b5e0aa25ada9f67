// Central hub for the pieces every generation strategy shares: the identity of a
// compilation unit (qualified name plus SHA-256 fingerprint of its IR), the error
// taxonomy for generation and loading, and the arena-backed session that the dynamic
// generator lowers functions in. Nothing here knows which generation mode is active;
// the mode is resolved in `config` and threaded explicitly through `loader`.

//! Shared infrastructure: unit identity, errors, lowering sessions.

pub mod error;
pub mod session;
pub mod unit;

pub use error::{GenerationError, LoadError};
pub use session::{GenerationSession, SessionStats};
pub use unit::{is_qualified_name, CompilationUnit, Fingerprint, UnitId};
