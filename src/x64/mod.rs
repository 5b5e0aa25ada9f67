//! x86-64 architecture-specific components.
//!
//! - Instruction encoding using iced-x86
//! - System V argument register order for the stack-slot lowering

pub mod encoder;

pub use encoder::{EncodingError, Gp, JumpCondition, X64Encoder};
