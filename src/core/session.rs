// Arena-backed lowering session used by the dynamic generator. One session lives for the
// duration of a single generate() call: per-function tables (frame slot offsets, block
// order) are allocated from a bumpalo arena and released together when the call returns,
// so lowering never pays for individual frees. The session also accumulates statistics
// about the lowering (functions, instructions by opcode, code bytes, largest function),
// which the generator logs at debug level once the image is built. Interior mutability
// with RefCell keeps the session shareable by reference within one thread; sessions are
// never shared across threads.

//! Arena-based lowering session.

use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

pub struct GenerationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> GenerationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice in the session arena, filled by `f(index)`.
    pub fn alloc_slice_with<T, F>(&self, len: usize, f: F) -> &'arena mut [T]
    where
        F: FnMut(usize) -> T,
    {
        self.arena.alloc_slice_fill_with(len, f)
    }

    pub fn record_function_lowered(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_lowered += 1;
        stats.total_code_size += code_size;

        if stats.largest_function_size < code_size {
            stats.largest_function_size = code_size;
            stats.largest_function_name = name.to_string();
        }
    }

    pub fn record_instruction_lowered(&self, opcode: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_lowered += 1;
        *stats.instruction_counts.entry(opcode).or_insert(0) += 1;
    }

    pub fn record_external(&self) {
        self.stats.borrow_mut().externals += 1;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub functions_lowered: usize,
    pub instructions_lowered: usize,
    pub instruction_counts: HashMap<&'static str, usize>,
    /// Bytes of machine code, excluding alignment padding.
    pub total_code_size: usize,
    pub largest_function_size: usize,
    pub largest_function_name: String,
    pub externals: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lowering statistics:")?;
        writeln!(f, "  Functions lowered: {}", self.functions_lowered)?;
        writeln!(f, "  Instructions lowered: {}", self.instructions_lowered)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  External declarations: {}", self.externals)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} bytes)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (opcode, count) in sorted {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}
