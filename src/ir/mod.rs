//! Module IR handed to the code generators.
//!
//! Units arrive here already type-checked; this module only has to hold the
//! resolved control flow in a form the generators can walk. The textual
//! format is line oriented:
//!
//! ```text
//! ; Comments start with semicolon
//! add3(%a, %b, %c) {
//! entry:
//!     %t = add %a, %b
//!     %r = add %t, %c
//!     ret %r
//! }
//! ext_func(%x)!
//! ```
//!
//! Storage follows the flat layout used throughout the compiler: functions
//! own index ranges into the module-wide block and instruction arrays.

use std::fmt::Write as _;
use thiserror::Error;

pub mod parser;

/// Index of a value inside its function. Parameters come first.
pub type ValueIdx = u32;

/// Index of a block relative to the first block of its function.
pub type BlockIdx = u32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown opcode '{opcode}'")]
    UnknownOpcode { line: usize, opcode: String },

    #[error("function '{function}': duplicate definition")]
    DuplicateFunction { function: String },

    #[error("function '{function}': value '%{value}' defined twice")]
    DuplicateValue { function: String, value: String },

    #[error("function '{function}': block '{block}' defined twice")]
    DuplicateBlock { function: String, block: String },

    #[error("function '{function}': use of undefined value '%{value}'")]
    UndefinedValue { function: String, value: String },

    #[error("line {line}: '%{value}' in function '{function}' is not defined on every path to this use")]
    UseBeforeDefinition {
        line: usize,
        function: String,
        value: String,
    },

    #[error("function '{function}': branch to undefined block '^{block}'")]
    UndefinedBlock { function: String, block: String },

    #[error("function '{function}': block '{block}' does not end with a terminator")]
    MissingTerminator { function: String, block: String },

    #[error("function '{function}': instruction after terminator in block '{block}'")]
    InstructionAfterTerminator { function: String, block: String },

    #[error("function '{function}' has no blocks")]
    EmptyFunction { function: String },

    #[error("invalid unit name '{name}'")]
    InvalidName { name: String },

    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Parsed module: the IR of one compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Declared with `!`, defined elsewhere.
    External,
    Global,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    pub param_count: u32,
    /// Names of every value, parameters first, indexed by [`ValueIdx`].
    pub value_names: Vec<String>,
    pub block_begin_idx: u32,
    pub block_end_idx: u32,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.linkage == Linkage::External
    }

    pub fn value_count(&self) -> u32 {
        self.value_names.len() as u32
    }

    pub fn params(&self) -> &[String] {
        &self.value_names[..self.param_count as usize]
    }

    pub fn value_name(&self, idx: ValueIdx) -> &str {
        &self.value_names[idx as usize]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub inst_begin_idx: u32,
    pub inst_end_idx: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    /// Defined value, `None` for terminators.
    pub result: Option<ValueIdx>,
    pub op: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Const(i64),
    Add(ValueIdx, ValueIdx),
    Sub(ValueIdx, ValueIdx),
    Copy(ValueIdx),
    Ret(ValueIdx),
    Br(BlockIdx),
    CondBr {
        cond: ValueIdx,
        then_block: BlockIdx,
        else_block: BlockIdx,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub is_terminator: bool,
    pub is_def: bool,
}

impl Operation {
    pub const fn info(self) -> OpInfo {
        use Operation::*;
        match self {
            Const(_) => OpInfo { name: "const", is_terminator: false, is_def: true },
            Add(..) => OpInfo { name: "add", is_terminator: false, is_def: true },
            Sub(..) => OpInfo { name: "sub", is_terminator: false, is_def: true },
            Copy(_) => OpInfo { name: "copy", is_terminator: false, is_def: true },
            Ret(_) => OpInfo { name: "ret", is_terminator: true, is_def: false },
            Br(_) => OpInfo { name: "br", is_terminator: true, is_def: false },
            CondBr { .. } => OpInfo { name: "condbr", is_terminator: true, is_def: false },
        }
    }

    pub fn value_operands(self) -> Vec<ValueIdx> {
        match self {
            Operation::Const(_) | Operation::Br(_) => Vec::new(),
            Operation::Add(a, b) | Operation::Sub(a, b) => vec![a, b],
            Operation::Copy(v) | Operation::Ret(v) => vec![v],
            Operation::CondBr { cond, .. } => vec![cond],
        }
    }

    pub fn successors(self) -> Vec<BlockIdx> {
        match self {
            Operation::Br(target) => vec![target],
            Operation::CondBr { then_block, else_block, .. } => vec![then_block, else_block],
            _ => Vec::new(),
        }
    }
}

impl Module {
    pub fn parse(text: &str) -> Result<Self, IrError> {
        parser::parse_module(text)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn defined_functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|f| !f.is_declaration())
    }

    pub fn blocks_of(&self, func: &Function) -> &[Block] {
        &self.blocks[func.block_begin_idx as usize..func.block_end_idx as usize]
    }

    pub fn insts_of(&self, block: &Block) -> &[Inst] {
        &self.insts[block.inst_begin_idx as usize..block.inst_end_idx as usize]
    }

    /// Canonical dump of the module, one fact per line.
    pub fn print(&self) -> String {
        let mut output = String::new();
        output.push_str("Printing IR\n");

        for func in &self.functions {
            match func.linkage {
                Linkage::External => {
                    let _ = writeln!(output, "Extern function {}", func.name);
                }
                Linkage::Local => {
                    let _ = writeln!(output, "Local function {}", func.name);
                }
                Linkage::Global => {
                    let _ = writeln!(output, "Function {}", func.name);
                }
            }

            for param in func.params() {
                let _ = writeln!(output, "Argument {}", param);
            }

            let blocks = self.blocks_of(func);
            for block in blocks {
                let _ = writeln!(output, "Block {}", block.name);

                for inst in self.insts_of(block) {
                    let info = inst.op.info();
                    match inst.result {
                        Some(result) => {
                            let _ = writeln!(output, "Value {} ({})", func.value_name(result), info.name);
                        }
                        None => {
                            let _ = writeln!(output, "Value ({})", info.name);
                        }
                    }

                    for operand in inst.op.value_operands() {
                        let _ = writeln!(output, "Op {}", func.value_name(operand));
                    }
                    for succ in inst.op.successors() {
                        let _ = writeln!(output, "Op ^{}", blocks[succ as usize].name);
                    }
                    if let Operation::Const(imm) = inst.op {
                        let _ = writeln!(output, "Op ${}", imm);
                    }
                }
            }
        }

        output
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.print())
    }
}
