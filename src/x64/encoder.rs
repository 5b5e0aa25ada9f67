// This module wraps the iced-x86 code assembler for the dynamic generator. X64Encoder
// exposes only the instruction shapes the stack-slot lowering needs: moves between
// registers, immediates and rbp-relative frame slots, add/sub with a slot operand,
// compares against zero, jumps to block labels, and the System V frame prologue and
// epilogue. Each basic block gets one lazily created CodeLabel so forward branches can be
// emitted before the target is placed. Code is assembled at address zero; all branches
// are label relative, so the bytes are position independent and identical for identical
// input, which is what lets two independent generators agree on an image.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::*;
use std::collections::{HashMap, HashSet};

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// A branch refers to a block whose label was never placed.
    UnplacedLabel(usize),
    /// Frame offset does not fit a 32-bit displacement.
    FrameTooLarge(usize),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::UnplacedLabel(block) => write!(f, "Label for block {block} never placed"),
            EncodingError::FrameTooLarge(bytes) => write!(f, "Frame of {bytes} bytes is too large"),
        }
    }
}

impl std::error::Error for EncodingError {}

fn asm_err(e: iced_x86::IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// 64-bit general purpose registers in hardware encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gp {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gp {
    /// System V integer argument registers, in order.
    pub const SYSV_ARGS: [Gp; 6] = [Gp::Rdi, Gp::Rsi, Gp::Rdx, Gp::Rcx, Gp::R8, Gp::R9];

    fn to_iced(self) -> AsmRegister64 {
        const GP64_REGS: [AsmRegister64; 16] = [
            rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
            r8, r9, r10, r11, r12, r13, r14, r15,
        ];
        GP64_REGS[self as usize]
    }
}

/// Jump conditions for conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
}

/// x86-64 instruction encoder for one function.
pub struct X64Encoder {
    assembler: CodeAssembler,
    block_labels: HashMap<usize, CodeLabel>,
    placed_blocks: HashSet<usize>,
    instructions: usize,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;

        Ok(Self {
            assembler,
            block_labels: HashMap::new(),
            placed_blocks: HashSet::new(),
            instructions: 0,
        })
    }

    /// Number of machine instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.instructions
    }

    fn emitted(&mut self) -> Result<(), EncodingError> {
        self.instructions += 1;
        Ok(())
    }

    pub fn mov_reg_reg(&mut self, dst: Gp, src: Gp) -> Result<(), EncodingError> {
        self.assembler.mov(dst.to_iced(), src.to_iced()).map_err(asm_err)?;
        self.emitted()
    }

    pub fn mov_reg_imm(&mut self, dst: Gp, imm: i64) -> Result<(), EncodingError> {
        self.assembler.mov(dst.to_iced(), imm).map_err(asm_err)?;
        self.emitted()
    }

    /// `mov dst, qword [rbp + offset]`
    pub fn load_slot(&mut self, dst: Gp, offset: i32) -> Result<(), EncodingError> {
        self.assembler
            .mov(dst.to_iced(), qword_ptr(rbp + offset))
            .map_err(asm_err)?;
        self.emitted()
    }

    /// `mov qword [rbp + offset], src`
    pub fn store_slot(&mut self, offset: i32, src: Gp) -> Result<(), EncodingError> {
        self.assembler
            .mov(qword_ptr(rbp + offset), src.to_iced())
            .map_err(asm_err)?;
        self.emitted()
    }

    /// `add dst, qword [rbp + offset]`
    pub fn add_reg_slot(&mut self, dst: Gp, offset: i32) -> Result<(), EncodingError> {
        self.assembler
            .add(dst.to_iced(), qword_ptr(rbp + offset))
            .map_err(asm_err)?;
        self.emitted()
    }

    /// `sub dst, qword [rbp + offset]`
    pub fn sub_reg_slot(&mut self, dst: Gp, offset: i32) -> Result<(), EncodingError> {
        self.assembler
            .sub(dst.to_iced(), qword_ptr(rbp + offset))
            .map_err(asm_err)?;
        self.emitted()
    }

    pub fn sub_reg_imm(&mut self, dst: Gp, imm: i32) -> Result<(), EncodingError> {
        self.assembler.sub(dst.to_iced(), imm).map_err(asm_err)?;
        self.emitted()
    }

    /// `cmp qword [rbp + offset], imm`
    pub fn cmp_slot_imm(&mut self, offset: i32, imm: i32) -> Result<(), EncodingError> {
        self.assembler
            .cmp(qword_ptr(rbp + offset), imm)
            .map_err(asm_err)?;
        self.emitted()
    }

    pub fn push_reg(&mut self, reg: Gp) -> Result<(), EncodingError> {
        self.assembler.push(reg.to_iced()).map_err(asm_err)?;
        self.emitted()
    }

    pub fn pop_reg(&mut self, reg: Gp) -> Result<(), EncodingError> {
        self.assembler.pop(reg.to_iced()).map_err(asm_err)?;
        self.emitted()
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_err)?;
        self.emitted()
    }

    // ==== LABEL MANAGEMENT FOR CONTROL FLOW ====

    pub fn get_or_create_label_for_block(&mut self, block_id: usize) -> CodeLabel {
        if let Some(&label) = self.block_labels.get(&block_id) {
            label
        } else {
            let label = self.assembler.create_label();
            self.block_labels.insert(block_id, label);
            label
        }
    }

    /// Place the block's label at the current position. An instruction must
    /// follow before the next label is placed.
    pub fn place_label_for_block(&mut self, block_id: usize) -> Result<(), EncodingError> {
        let mut label = self.get_or_create_label_for_block(block_id);
        self.assembler.set_label(&mut label).map_err(asm_err)?;
        self.block_labels.insert(block_id, label);
        self.placed_blocks.insert(block_id);
        Ok(())
    }

    pub fn is_block_placed(&self, block_id: usize) -> bool {
        self.placed_blocks.contains(&block_id)
    }

    pub fn jmp_conditional_to_block(
        &mut self,
        condition: JumpCondition,
        target_block: usize,
    ) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(target_block);

        match condition {
            JumpCondition::Equal => self.assembler.je(label).map_err(asm_err)?,
            JumpCondition::NotEqual => self.assembler.jne(label).map_err(asm_err)?,
        }
        self.emitted()
    }

    pub fn jmp_unconditional_to_block(&mut self, target_block: usize) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(target_block);
        self.assembler.jmp(label).map_err(asm_err)?;
        self.emitted()
    }

    // ==== FRAME ====

    /// `push rbp; mov rbp, rsp; sub rsp, frame_size`
    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        let frame = i32::try_from(frame_size)
            .map_err(|_| EncodingError::FrameTooLarge(frame_size as usize))?;
        self.push_reg(Gp::Rbp)?;
        self.mov_reg_reg(Gp::Rbp, Gp::Rsp)?;
        if frame > 0 {
            self.sub_reg_imm(Gp::Rsp, frame)?;
        }
        Ok(())
    }

    /// `mov rsp, rbp; pop rbp; ret`
    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        self.mov_reg_reg(Gp::Rsp, Gp::Rbp)?;
        self.pop_reg(Gp::Rbp)?;
        self.ret()
    }

    /// Assemble into position independent machine code.
    pub fn finalize(mut self) -> Result<Vec<u8>, EncodingError> {
        if let Some(&block) = self
            .block_labels
            .keys()
            .filter(|block| !self.is_block_placed(**block))
            .min()
        {
            return Err(EncodingError::UnplacedLabel(block));
        }

        self.assembler.assemble(0).map_err(asm_err)
    }
}
