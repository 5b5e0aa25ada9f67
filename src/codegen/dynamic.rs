// In-memory generation of x86-64 images. Every defined function is lowered with a plain
// stack-slot scheme: each IR value owns one 8-byte slot below rbp, arguments are spilled
// from the System V integer registers in the prologue, and every instruction loads its
// operands into rax, computes, and stores the result back. No register allocation, no
// liveness, no folding. The point is a lowering that is obviously correct and fully
// deterministic, so the same unit always produces the same bytes no matter which thread or
// which cache generated it. Per-function slot tables come from the session arena; the
// session's statistics are logged once the image is built.

//! Dynamic bytecode generation.

use super::{CodeArtifact, CodeGenerator};
use crate::config::GenerationMode;
use crate::core::{CompilationUnit, GenerationError, GenerationSession};
use crate::image::ImageBuilder;
use crate::ir::{Function, Linkage, Module, Operation, ValueIdx};
use crate::x64::{EncodingError, Gp, JumpCondition, X64Encoder};
use bumpalo::Bump;

const SLOT_SIZE: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicGenerator;

impl DynamicGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Lower one function to position independent machine code.
    fn lower_function(
        &self,
        session: &GenerationSession<'_>,
        module: &Module,
        func: &Function,
    ) -> Result<Vec<u8>, String> {
        if func.param_count as usize > Gp::SYSV_ARGS.len() {
            return Err(format!(
                "{} parameters, at most {} are passed in registers",
                func.param_count,
                Gp::SYSV_ARGS.len()
            ));
        }

        let value_count = func.value_count() as usize;
        let frame_bytes = value_count
            .checked_mul(SLOT_SIZE)
            .map(|bytes| (bytes + 15) & !15)
            .filter(|bytes| *bytes <= i32::MAX as usize)
            .ok_or_else(|| format!("{} values do not fit a stack frame", value_count))?;
        let slots: &[i32] = session.alloc_slice_with(value_count, |idx| -(((idx + 1) * SLOT_SIZE) as i32));
        let slot = |value: ValueIdx| slots[value as usize];

        let enc_err = |e: EncodingError| e.to_string();
        let mut encoder = X64Encoder::new().map_err(enc_err)?;
        encoder.emit_prologue(frame_bytes as u32).map_err(enc_err)?;
        for (idx, reg) in Gp::SYSV_ARGS.iter().take(func.param_count as usize).enumerate() {
            encoder.store_slot(slots[idx], *reg).map_err(enc_err)?;
        }

        for (block_idx, block) in module.blocks_of(func).iter().enumerate() {
            encoder.place_label_for_block(block_idx).map_err(enc_err)?;
            log::trace!("📦 Lowering block {} of {}", block.name, func.name);

            for inst in module.insts_of(block) {
                let info = inst.op.info();
                session.record_instruction_lowered(info.name);

                let result = match (info.is_def, inst.result) {
                    (true, Some(result)) => Some(slot(result)),
                    (false, _) => None,
                    (true, None) => {
                        return Err(format!("'{}' in block {} defines no value", info.name, block.name));
                    }
                };

                match (inst.op, result) {
                    (Operation::Const(imm), Some(dst)) => {
                        encoder.mov_reg_imm(Gp::Rax, imm).map_err(enc_err)?;
                        encoder.store_slot(dst, Gp::Rax).map_err(enc_err)?;
                    }
                    (Operation::Add(lhs, rhs), Some(dst)) => {
                        encoder.load_slot(Gp::Rax, slot(lhs)).map_err(enc_err)?;
                        encoder.add_reg_slot(Gp::Rax, slot(rhs)).map_err(enc_err)?;
                        encoder.store_slot(dst, Gp::Rax).map_err(enc_err)?;
                    }
                    (Operation::Sub(lhs, rhs), Some(dst)) => {
                        encoder.load_slot(Gp::Rax, slot(lhs)).map_err(enc_err)?;
                        encoder.sub_reg_slot(Gp::Rax, slot(rhs)).map_err(enc_err)?;
                        encoder.store_slot(dst, Gp::Rax).map_err(enc_err)?;
                    }
                    (Operation::Copy(src), Some(dst)) => {
                        encoder.load_slot(Gp::Rax, slot(src)).map_err(enc_err)?;
                        encoder.store_slot(dst, Gp::Rax).map_err(enc_err)?;
                    }
                    (Operation::Ret(value), _) => {
                        encoder.load_slot(Gp::Rax, slot(value)).map_err(enc_err)?;
                        encoder.emit_epilogue().map_err(enc_err)?;
                    }
                    (Operation::Br(target), _) => {
                        encoder
                            .jmp_unconditional_to_block(target as usize)
                            .map_err(enc_err)?;
                    }
                    (
                        Operation::CondBr {
                            cond,
                            then_block,
                            else_block,
                        },
                        _,
                    ) => {
                        encoder.cmp_slot_imm(slot(cond), 0).map_err(enc_err)?;
                        encoder
                            .jmp_conditional_to_block(JumpCondition::NotEqual, then_block as usize)
                            .map_err(enc_err)?;
                        encoder
                            .jmp_unconditional_to_block(else_block as usize)
                            .map_err(enc_err)?;
                    }
                    (op, None) => {
                        return Err(format!("'{}' lowered without a result slot", op.info().name));
                    }
                }
            }
        }

        let instructions = encoder.instruction_count();
        let code = encoder.finalize().map_err(enc_err)?;
        log::trace!(
            "🔧 Lowered {}: {} machine instructions, {} bytes",
            func.name,
            instructions,
            code.len()
        );
        Ok(code)
    }
}

impl CodeGenerator for DynamicGenerator {
    fn mode(&self) -> GenerationMode {
        GenerationMode::DynamicBytecode
    }

    fn generate(&self, unit: &CompilationUnit) -> Result<CodeArtifact, GenerationError> {
        let arena = Bump::new();
        let session = GenerationSession::new(&arena);
        let module = unit.module();
        let mut builder = ImageBuilder::new(unit.id());

        for func in &module.functions {
            if func.is_declaration() {
                builder.add_external(&func.name);
                session.record_external();
                continue;
            }

            let code = self
                .lower_function(&session, module, func)
                .map_err(|reason| GenerationError::Lowering {
                    unit: unit.id().clone(),
                    function: func.name.clone(),
                    reason,
                })?;
            session.record_function_lowered(&func.name, code.len());
            builder.add_function(&func.name, &code, func.linkage == Linkage::Local);
        }

        let image = builder.build().map_err(|e| GenerationError::Lowering {
            unit: unit.id().clone(),
            function: String::new(),
            reason: e.to_string(),
        })?;

        log::debug!("generated {} ({} bytes)\n{}", unit.id(), image.len(), session.stats());
        Ok(CodeArtifact::Dynamic(image))
    }
}
