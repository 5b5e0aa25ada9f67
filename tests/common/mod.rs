//! Shared helpers for tests that check what generated code computes.
//!
//! [`evaluate`] interprets a function of the module IR directly and is the
//! reference every pipeline is compared against. [`execute`] runs lowered
//! machine code by decoding it with iced-x86 and stepping through the small
//! instruction subset the stack-slot lowering produces.

#![allow(dead_code)]

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use modgen::ir::{Module, Operation, ValueIdx};
use std::collections::HashMap;

const STEP_LIMIT: usize = 100_000;

/// Run `name` from `module` on `args` with wrapping 64-bit arithmetic.
pub fn evaluate(module: &Module, name: &str, args: &[i64]) -> i64 {
    let func = module
        .function(name)
        .unwrap_or_else(|| panic!("no function '{name}'"));
    assert_eq!(args.len(), func.param_count as usize, "argument count for {name}");

    let mut values: Vec<Option<i64>> = vec![None; func.value_count() as usize];
    for (slot, arg) in values.iter_mut().zip(args) {
        *slot = Some(*arg);
    }
    let read = |values: &[Option<i64>], v: ValueIdx| {
        values[v as usize].unwrap_or_else(|| panic!("%{} read before it was written", func.value_name(v)))
    };

    let blocks = module.blocks_of(func);
    let mut block = 0usize;
    for _ in 0..STEP_LIMIT {
        let mut next = None;
        for inst in module.insts_of(&blocks[block]) {
            let value = match inst.op {
                Operation::Ret(v) => return read(&values, v),
                Operation::Br(target) => {
                    next = Some(target);
                    continue;
                }
                Operation::CondBr {
                    cond,
                    then_block,
                    else_block,
                } => {
                    next = Some(if read(&values, cond) != 0 { then_block } else { else_block });
                    continue;
                }
                Operation::Const(imm) => imm,
                Operation::Add(a, b) => read(&values, a).wrapping_add(read(&values, b)),
                Operation::Sub(a, b) => read(&values, a).wrapping_sub(read(&values, b)),
                Operation::Copy(v) => read(&values, v),
            };
            let result = inst.result.expect("value-defining instruction without a result");
            values[result as usize] = Some(value);
        }
        block = next.expect("block fell off its end") as usize;
    }
    panic!("{name} did not return within {STEP_LIMIT} blocks");
}

const STACK_TOP: u64 = 0x7fff_f000;
const RETURN_ADDRESS: u64 = 0xdead_beef_0000;
const CALLER_RBP: u64 = 0x1234_5678;
const ARG_REGISTERS: [Register; 6] = [
    Register::RDI,
    Register::RSI,
    Register::RDX,
    Register::RCX,
    Register::R8,
    Register::R9,
];

struct Machine {
    regs: HashMap<Register, u64>,
    stack: HashMap<u64, u64>,
    zero_flag: bool,
}

impl Machine {
    fn reg(&self, reg: Register) -> u64 {
        let full = self.regs.get(&reg.full_register()).copied().unwrap_or(0);
        match reg.size() {
            8 => full,
            4 => full & 0xffff_ffff,
            size => panic!("unexpected {size}-byte register {reg:?}"),
        }
    }

    fn set_reg(&mut self, reg: Register, value: u64) {
        let value = match reg.size() {
            8 => value,
            // 32-bit writes zero the upper half.
            4 => value & 0xffff_ffff,
            size => panic!("unexpected {size}-byte register {reg:?}"),
        };
        self.regs.insert(reg.full_register(), value);
    }

    fn address(&self, instr: &Instruction) -> u64 {
        assert_eq!(instr.memory_index(), Register::None, "indexed addressing in {instr}");
        self.reg(instr.memory_base())
            .wrapping_add(instr.memory_displacement64())
    }

    fn load(&self, address: u64) -> u64 {
        *self
            .stack
            .get(&address)
            .unwrap_or_else(|| panic!("read of unwritten stack slot {address:#x}"))
    }

    fn read(&self, instr: &Instruction, operand: u32) -> u64 {
        match instr.op_kind(operand) {
            OpKind::Register => self.reg(instr.op_register(operand)),
            OpKind::Memory => self.load(self.address(instr)),
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => instr.immediate(operand),
            kind => panic!("unsupported operand {kind:?} in {instr}"),
        }
    }

    fn write(&mut self, instr: &Instruction, operand: u32, value: u64) {
        match instr.op_kind(operand) {
            OpKind::Register => self.set_reg(instr.op_register(operand), value),
            OpKind::Memory => {
                let address = self.address(instr);
                self.stack.insert(address, value);
            }
            kind => panic!("cannot write to {kind:?} in {instr}"),
        }
    }

    fn push(&mut self, value: u64) {
        let rsp = self.reg(Register::RSP).wrapping_sub(8);
        self.set_reg(Register::RSP, rsp);
        self.stack.insert(rsp, value);
    }

    fn pop(&mut self) -> u64 {
        let rsp = self.reg(Register::RSP);
        let value = self.load(rsp);
        self.set_reg(Register::RSP, rsp.wrapping_add(8));
        value
    }
}

/// Call the machine code of one function with System V integer arguments
/// and return rax.
pub fn execute(code: &[u8], args: &[i64]) -> i64 {
    assert!(args.len() <= ARG_REGISTERS.len(), "too many arguments");

    let mut program = HashMap::new();
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    for instr in &mut decoder {
        assert!(!instr.is_invalid(), "undecodable bytes at {:#x}", instr.ip());
        program.insert(instr.ip(), instr);
    }

    let mut machine = Machine {
        regs: HashMap::new(),
        stack: HashMap::new(),
        zero_flag: false,
    };
    machine.set_reg(Register::RSP, STACK_TOP);
    machine.set_reg(Register::RBP, CALLER_RBP);
    for (reg, arg) in ARG_REGISTERS.iter().zip(args) {
        machine.set_reg(*reg, *arg as u64);
    }
    machine.push(RETURN_ADDRESS);

    let mut ip = 0u64;
    for _ in 0..STEP_LIMIT {
        let instr = *program
            .get(&ip)
            .unwrap_or_else(|| panic!("jump to {ip:#x}, which is not an instruction boundary"));
        ip = instr.next_ip();

        match instr.mnemonic() {
            Mnemonic::Mov => {
                let value = machine.read(&instr, 1);
                machine.write(&instr, 0, value);
            }
            Mnemonic::Add => {
                let value = machine.read(&instr, 0).wrapping_add(machine.read(&instr, 1));
                machine.zero_flag = value == 0;
                machine.write(&instr, 0, value);
            }
            Mnemonic::Sub => {
                let value = machine.read(&instr, 0).wrapping_sub(machine.read(&instr, 1));
                machine.zero_flag = value == 0;
                machine.write(&instr, 0, value);
            }
            Mnemonic::Cmp => {
                machine.zero_flag = machine.read(&instr, 0) == machine.read(&instr, 1);
            }
            Mnemonic::Push => {
                let value = machine.read(&instr, 0);
                machine.push(value);
            }
            Mnemonic::Pop => {
                let value = machine.pop();
                machine.write(&instr, 0, value);
            }
            Mnemonic::Jmp => ip = instr.near_branch_target(),
            Mnemonic::Je if machine.zero_flag => ip = instr.near_branch_target(),
            Mnemonic::Jne if !machine.zero_flag => ip = instr.near_branch_target(),
            Mnemonic::Je | Mnemonic::Jne => {}
            Mnemonic::Ret => {
                assert_eq!(machine.pop(), RETURN_ADDRESS, "ret to a clobbered return address");
                assert_eq!(machine.reg(Register::RSP), STACK_TOP, "unbalanced stack");
                assert_eq!(machine.reg(Register::RBP), CALLER_RBP, "rbp not restored");
                return machine.reg(Register::RAX) as i64;
            }
            other => panic!("unexpected {other:?} in generated code: {instr}"),
        }
    }
    panic!("no return within {STEP_LIMIT} instructions");
}
