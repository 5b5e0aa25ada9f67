//! Module IR parser.
//!
//! Works line by line. Value and block references are collected while a
//! function body is read and resolved when its closing brace is reached, so
//! a branch may name a block that appears further down. Values are stricter:
//! every use must be preceded by a definition on each path from the entry
//! block, otherwise the generators would read a slot that was never written.

use super::*;
use std::collections::HashMap;

pub fn parse_module(text: &str) -> Result<Module, IrError> {
    let mut parser = Parser::default();
    for (idx, raw) in text.lines().enumerate() {
        parser.parse_line(idx + 1, raw)?;
    }
    parser.finish()
}

#[derive(Default)]
struct Parser<'a> {
    module: Module,
    funcs: HashMap<&'a str, u32>,
    current: Option<FunctionBuilder<'a>>,
}

struct FunctionBuilder<'a> {
    name: &'a str,
    linkage: Linkage,
    header_line: usize,
    param_count: u32,
    values: HashMap<&'a str, ValueIdx>,
    value_names: Vec<String>,
    blocks: HashMap<&'a str, BlockIdx>,
    block_names: Vec<&'a str>,
    /// Pending instructions per block, in order.
    body: Vec<Vec<Pending<'a>>>,
}

struct Pending<'a> {
    line: usize,
    result: Option<ValueIdx>,
    op: RawOp<'a>,
}

enum RawOp<'a> {
    Const(i64),
    Add(&'a str, &'a str),
    Sub(&'a str, &'a str),
    Copy(&'a str),
    Ret(&'a str),
    Br(&'a str),
    CondBr(&'a str, &'a str, &'a str),
}

impl RawOp<'_> {
    fn is_terminator(&self) -> bool {
        matches!(self, RawOp::Ret(_) | RawOp::Br(_) | RawOp::CondBr(..))
    }
}

impl<'a> Parser<'a> {
    fn parse_line(&mut self, line: usize, raw: &'a str) -> Result<(), IrError> {
        let text = match raw.find(';') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let mut cursor = Cursor::new(text, line);
        if cursor.at_end() {
            return Ok(());
        }

        if self.current.is_none() {
            return self.parse_header(cursor);
        }

        if cursor.try_read('}') {
            cursor.expect_end()?;
            return self.close_function();
        }

        // Either a block label or an instruction.
        if cursor.peek() != Some('%') {
            let saved = cursor.pos;
            let ident = cursor.read_identifier()?;
            if cursor.try_read(':') {
                cursor.expect_end()?;
                return self.open_block(ident);
            }
            cursor.pos = saved;
        }

        self.parse_instruction(cursor)
    }

    fn parse_header(&mut self, mut cursor: Cursor<'a>) -> Result<(), IrError> {
        let name = cursor.read_identifier()?;
        if self.funcs.contains_key(name) {
            return Err(IrError::DuplicateFunction {
                function: name.to_string(),
            });
        }

        let mut builder = FunctionBuilder {
            name,
            linkage: Linkage::Global,
            header_line: cursor.line,
            param_count: 0,
            values: HashMap::new(),
            value_names: Vec::new(),
            blocks: HashMap::new(),
            block_names: Vec::new(),
            body: Vec::new(),
        };

        cursor.expect('(')?;
        if !cursor.try_read(')') {
            loop {
                let param = cursor.read_value_name()?;
                builder.define_value(param)?;
                if cursor.try_read(')') {
                    break;
                }
                cursor.expect(',')?;
            }
        }
        builder.param_count = builder.value_names.len() as u32;

        if cursor.try_read('!') {
            cursor.expect_end()?;
            builder.linkage = Linkage::External;
            self.funcs.insert(name, self.module.functions.len() as u32);
            let block_idx = self.module.blocks.len() as u32;
            self.module.functions.push(Function {
                name: name.to_string(),
                linkage: Linkage::External,
                param_count: builder.param_count,
                value_names: builder.value_names,
                block_begin_idx: block_idx,
                block_end_idx: block_idx,
            });
            return Ok(());
        }

        if cursor.peek() != Some('{') {
            match cursor.read_identifier()? {
                "local" => builder.linkage = Linkage::Local,
                other => return Err(cursor.error(format!("unexpected modifier '{}'", other))),
            }
        }
        cursor.expect('{')?;
        cursor.expect_end()?;

        self.current = Some(builder);
        Ok(())
    }

    fn open_block(&mut self, name: &'a str) -> Result<(), IrError> {
        let Some(builder) = self.current.as_mut() else {
            return Ok(());
        };
        builder.check_last_block_terminated()?;
        if builder.blocks.contains_key(name) {
            return Err(IrError::DuplicateBlock {
                function: builder.name.to_string(),
                block: name.to_string(),
            });
        }
        builder.blocks.insert(name, builder.block_names.len() as BlockIdx);
        builder.block_names.push(name);
        builder.body.push(Vec::new());
        Ok(())
    }

    fn parse_instruction(&mut self, mut cursor: Cursor<'a>) -> Result<(), IrError> {
        let Some(builder) = self.current.as_mut() else {
            return Ok(());
        };
        if builder.body.is_empty() {
            return Err(cursor.error("instruction outside of a block".to_string()));
        }

        let result_name = if cursor.peek() == Some('%') {
            let name = cursor.read_value_name()?;
            cursor.expect('=')?;
            Some(name)
        } else {
            None
        };

        let opcode = cursor.read_identifier()?;
        let op = match opcode {
            "const" => RawOp::Const(cursor.read_integer()?),
            "add" | "sub" => {
                let lhs = cursor.read_value_name()?;
                cursor.expect(',')?;
                let rhs = cursor.read_value_name()?;
                if opcode == "add" {
                    RawOp::Add(lhs, rhs)
                } else {
                    RawOp::Sub(lhs, rhs)
                }
            }
            "copy" => RawOp::Copy(cursor.read_value_name()?),
            "ret" => RawOp::Ret(cursor.read_value_name()?),
            "br" => RawOp::Br(cursor.read_block_name()?),
            "condbr" => {
                let cond = cursor.read_value_name()?;
                cursor.expect(',')?;
                let then_block = cursor.read_block_name()?;
                cursor.expect(',')?;
                let else_block = cursor.read_block_name()?;
                RawOp::CondBr(cond, then_block, else_block)
            }
            _ => {
                return Err(IrError::UnknownOpcode {
                    line: cursor.line,
                    opcode: opcode.to_string(),
                })
            }
        };
        cursor.expect_end()?;

        match (op.is_terminator(), result_name) {
            (true, Some(_)) => {
                return Err(cursor.error(format!("'{}' does not define a value", opcode)));
            }
            (false, None) => {
                return Err(cursor.error(format!("'{}' must define a value", opcode)));
            }
            _ => {}
        }

        let block_name = builder.block_names[builder.body.len() - 1];
        let terminated = builder
            .body
            .last()
            .and_then(|insts| insts.last())
            .is_some_and(|inst| inst.op.is_terminator());
        if terminated {
            return Err(IrError::InstructionAfterTerminator {
                function: builder.name.to_string(),
                block: block_name.to_string(),
            });
        }

        let result = match result_name {
            Some(name) => Some(builder.define_value(name)?),
            None => None,
        };
        if let Some(insts) = builder.body.last_mut() {
            insts.push(Pending {
                line: cursor.line,
                result,
                op,
            });
        }
        Ok(())
    }

    fn close_function(&mut self) -> Result<(), IrError> {
        let Some(builder) = self.current.take() else {
            return Ok(());
        };
        if builder.body.is_empty() {
            return Err(IrError::EmptyFunction {
                function: builder.name.to_string(),
            });
        }
        builder.check_last_block_terminated()?;

        let resolved = builder
            .body
            .iter()
            .map(|insts| {
                insts
                    .iter()
                    .map(|pending| builder.resolve(pending).map(|op| (pending.line, Inst { result: pending.result, op })))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        builder.check_defined_before_use(&resolved)?;

        let block_begin_idx = self.module.blocks.len() as u32;
        for (block_idx, insts) in resolved.into_iter().enumerate() {
            let inst_begin_idx = self.module.insts.len() as u32;
            self.module.insts.extend(insts.into_iter().map(|(_, inst)| inst));
            self.module.blocks.push(Block {
                name: builder.block_names[block_idx].to_string(),
                inst_begin_idx,
                inst_end_idx: self.module.insts.len() as u32,
            });
        }

        self.funcs.insert(builder.name, self.module.functions.len() as u32);
        self.module.functions.push(Function {
            name: builder.name.to_string(),
            linkage: builder.linkage,
            param_count: builder.param_count,
            value_names: builder.value_names,
            block_begin_idx,
            block_end_idx: self.module.blocks.len() as u32,
        });
        Ok(())
    }

    fn finish(self) -> Result<Module, IrError> {
        if let Some(builder) = self.current {
            return Err(IrError::Syntax {
                line: builder.header_line,
                message: format!("function '{}' is missing its closing '}}'", builder.name),
            });
        }
        Ok(self.module)
    }
}

impl<'a> FunctionBuilder<'a> {
    fn define_value(&mut self, name: &'a str) -> Result<ValueIdx, IrError> {
        if self.values.contains_key(name) {
            return Err(IrError::DuplicateValue {
                function: self.name.to_string(),
                value: name.to_string(),
            });
        }
        let idx = self.value_names.len() as ValueIdx;
        self.values.insert(name, idx);
        self.value_names.push(name.to_string());
        Ok(idx)
    }

    fn check_last_block_terminated(&self) -> Result<(), IrError> {
        let Some(insts) = self.body.last() else {
            return Ok(());
        };
        if insts.last().is_some_and(|inst| inst.op.is_terminator()) {
            return Ok(());
        }
        Err(IrError::MissingTerminator {
            function: self.name.to_string(),
            block: self.block_names[self.body.len() - 1].to_string(),
        })
    }

    fn value(&self, name: &str) -> Result<ValueIdx, IrError> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| IrError::UndefinedValue {
                function: self.name.to_string(),
                value: name.to_string(),
            })
    }

    fn block(&self, name: &str) -> Result<BlockIdx, IrError> {
        self.blocks
            .get(name)
            .copied()
            .ok_or_else(|| IrError::UndefinedBlock {
                function: self.name.to_string(),
                block: name.to_string(),
            })
    }

    /// Forward dataflow over the resolved body: a value counts as defined at a
    /// block's entry only if every reached predecessor defines it.
    fn check_defined_before_use(&self, body: &[Vec<(usize, Inst)>]) -> Result<(), IrError> {
        let value_count = self.value_names.len();
        let mut params = vec![false; value_count];
        params[..self.param_count as usize].fill(true);

        // None until the block is reached from the entry.
        let mut defined_on_entry: Vec<Option<Vec<bool>>> = vec![None; body.len()];
        defined_on_entry[0] = Some(params);

        let mut changed = true;
        while changed {
            changed = false;
            for (block_idx, insts) in body.iter().enumerate() {
                let Some(mut defined) = defined_on_entry[block_idx].clone() else {
                    continue;
                };
                for (_, inst) in insts {
                    if let Some(result) = inst.result {
                        defined[result as usize] = true;
                    }
                }
                let Some((_, last)) = insts.last() else {
                    continue;
                };
                for succ in last.op.successors() {
                    let entry = &mut defined_on_entry[succ as usize];
                    match entry {
                        None => {
                            *entry = Some(defined.clone());
                            changed = true;
                        }
                        Some(existing) => {
                            for (have, out) in existing.iter_mut().zip(&defined) {
                                if *have && !*out {
                                    *have = false;
                                    changed = true;
                                }
                            }
                        }
                    }
                }
            }
        }

        for (block_idx, insts) in body.iter().enumerate() {
            // Unreachable blocks never run.
            let Some(mut defined) = defined_on_entry[block_idx].clone() else {
                continue;
            };
            for (line, inst) in insts {
                if let Some(value) = inst.op.value_operands().into_iter().find(|v| !defined[*v as usize]) {
                    return Err(IrError::UseBeforeDefinition {
                        line: *line,
                        function: self.name.to_string(),
                        value: self.value_names[value as usize].clone(),
                    });
                }
                if let Some(result) = inst.result {
                    defined[result as usize] = true;
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, pending: &Pending<'a>) -> Result<Operation, IrError> {
        let op = match pending.op {
            RawOp::Const(imm) => Operation::Const(imm),
            RawOp::Add(a, b) => Operation::Add(self.value(a)?, self.value(b)?),
            RawOp::Sub(a, b) => Operation::Sub(self.value(a)?, self.value(b)?),
            RawOp::Copy(v) => Operation::Copy(self.value(v)?),
            RawOp::Ret(v) => Operation::Ret(self.value(v)?),
            RawOp::Br(target) => Operation::Br(self.block(target)?),
            RawOp::CondBr(cond, then_block, else_block) => Operation::CondBr {
                cond: self.value(cond)?,
                then_block: self.block(then_block)?,
                else_block: self.block(else_block)?,
            },
        };
        log::trace!("line {}: resolved {}", pending.line, op.info().name);
        Ok(op)
    }
}

/// Character cursor over a single comment-stripped line.
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str, line: usize) -> Self {
        Self { text, pos: 0, line }
    }

    fn error(&self, message: String) -> IrError {
        IrError::Syntax {
            line: self.line,
            message,
        }
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.text[self.pos..].chars().next()
    }

    fn at_end(&mut self) -> bool {
        self.peek().is_none()
    }

    fn expect_end(&mut self) -> Result<(), IrError> {
        match self.peek() {
            None => Ok(()),
            Some(ch) => Err(self.error(format!("unexpected trailing '{}'", ch))),
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), IrError> {
        if self.try_read(ch) {
            return Ok(());
        }
        let found = self.peek();
        Err(self.error(format!("expected '{}' but found {:?}", ch, found)))
    }

    fn read_identifier(&mut self) -> Result<&'a str, IrError> {
        match self.peek() {
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(self.error(format!("expected identifier but found '{}'", ch))),
            None => return Err(self.error("expected identifier but found end of line".to_string())),
        }

        let text = self.text;
        let start = self.pos;
        let len = text[start..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(text.len() - start);
        self.pos += len;
        Ok(&text[start..self.pos])
    }

    fn read_value_name(&mut self) -> Result<&'a str, IrError> {
        self.expect('%')?;
        self.read_identifier()
    }

    fn read_block_name(&mut self) -> Result<&'a str, IrError> {
        self.expect('^')?;
        self.read_identifier()
    }

    fn read_integer(&mut self) -> Result<i64, IrError> {
        self.skip_whitespace();
        let text = self.text;
        let start = self.pos;
        let negative = self.try_read('-');

        let rest = &text[self.pos..];
        let is_hex = rest.starts_with("0x") || rest.starts_with("0X");
        if is_hex {
            self.pos += 2;
        }
        let body = &text[self.pos..];
        let len = body
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(body.len());
        let digits = &body[..len];
        self.pos += len;

        let magnitude = if is_hex {
            u64::from_str_radix(digits, 16)
        } else {
            digits.parse::<u64>()
        }
        .map_err(|_| self.error(format!("invalid integer '{}'", &text[start..self.pos])))?;

        if negative {
            if magnitude > i64::MIN.unsigned_abs() {
                return Err(self.error("integer out of range".to_string()));
            }
            Ok((magnitude as i64).wrapping_neg())
        } else {
            i64::try_from(magnitude).map_err(|_| self.error("integer out of range".to_string()))
        }
    }
}
