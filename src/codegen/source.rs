//! C source emission for an external toolchain.
//!
//! Each function becomes one C function over `int64_t`; blocks become labels
//! and branches become `goto`. Arithmetic goes through `uint64_t` so overflow
//! wraps the same way the machine code does.

use super::{CodeArtifact, CodeGenerator, SourceArtifact, SourceLanguage};
use crate::config::GenerationMode;
use crate::core::{CompilationUnit, GenerationError};
use crate::ir::{Function, Linkage, Module, Operation, ValueIdx};
use std::fmt::Write as _;
use std::sync::Arc;

const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while",
    // C23
    "alignas", "alignof", "bool", "constexpr", "false", "nullptr", "static_assert",
    "thread_local", "true", "typeof", "typeof_unqual",
];

/// Macro prefixes `<stdint.h>` claims, `INT64_C` and `INT64_MIN` among them.
const STDINT_MACRO_PREFIXES: &[&str] = &[
    "INT", "UINT", "PTRDIFF_", "SIG_ATOMIC_", "SIZE_", "WCHAR_", "WINT_",
];

/// Why `name` cannot name a C function, if it cannot.
fn reserved_in_c(name: &str) -> Option<&'static str> {
    if C_KEYWORDS.contains(&name) {
        return Some("function name is a C keyword");
    }
    // `_Bool`, `_Atomic`, `_Static_assert` and every other `_X` or `__x` name.
    let mut chars = name.chars();
    if chars.next() == Some('_') && chars.next().is_some_and(|c| c == '_' || c.is_ascii_uppercase()) {
        return Some("function name is reserved for the C implementation");
    }
    let stdint_type = name
        .strip_prefix("uint")
        .or_else(|| name.strip_prefix("int"))
        .is_some_and(|rest| rest.ends_with("_t"));
    if stdint_type || STDINT_MACRO_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
        return Some("function name collides with <stdint.h>");
    }
    None
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SourceEmitter;

impl SourceEmitter {
    pub fn new() -> Self {
        Self
    }

    fn signature(func: &Function) -> String {
        let params = if func.param_count == 0 {
            "void".to_string()
        } else {
            func.params()
                .iter()
                .map(|p| format!("int64_t v_{}", p))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let storage = match func.linkage {
            Linkage::External => "extern ",
            Linkage::Local => "static ",
            Linkage::Global => "",
        };
        format!("{}int64_t {}({})", storage, func.name, params)
    }

    fn emit_function(out: &mut String, module: &Module, func: &Function) {
        let _ = writeln!(out, "{} {{", Self::signature(func));

        let locals = &func.value_names[func.param_count as usize..];
        for name in locals {
            let _ = writeln!(out, "    int64_t v_{};", name);
        }

        let blocks = module.blocks_of(func);
        for block in blocks {
            let _ = writeln!(out, "bb_{}:", block.name);
            for inst in module.insts_of(block) {
                let value = move |idx: ValueIdx| func.value_name(idx);
                let dst = inst.result.map(value).unwrap_or_default();
                let _ = match inst.op {
                    Operation::Const(i64::MIN) => writeln!(out, "    v_{} = INT64_MIN;", dst),
                    Operation::Const(imm) => writeln!(out, "    v_{} = INT64_C({});", dst, imm),
                    Operation::Add(a, b) => writeln!(
                        out,
                        "    v_{} = (int64_t)((uint64_t)v_{} + (uint64_t)v_{});",
                        dst,
                        value(a),
                        value(b)
                    ),
                    Operation::Sub(a, b) => writeln!(
                        out,
                        "    v_{} = (int64_t)((uint64_t)v_{} - (uint64_t)v_{});",
                        dst,
                        value(a),
                        value(b)
                    ),
                    Operation::Copy(src) => writeln!(out, "    v_{} = v_{};", dst, value(src)),
                    Operation::Ret(v) => writeln!(out, "    return v_{};", value(v)),
                    Operation::Br(target) => {
                        writeln!(out, "    goto bb_{};", blocks[target as usize].name)
                    }
                    Operation::CondBr {
                        cond,
                        then_block,
                        else_block,
                    } => writeln!(
                        out,
                        "    if (v_{} != 0) goto bb_{}; else goto bb_{};",
                        value(cond),
                        blocks[then_block as usize].name,
                        blocks[else_block as usize].name
                    ),
                };
            }
        }

        out.push_str("}\n");
    }
}

impl CodeGenerator for SourceEmitter {
    fn mode(&self) -> GenerationMode {
        GenerationMode::SourceText
    }

    fn generate(&self, unit: &CompilationUnit) -> Result<CodeArtifact, GenerationError> {
        let module = unit.module();

        for func in &module.functions {
            if let Some(reason) = reserved_in_c(&func.name) {
                return Err(GenerationError::Emission {
                    unit: unit.id().clone(),
                    function: func.name.clone(),
                    reason: reason.to_string(),
                });
            }
        }

        let mut out = String::new();
        let _ = writeln!(out, "/* unit {} */", unit.name());
        let _ = writeln!(out, "/* fingerprint {} */", unit.fingerprint().to_hex());
        out.push_str("#include <stdint.h>\n\n");

        for func in &module.functions {
            let _ = writeln!(out, "{};", Self::signature(func));
        }

        for func in module.defined_functions() {
            out.push('\n');
            Self::emit_function(&mut out, module, func);
        }

        log::debug!("emitted {} lines of C for {}", out.lines().count(), unit.id());
        Ok(CodeArtifact::SourceText(SourceArtifact {
            unit: unit.id().clone(),
            text: Arc::from(out),
            language: SourceLanguage::C,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "\
pick(%c, %a, %b) {
entry:
    condbr %c, ^yes, ^no
yes:
    ret %a
no:
    %n = const -1
    %r = add %b, %n
    ret %r
}
helper() local {
entry:
    %k = const -0x8000000000000000
    ret %k
}
ext(%p)!
";

    fn emit(src: &str) -> Result<CodeArtifact, GenerationError> {
        let unit = CompilationUnit::from_source("Test.Source", src).unwrap();
        SourceEmitter::new().generate(&unit)
    }

    #[test]
    fn test_emits_every_function() {
        let artifact = emit(SRC).unwrap();
        let source = artifact.source().unwrap();
        assert_eq!(source.language, SourceLanguage::C);

        for pattern in [
            "/* unit Test.Source */",
            "#include <stdint.h>",
            "extern int64_t ext(int64_t v_p);",
            "static int64_t helper(void);",
            "int64_t pick(int64_t v_c, int64_t v_a, int64_t v_b) {",
            "    int64_t v_n;",
            "bb_entry:",
            "    if (v_c != 0) goto bb_yes; else goto bb_no;",
            "    v_n = INT64_C(-1);",
            "    v_r = (int64_t)((uint64_t)v_b + (uint64_t)v_n);",
            "    return v_r;",
            "    v_k = INT64_MIN;",
        ] {
            assert!(source.text.contains(pattern), "missing '{pattern}' in:\n{}", source.text);
        }
    }

    #[test]
    fn test_output_is_deterministic() {
        let a = emit(SRC).unwrap();
        let b = emit(SRC).unwrap();
        assert_eq!(a.source().unwrap().text, b.source().unwrap().text);
    }

    fn rejected(name: &str) -> String {
        let src = format!("{name}() {{\nentry:\n  %z = const 0\n  ret %z\n}}\n");
        match emit(&src) {
            Err(GenerationError::Emission { function, reason, .. }) => {
                assert_eq!(function, name);
                reason
            }
            other => panic!("'{name}' should be rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_keyword_names_are_rejected() {
        for name in ["int", "while", "restrict", "bool", "static_assert", "typeof"] {
            assert_eq!(rejected(name), "function name is a C keyword");
        }
    }

    #[test]
    fn test_reserved_identifiers_are_rejected() {
        for name in [
            "_Bool", "_Alignas", "_Alignof", "_Atomic", "_Generic", "_Noreturn",
            "_Static_assert", "_Thread_local", "__builtin_trap",
        ] {
            assert!(rejected(name).contains("reserved"), "{name}");
        }
    }

    #[test]
    fn test_stdint_names_are_rejected() {
        for name in ["int64_t", "uint64_t", "int_fast8_t", "uintptr_t", "INT64_C", "INT64_MIN", "UINTMAX_MAX", "SIZE_MAX"] {
            assert!(rejected(name).contains("stdint"), "{name}");
        }
    }

    #[test]
    fn test_ordinary_names_pass() {
        for name in ["integer", "interval", "_private", "uint", "Int64", "size"] {
            let src = format!("{name}() {{\nentry:\n  %z = const 0\n  ret %z\n}}\n");
            assert!(emit(&src).is_ok(), "{name}");
        }
    }
}
