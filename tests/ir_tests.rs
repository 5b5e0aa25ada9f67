//! Integration tests for the textual module IR and unit construction.

use modgen::ir::IrError;
use modgen::CompilationUnit;
use std::fs;
use std::path::{Path, PathBuf};

fn ir_path(filename: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/ir")
        .join(filename)
}

/// Helper to load a unit from the fixture directory
fn load_unit(filename: &str) -> CompilationUnit {
    let path = ir_path(filename);
    CompilationUnit::from_path(&path).unwrap_or_else(|e| panic!("Failed to load {filename}: {e}"))
}

/// Helper to check if output contains expected patterns
fn check_output_contains(output: &str, patterns: &[&str]) {
    for pattern in patterns {
        assert!(
            output.contains(pattern),
            "Output missing expected pattern: '{pattern}'\nFull output:\n{output}"
        );
    }
}

#[test]
fn test_add3_ir() {
    let unit = load_unit("add3.tir");
    let output = unit.module().print();

    check_output_contains(
        &output,
        &[
            "Printing IR",
            "Function add3",
            "Argument a",
            "Argument b",
            "Argument c",
            "Block entry",
            "Value t (add)",
            "Value r (add)",
            "Value (ret)",
            "Op r",
        ],
    );

    assert_eq!(unit.name(), "add3");
    assert_eq!(unit.module().functions.len(), 1);
    assert_eq!(unit.module().blocks.len(), 1);
    assert_eq!(unit.module().insts.len(), 3);
}

#[test]
fn test_pick_ir() {
    let unit = load_unit("pick.tir");
    let output = unit.module().print();

    check_output_contains(
        &output,
        &[
            "Function pick",
            "Value (condbr)",
            "Op c",
            "Op ^yes",
            "Op ^no",
            "Value d (sub)",
            "Value (br)",
            "Op ^done",
            "Value e (copy)",
            "Local function negate",
            "Value z (const)",
            "Op $0",
            "Extern function abort_all",
            "Argument code",
        ],
    );
    assert_eq!(unit.module().defined_functions().count(), 2);
}

#[test]
fn test_classify_constants() {
    let unit = load_unit("classify.tir");
    let output = unit.module().print();
    check_output_contains(
        &output,
        &["Op $9223372036854775807", "Op $-9223372036854775808"],
    );
}

#[test]
fn test_fingerprint_follows_file_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Scratch.tir");
    fs::write(&path, fs::read_to_string(ir_path("add3.tir")).unwrap()).unwrap();

    let original = CompilationUnit::from_path(&path).unwrap();
    assert_eq!(original.fingerprint(), load_unit("add3.tir").fingerprint());
    assert_eq!(original.name(), "Scratch");

    fs::write(&path, "k() {\nentry:\n  %v = const 3\n  ret %v\n}\n").unwrap();
    let edited = CompilationUnit::from_path(&path).unwrap();
    assert_eq!(edited.name(), original.name());
    assert_ne!(edited.fingerprint(), original.fingerprint());
}

#[test]
fn test_named_unit_from_path() {
    let unit = CompilationUnit::from_path_named("Cal.Core.Add", &ir_path("add3.tir")).unwrap();
    assert_eq!(unit.name(), "Cal.Core.Add");
}

#[test]
fn test_errors_carry_line_numbers() {
    let err = CompilationUnit::from_source("Bad", "f() {\nentry:\n  %x = mul %a, %b\n  ret %x\n}\n")
        .unwrap_err();
    assert_eq!(
        err,
        IrError::UnknownOpcode {
            line: 3,
            opcode: "mul".to_string()
        }
    );

    let err = CompilationUnit::from_source("Bad", "f() {\nentry:\n  ret %nope\n}\n").unwrap_err();
    assert!(matches!(err, IrError::UndefinedValue { .. }), "{err:?}");

    let err = CompilationUnit::from_path(Path::new("/nonexistent/Missing.tir")).unwrap_err();
    assert!(matches!(err, IrError::Io { .. }), "{err:?}");
}
