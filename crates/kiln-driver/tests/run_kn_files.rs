// Integration test: run the .kn corpus and check its expect comments
use std::path::{Path, PathBuf};

use kiln_driver::check_expectations;
use kiln_vm::CaptureSink;

fn corpus_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join(path)
}

fn run_file(path: &str) {
    let mismatches = check_expectations(&corpus_path(path))
        .unwrap_or_else(|e| panic!("error running {path}: {e}"));
    assert!(
        mismatches.is_empty(),
        "mismatches in {path}:\n{}",
        mismatches.join("\n")
    );
}

#[test]
fn run_basics() {
    run_file("tests/basics_test.kn");
}
#[test]
fn run_control_flow() {
    run_file("tests/control_flow_test.kn");
}
#[test]
fn run_functions() {
    run_file("tests/functions_test.kn");
}
#[test]
fn run_classes() {
    run_file("tests/classes_test.kn");
}
#[test]
fn run_arrays_strings() {
    run_file("tests/arrays_strings_test.kn");
}
#[test]
fn run_errors() {
    run_file("tests/errors_test.kn");
}
#[test]
fn run_imports() {
    run_file("tests/imports_test.kn");
}
#[test]
fn run_import_cycle() {
    run_file("tests/import_cycle_test.kn");
}

// The fib demo is timing-heavy, so only the class demo runs here; both are
// covered by the parse and compile corpus tests.
#[test]
fn run_cls_demo() {
    let sink = CaptureSink::new();
    kiln_driver::run_file(&corpus_path("demos/cls.kn"), Box::new(sink.clone()), false)
        .unwrap_or_else(|e| panic!("error running demos/cls.kn: {e}"));
    assert_eq!(sink.contents(), "[42]\nthe class method was called\n");
}
