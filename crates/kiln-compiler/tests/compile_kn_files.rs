// Integration test: compile all .kn test files to bytecode
use std::fs;
use std::path::Path;

fn compile_file(path: &str) {
    let full_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join(path);
    let source = fs::read_to_string(&full_path)
        .unwrap_or_else(|e| panic!("could not read {}: {}", full_path.display(), e));
    let tokens = kiln_lexer::lex(&source).unwrap_or_else(|e| panic!("lex error in {path}: {e}"));
    let program =
        kiln_parser::parse(tokens).unwrap_or_else(|errors| panic!("parse errors in {path}: {errors:?}"));
    kiln_compiler::compile(&program)
        .unwrap_or_else(|errors| panic!("compile errors in {path}: {errors:?}"));
}

#[test]
fn compile_basics() {
    compile_file("tests/basics_test.kn");
}
#[test]
fn compile_control_flow() {
    compile_file("tests/control_flow_test.kn");
}
#[test]
fn compile_functions() {
    compile_file("tests/functions_test.kn");
}
#[test]
fn compile_classes() {
    compile_file("tests/classes_test.kn");
}
#[test]
fn compile_arrays_strings() {
    compile_file("tests/arrays_strings_test.kn");
}
#[test]
fn compile_errors() {
    compile_file("tests/errors_test.kn");
}
#[test]
fn compile_imports() {
    compile_file("tests/imports_test.kn");
}
#[test]
fn compile_import_cycle() {
    compile_file("tests/import_cycle_test.kn");
}
#[test]
fn compile_helpers() {
    compile_file("tests/_math_utils.kn");
    compile_file("tests/_shapes.kn");
    compile_file("tests/_cycle_a.kn");
    compile_file("tests/_cycle_b.kn");
}
#[test]
fn compile_demos() {
    compile_file("demos/fib.kn");
    compile_file("demos/cls.kn");
}
#[test]
fn compile_bench_01() {
    compile_file("tests/bench/01_recursion.kn");
}
#[test]
fn compile_bench_02() {
    compile_file("tests/bench/02_loops.kn");
}
#[test]
fn compile_bench_03() {
    compile_file("tests/bench/03_arrays.kn");
}
