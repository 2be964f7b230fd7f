//! Driver library for the Kiln toolchain.
//!
//! The pipeline is lex → parse → compile → run. [`compile_source`] covers the
//! front half and [`run_source`]/[`run_file`] add execution with a
//! caller-supplied output sink. [`FileLoader`] implements the VM's module
//! loader on top of the same pipeline, so `import` statements resolve and
//! compile `.kn` files relative to the importing script. The expectation
//! harness ([`parse_expectations`], [`check_expectations`]) backs the
//! `kiln test` subcommand and the repo-level test corpus.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use thiserror::Error;

use kiln_compiler::CompileError;
use kiln_lexer::LexError;
use kiln_parser::ParseError;
use kiln_vm::{CaptureSink, Function, ModuleLoader, RuntimeError, Vm};

// ─── Errors ──────────────────────────────────────────────────────────

/// Error from the front half of the pipeline. Parse and compile errors come
/// in batches because both phases recover and keep going.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Lex(#[from] LexError),
    #[error("{} parse error{}", .0.len(), plural(.0.len()))]
    Parse(Vec<ParseError>),
    #[error("{} compile error{}", .0.len(), plural(.0.len()))]
    Compile(Vec<CompileError>),
}

/// Error from running a program end to end.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

// ─── Pipeline ────────────────────────────────────────────────────────

/// Lex, parse and compile a source string. `name` becomes the script
/// function's name in tracebacks ("script" for the root program, the file
/// stem for modules).
pub fn compile_source(source: &str, name: &str) -> Result<Rc<Function>, PipelineError> {
    let start = Instant::now();
    let tokens = kiln_lexer::lex(source)?;
    tracing::debug!(tokens = tokens.len(), elapsed = ?start.elapsed(), "lexed");

    let start = Instant::now();
    let program = kiln_parser::parse(tokens).map_err(PipelineError::Parse)?;
    tracing::debug!(statements = program.len(), elapsed = ?start.elapsed(), "parsed");

    let start = Instant::now();
    let script = kiln_compiler::compile_named(&program, name).map_err(PipelineError::Compile)?;
    tracing::debug!(elapsed = ?start.elapsed(), "compiled");
    Ok(script)
}

/// Compile and run a source string. `script_dir` anchors relative import
/// paths; print output goes to `out`.
pub fn run_source(
    source: &str,
    script_dir: Option<PathBuf>,
    out: Box<dyn Write>,
    trace: bool,
) -> Result<(), RunError> {
    let script = compile_source(source, "script")?;
    let mut vm = Vm::new(out);
    vm.set_loader(Box::new(FileLoader));
    if let Some(dir) = script_dir {
        vm.set_script_dir(dir);
    }
    vm.set_trace(trace);
    let start = Instant::now();
    vm.run(script)?;
    tracing::debug!(elapsed = ?start.elapsed(), "ran");
    Ok(())
}

/// Compile and run a `.kn` file, resolving imports relative to it.
pub fn run_file(path: &Path, out: Box<dyn Write>, trace: bool) -> Result<(), RunError> {
    let source = fs::read_to_string(path).map_err(|e| RunError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    run_source(&source, path.parent().map(Path::to_path_buf), out, trace)
}

/// Module loader that reads and compiles `.kn` files from disk. The VM hands
/// it an already-canonicalized path; failures come back as runtime errors so
/// a bad import is catchable like any other throw.
pub struct FileLoader;

impl ModuleLoader for FileLoader {
    fn load(&self, path: &Path) -> Result<Rc<Function>, String> {
        tracing::debug!(path = %path.display(), "loading module");
        let source = fs::read_to_string(path)
            .map_err(|e| format!("cannot read module '{}': {e}", path.display()))?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module");
        compile_source(&source, stem)
            .map_err(|e| format!("error in '{}': {}", path.display(), first_message(&e)))
    }
}

fn first_message(err: &PipelineError) -> String {
    match err {
        PipelineError::Lex(e) => e.to_string(),
        PipelineError::Parse(errors) => errors
            .first()
            .map(ToString::to_string)
            .unwrap_or_else(|| "parse error".to_string()),
        PipelineError::Compile(errors) => errors
            .first()
            .map(ToString::to_string)
            .unwrap_or_else(|| "compile error".to_string()),
    }
}

// ─── Expectation harness ─────────────────────────────────────────────

static EXPECT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//\s*expect:\s?(.*)").expect("valid regex"));
static EXPECT_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//\s*expect runtime error:\s?(.*)").expect("valid regex"));

/// Expected behavior extracted from a test program's comments.
#[derive(Debug, Default, PartialEq)]
pub struct Expectation {
    /// Expected print output, one entry per `// expect:` comment, in order.
    pub lines: Vec<String>,
    /// Expected uncaught runtime error message, if any.
    pub runtime_error: Option<String>,
}

/// Collect `// expect:` and `// expect runtime error:` comments.
pub fn parse_expectations(source: &str) -> Expectation {
    let mut expectation = Expectation::default();
    for line in source.lines() {
        if let Some(caps) = EXPECT_ERROR.captures(line) {
            if expectation.runtime_error.is_none() {
                expectation.runtime_error = Some(caps[1].trim_end().to_string());
            }
        } else if let Some(caps) = EXPECT_LINE.captures(line) {
            expectation.lines.push(caps[1].trim_end().to_string());
        }
    }
    expectation
}

/// Run one test file and compare its output with its expectations. Returns
/// the list of mismatches; empty means the file passed. Lex, parse and
/// compile errors in a test file are hard errors, not mismatches.
pub fn check_expectations(path: &Path) -> Result<Vec<String>, RunError> {
    let source = fs::read_to_string(path).map_err(|e| RunError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let expected = parse_expectations(&source);
    let script = compile_source(&source, "script")?;

    let sink = CaptureSink::new();
    let mut vm = Vm::new(Box::new(sink.clone()));
    vm.set_loader(Box::new(FileLoader));
    if let Some(dir) = path.parent() {
        vm.set_script_dir(dir.to_path_buf());
    }
    let result = vm.run(script);

    let mut mismatches = Vec::new();
    match (&result, &expected.runtime_error) {
        (Ok(()), Some(want)) => {
            mismatches.push(format!(
                "expected runtime error '{want}', but the program succeeded"
            ));
        }
        (Err(err), Some(want)) => {
            if &err.message != want {
                mismatches.push(format!(
                    "expected runtime error '{want}', got '{}'",
                    err.message
                ));
            }
        }
        (Err(err), None) => {
            mismatches.push(format!("unexpected runtime error '{}'", err.message));
        }
        (Ok(()), None) => {}
    }

    let output = sink.contents();
    let actual: Vec<&str> = output.lines().collect();
    for (i, want) in expected.lines.iter().enumerate() {
        match actual.get(i) {
            Some(got) if *got == want.as_str() => {}
            Some(got) => mismatches.push(format!("line {}: expected '{want}', got '{got}'", i + 1)),
            None => mismatches.push(format!("line {}: expected '{want}', got nothing", i + 1)),
        }
    }
    for got in actual.iter().skip(expected.lines.len()) {
        mismatches.push(format!("unexpected output '{got}'"));
    }
    Ok(mismatches)
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_capture(source: &str) -> Result<String, RunError> {
        let sink = CaptureSink::new();
        run_source(source, None, Box::new(sink.clone()), false)?;
        Ok(sink.contents())
    }

    #[test]
    fn compiles_and_runs_a_source_string() {
        assert_eq!(run_capture("print 1 + 2;").unwrap(), "3\n");
    }

    #[test]
    fn pipeline_errors_carry_their_stage() {
        assert!(matches!(
            compile_source("\"unterminated", "script"),
            Err(PipelineError::Lex(_))
        ));
        assert!(matches!(
            compile_source("let = 3;", "script"),
            Err(PipelineError::Parse(_))
        ));
        assert!(matches!(
            compile_source("break;", "script"),
            Err(PipelineError::Compile(_))
        ));
    }

    #[test]
    fn runtime_errors_surface_through_run_source() {
        let err = run_capture("throw \"boom\";").unwrap_err();
        match err {
            RunError::Runtime(e) => assert_eq!(e.message, "boom"),
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn expectations_parse_output_and_error_lines() {
        let source = "print 1; // expect: 1\n\
                      print 2; // expect: 2\n\
                      boom(); // expect runtime error: undefined variable 'boom'\n";
        let expectation = parse_expectations(source);
        assert_eq!(expectation.lines, vec!["1", "2"]);
        assert_eq!(
            expectation.runtime_error.as_deref(),
            Some("undefined variable 'boom'")
        );
    }

    #[test]
    fn check_expectations_flags_mismatches() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.kn");
        fs::write(&good, "print \"hi\"; // expect: hi\n").unwrap();
        assert!(check_expectations(&good).unwrap().is_empty());

        let bad = dir.path().join("bad.kn");
        fs::write(&bad, "print \"hi\"; // expect: bye\n").unwrap();
        let mismatches = check_expectations(&bad).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].contains("expected 'bye'"), "{mismatches:?}");
    }

    #[test]
    fn expected_runtime_errors_pass_the_harness() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("err.kn");
        fs::write(&file, "throw \"no\"; // expect runtime error: no\n").unwrap();
        assert!(check_expectations(&file).unwrap().is_empty());
    }

    #[test]
    fn file_loader_resolves_imports_next_to_the_script() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("util.kn"), "fn add(a, b) { ret a + b; }\n").unwrap();
        let main = dir.path().join("main.kn");
        fs::write(&main, "from \"util.kn\" import add;\nprint add(1, 2);\n").unwrap();

        let sink = CaptureSink::new();
        run_file(&main, Box::new(sink.clone()), false).unwrap();
        assert_eq!(sink.contents(), "3\n");
    }

    #[test]
    fn missing_files_report_io_errors() {
        let err = run_file(Path::new("no/such/file.kn"), Box::new(Vec::<u8>::new()), false)
            .unwrap_err();
        assert!(matches!(err, RunError::Io { .. }));
    }
}
