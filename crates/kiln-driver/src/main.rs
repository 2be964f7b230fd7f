use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use ariadne::{Label, Report, ReportKind, Source};
use clap::{Parser as ClapParser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kiln_driver::{
    FileLoader, PipelineError, RunError, check_expectations, compile_source, run_source,
};
use kiln_vm::{RuntimeError, Vm, debug};

// sysexits-style codes: EX_DATAERR, EX_SOFTWARE, EX_IOERR.
const EXIT_COMPILE: i32 = 65;
const EXIT_RUNTIME: i32 = 70;
const EXIT_IO: i32 = 74;

#[derive(ClapParser)]
#[command(name = "kiln", about = "Kiln language CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Log phase timings and module loads to stderr
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the token stream of a file
    Lex {
        /// Path to .kn file
        file: PathBuf,
        /// One JSON object per token instead of the human dump
        #[arg(long)]
        json: bool,
    },
    /// Dump the parsed AST of a file
    Parse {
        /// Path to .kn file
        file: PathBuf,
    },
    /// Compile a file and disassemble every function
    Dis {
        /// Path to .kn file
        file: PathBuf,
    },
    /// Compile and run a file
    Run {
        /// Path to .kn file
        file: PathBuf,
        /// Disassemble each instruction as it executes
        #[arg(long)]
        trace: bool,
    },
    /// Run test files and check their `// expect:` comments
    Test {
        /// Test files; names starting with '_' are skipped as import helpers
        files: Vec<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match cli.command {
        Some(Commands::Lex { file, json }) => cmd_lex(&file, json),
        Some(Commands::Parse { file }) => cmd_parse(&file),
        Some(Commands::Dis { file }) => cmd_dis(&file),
        Some(Commands::Run { file, trace }) => cmd_run(&file, trace),
        Some(Commands::Test { files }) => cmd_test(&files),
        None => cmd_repl(),
    };
    process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(env_filter)
        .init();
}

// ─── Commands ────────────────────────────────────────────────────────

fn cmd_lex(file: &Path, json: bool) -> i32 {
    let source = match read_source(file) {
        Ok(s) => s,
        Err(e) => return io_failure(e),
    };
    let tokens = match kiln_lexer::lex(&source) {
        Ok(tokens) => tokens,
        Err(e) => {
            report_span(file, &source, e.span, &e.message);
            return EXIT_COMPILE;
        }
    };
    if json {
        for tok in &tokens {
            let value = serde_json::json!({
                "kind": format!("{:?}", tok.kind),
                "line": tok.line,
                "span": [tok.span.0, tok.span.1],
                "first_on_line": tok.first_on_line,
            });
            println!("{value}");
        }
    } else {
        for tok in &tokens {
            println!("{:4} {:?}", tok.line, tok.kind);
        }
        println!("({} tokens)", tokens.len());
    }
    0
}

fn cmd_parse(file: &Path) -> i32 {
    let source = match read_source(file) {
        Ok(s) => s,
        Err(e) => return io_failure(e),
    };
    let tokens = match kiln_lexer::lex(&source) {
        Ok(tokens) => tokens,
        Err(e) => {
            report_span(file, &source, e.span, &e.message);
            return EXIT_COMPILE;
        }
    };
    match kiln_parser::parse(tokens) {
        Ok(program) => {
            for stmt in &program {
                println!("{stmt:#?}");
            }
            println!("({} statements)", program.len());
            0
        }
        Err(errors) => {
            for e in &errors {
                report_span(file, &source, e.span, &e.message);
            }
            EXIT_COMPILE
        }
    }
}

fn cmd_dis(file: &Path) -> i32 {
    let source = match read_source(file) {
        Ok(s) => s,
        Err(e) => return io_failure(e),
    };
    match compile_source(&source, "script") {
        Ok(script) => {
            print!("{}", debug::disassemble_recursive(&script.chunk, &script.name));
            0
        }
        Err(e) => report_pipeline(file, &source, &e),
    }
}

fn cmd_run(file: &Path, trace: bool) -> i32 {
    let source = match read_source(file) {
        Ok(s) => s,
        Err(e) => return io_failure(e),
    };
    let dir = file.parent().map(Path::to_path_buf);
    match run_source(&source, dir, Box::new(io::stdout()), trace) {
        Ok(()) => 0,
        Err(RunError::Pipeline(e)) => report_pipeline(file, &source, &e),
        Err(RunError::Runtime(e)) => report_runtime(&e),
        Err(e @ RunError::Io { .. }) => {
            eprintln!("error: {e}");
            EXIT_IO
        }
    }
}

fn cmd_test(files: &[PathBuf]) -> i32 {
    let mut passed = 0usize;
    let mut failed = 0usize;
    for file in files {
        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with('_') {
            println!("skip {}", file.display());
            continue;
        }
        match check_expectations(file) {
            Ok(mismatches) if mismatches.is_empty() => {
                println!("ok   {}", file.display());
                passed += 1;
            }
            Ok(mismatches) => {
                println!("FAIL {}", file.display());
                for m in &mismatches {
                    println!("     {m}");
                }
                failed += 1;
            }
            Err(e) => {
                println!("FAIL {}: {e}", file.display());
                failed += 1;
            }
        }
    }
    println!("\n{} tests: {} passed, {} failed", passed + failed, passed, failed);
    if failed > 0 { 1 } else { 0 }
}

/// Line-by-line REPL. Globals persist across lines because the same VM runs
/// every compiled fragment.
fn cmd_repl() -> i32 {
    println!("kiln {} (Ctrl-D to exit)", env!("CARGO_PKG_VERSION"));
    let mut vm = Vm::new(Box::new(io::stdout()));
    vm.set_loader(Box::new(FileLoader));
    if let Ok(dir) = env::current_dir() {
        vm.set_script_dir(dir);
    }
    let mut line = String::new();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return EXIT_IO;
        }
        line.clear();
        match io::stdin().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("error: {e}");
                return EXIT_IO;
            }
        }
        let source = line.trim();
        if source.is_empty() {
            continue;
        }
        match compile_source(source, "script") {
            Ok(script) => {
                if let Err(e) = vm.run(script) {
                    report_runtime(&e);
                }
            }
            Err(e) => {
                report_pipeline(Path::new("<repl>"), source, &e);
            }
        }
    }
    0
}

// ─── Diagnostics ─────────────────────────────────────────────────────

fn read_source(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

fn io_failure(err: anyhow::Error) -> i32 {
    eprintln!("error: {err:#}");
    EXIT_IO
}

fn report_pipeline(file: &Path, source: &str, err: &PipelineError) -> i32 {
    match err {
        PipelineError::Lex(e) => report_span(file, source, e.span, &e.message),
        PipelineError::Parse(errors) => {
            for e in errors {
                report_span(file, source, e.span, &e.message);
            }
        }
        PipelineError::Compile(errors) => {
            for e in errors {
                report_span(file, source, line_span(source, e.line), &e.message);
            }
        }
    }
    EXIT_COMPILE
}

fn report_runtime(err: &RuntimeError) -> i32 {
    eprintln!("error: {}", err.message);
    for frame in &err.traceback {
        eprintln!("{frame}");
    }
    EXIT_RUNTIME
}

fn report_span(file: &Path, source: &str, span: (u32, u32), message: &str) {
    let name = file.display().to_string();
    let range = span.0 as usize..span.1 as usize;
    let _ = Report::build(ReportKind::Error, (name.as_str(), range.clone()))
        .with_message(message)
        .with_label(Label::new((name.as_str(), range)).with_message(message))
        .finish()
        .eprint((name.as_str(), Source::from(source)));
}

/// Byte span of a 1-based source line, for errors that carry no span.
fn line_span(source: &str, line: u32) -> (u32, u32) {
    let mut offset = 0u32;
    for (idx, text) in source.split_inclusive('\n').enumerate() {
        if idx as u32 + 1 == line {
            let body = text.trim_end_matches(['\n', '\r']).len() as u32;
            return (offset, offset + body);
        }
        offset += text.len() as u32;
    }
    (0, 0)
}
