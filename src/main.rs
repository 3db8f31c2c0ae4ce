use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use tinylang::bytecode::compile::Compiler;
use tinylang::bytecode::disasm::{self, DisasmOptions};
use tinylang::bytecode::image;
use tinylang::error::ErrorReporter;
use tinylang::frontend::lexer::Lexer;
use tinylang::frontend::parser::Parser as SourceParser;
use tinylang::lang::value::FunctionId;
use tinylang::repl::Repl;
use tinylang::runtime::gc::Heap;
use tinylang::runtime::vm::Vm;

#[derive(Parser, Debug)]
#[command(name = "tl", version, about = "TinyLang toolchain")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a source file
    Run { file: PathBuf },

    /// Start the interactive shell
    Repl,

    /// Compile a source file to a bytecode image
    Compile {
        input: PathBuf,
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        #[arg(short, long)]
        verbose: bool,
        #[arg(short = 'd', long = "disassemble")]
        disassemble: bool,
        /// Optimization level; -O0 disables constant folding
        #[arg(short = 'O', value_name = "LEVEL", default_value = "1")]
        opt_level: String,
    },

    /// Print a bytecode image as readable disassembly
    Disasm {
        input: PathBuf,
        #[arg(short, long)]
        verbose: bool,
        #[arg(long)]
        no_constants: bool,
        #[arg(long)]
        no_lines: bool,
        /// Annotate jump targets
        #[arg(long)]
        flow: bool,
        /// Show per-instruction stack effects
        #[arg(long)]
        stack: bool,
    },

    /// Run files and report time, instructions, and memory
    Bench {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        None | Some(Command::Repl) => run_repl(),
        Some(Command::Run { file }) => run_file(&file),
        Some(Command::Compile {
            input,
            output,
            verbose,
            disassemble,
            opt_level,
        }) => compile_file(&input, output, verbose, disassemble, &opt_level),
        Some(Command::Disasm {
            input,
            verbose,
            no_constants,
            no_lines,
            flow,
            stack,
        }) => disasm_file(&input, verbose, no_constants, no_lines, flow, stack),
        Some(Command::Bench { files, json }) => bench_files(&files, json),
    };

    std::process::exit(code);
}

fn run_repl() -> i32 {
    match Repl::new().run() {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("repl error: {}", error);
            1
        }
    }
}

fn run_file(file: &Path) -> i32 {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("{:#}", error);
            return 1;
        }
    };

    let mut vm = Vm::new();
    vm.interpret(&source).exit_code()
}

/// Front end only: lexes, parses, and compiles into a fresh heap.
/// Diagnostics go to stderr; `None` means something was reported.
fn compile_source(source: &str, fold: bool) -> Option<(FunctionId, Heap)> {
    let mut reporter = ErrorReporter::new();
    reporter.set_source(source);
    let mut heap = Heap::new();

    let tokens = Lexer::new(source, &mut reporter).scan_all();
    if reporter.has_errors() {
        reporter.print_all();
        return None;
    }

    let program = SourceParser::new(tokens, &mut reporter).parse();
    if reporter.has_errors() {
        reporter.print_all();
        return None;
    }

    let function = Compiler::new(&mut reporter, &mut heap)
        .with_folding(fold)
        .compile(&program);
    match function {
        Some(function) => Some((function, heap)),
        None => {
            reporter.print_all();
            None
        }
    }
}

fn compile_file(
    input: &Path,
    output: Option<PathBuf>,
    verbose: bool,
    disassemble: bool,
    opt_level: &str,
) -> i32 {
    let source = match read_source(input) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("{:#}", error);
            return 1;
        }
    };

    let output = output.unwrap_or_else(|| input.with_extension("tbc"));
    let fold = opt_level != "0";

    if verbose {
        println!("Compiling {} -> {}", input.display(), output.display());
        if !fold {
            println!("Constant folding disabled");
        }
    }

    let Some((function, heap)) = compile_source(&source, fold) else {
        return 1;
    };

    let image = image::lower(&heap.function(function).chunk, &heap);
    let encoded = image::encode(&image);

    if verbose {
        println!(
            "{} bytes of code, {} constants, {} bytes on disk",
            image.code.len(),
            image.constants.len(),
            encoded.len()
        );
    }

    if disassemble {
        print!(
            "{}",
            disasm::disassemble_function(&heap, function, &DisasmOptions::default())
        );
    }

    if let Err(error) = fs::write(&output, &encoded)
        .with_context(|| format!("failed to write {}", output.display()))
    {
        eprintln!("{:#}", error);
        return 1;
    }

    0
}

fn disasm_file(
    input: &Path,
    verbose: bool,
    no_constants: bool,
    no_lines: bool,
    flow: bool,
    stack: bool,
) -> i32 {
    let bytes = match fs::read(input).with_context(|| format!("failed to read {}", input.display()))
    {
        Ok(bytes) => bytes,
        Err(error) => {
            eprintln!("{:#}", error);
            return 1;
        }
    };

    let image = match image::decode(&bytes) {
        Ok(image) => image,
        Err(error) => {
            eprintln!("{}: {}", input.display(), error);
            return 1;
        }
    };

    if verbose {
        println!(
            "{}: {} bytes of code, {} constants",
            input.display(),
            image.code.len(),
            image.constants.len()
        );
    }

    let options = DisasmOptions {
        show_constants: !no_constants,
        show_lines: !no_lines,
        flow,
        stack_effects: stack,
    };
    let name = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("script");
    print!("{}", disasm::disassemble(&image, name, &options));

    0
}

#[derive(Debug, Serialize)]
struct BenchResult {
    name: String,
    execution_time_ms: f64,
    instructions: u64,
    heap_bytes: usize,
    success: bool,
}

fn bench_files(files: &[PathBuf], json: bool) -> i32 {
    let mut results = Vec::new();

    for file in files {
        let name = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let source = match read_source(file) {
            Ok(source) => source,
            Err(error) => {
                eprintln!("{:#}", error);
                results.push(BenchResult {
                    name,
                    execution_time_ms: 0.0,
                    instructions: 0,
                    heap_bytes: 0,
                    success: false,
                });
                continue;
            }
        };

        let mut vm = Vm::new();
        let start = Instant::now();
        let outcome = vm.interpret(&source);
        let elapsed = start.elapsed();

        results.push(BenchResult {
            name,
            execution_time_ms: elapsed.as_secs_f64() * 1000.0,
            instructions: vm.instructions_executed(),
            heap_bytes: vm.bytes_allocated(),
            success: outcome == tinylang::InterpretResult::Ok,
        });
    }

    if json {
        match serde_json::to_string_pretty(&results) {
            Ok(text) => println!("{}", text),
            Err(error) => {
                eprintln!("failed to serialize results: {}", error);
                return 1;
            }
        }
    } else {
        for result in &results {
            if result.success {
                println!(
                    "\u{2713} {}: {:.2}ms, {} instructions, {} heap bytes",
                    result.name, result.execution_time_ms, result.instructions, result.heap_bytes
                );
            } else {
                println!("\u{2717} {}: failed", result.name);
            }
        }
    }

    if results.iter().all(|r| r.success) {
        0
    } else {
        1
    }
}

fn read_source(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))
}
