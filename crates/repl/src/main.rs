//! JMPL command-line interface.
//!
//! With no script argument, starts the interactive REPL; with one, runs it.
//! Exit codes: 0 on success, 64 for usage errors, 65 for compile errors,
//! 70 for runtime errors, 74 for unreadable input files.

mod repl;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tracing_subscriber::EnvFilter;

use jmpl_runtime::{InterpretResult, RuntimeConfig, Vm};

const EX_USAGE: u8 = 64;
const EX_DATA: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IO: u8 = 74;

#[derive(Parser)]
#[command(name = "jmpl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The JMPL interpreter", long_about = None)]
struct Cli {
    /// Script to run; omit to start the REPL
    script: Option<PathBuf>,

    /// Run a garbage collection at every allocation (for debugging)
    #[arg(long)]
    stress_gc: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EX_USAGE);
        }
    };

    let config = RuntimeConfig::new().with_stress_gc(cli.stress_gc);
    match cli.script {
        Some(path) => run_file(&path, config),
        None => match repl::run(config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e}");
                ExitCode::from(EX_SOFTWARE)
            }
        },
    }
}

fn run_file(path: &Path, config: RuntimeConfig) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read \"{}\": {}", path.display(), e);
            return ExitCode::from(EX_IO);
        }
    };

    let mut vm = Vm::new(config);
    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(EX_DATA),
        InterpretResult::RuntimeError => ExitCode::from(EX_SOFTWARE),
    }
}
