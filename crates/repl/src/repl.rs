//! The interactive REPL.
//!
//! One logical line per submission, fed to a persistent VM so globals
//! survive between lines. History is kept in `~/.jmpl_history`.

use std::path::PathBuf;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use jmpl_runtime::{RuntimeConfig, Vm};

const PROMPT: &str = ">> ";

pub fn run(config: RuntimeConfig) -> rustyline::Result<()> {
    println!("JMPL v{}", env!("CARGO_PKG_VERSION"));

    let mut vm = Vm::new(config);
    let mut editor = DefaultEditor::new()?;

    let history = history_path();
    if let Some(path) = &history {
        // Missing history is fine on first run.
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e),
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    Ok(())
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".jmpl_history"))
}
