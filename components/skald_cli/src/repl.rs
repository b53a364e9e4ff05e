//! The interactive REPL.
//!
//! Each input line runs in a fresh anonymous module; use `var` plus a
//! later `import` of a named module for state that should persist.

use crate::error::{CliError, CliResult};
use crate::runtime::Runtime;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Runs the read-eval-print loop until the user exits.
pub fn run_repl(runtime: &mut Runtime) -> CliResult<()> {
    let mut editor = DefaultEditor::new()
        .map_err(|err| CliError::Repl(format!("failed to initialize the editor: {}", err)))?;

    println!("Skald scripting language");
    println!("Type source code, or 'exit' to quit.");

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == "exit" || trimmed == "quit" {
                    break;
                }

                let _ = editor.add_history_entry(&line);

                // Errors were already reported through the VM's error
                // hook; keep the loop alive.
                let _ = runtime.execute_string(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                return Err(CliError::Repl(err.to_string()));
            }
        }
    }

    Ok(())
}
