//! Skald command-line entry point.

use clap::Parser;
use skald_cli::{run_repl, Cli, CliError, Runtime};

fn main() {
    let cli = Cli::parse();

    let mut runtime = Runtime::new().with_dump_bytecode(cli.dump_bytecode);

    let result = if let Some(file) = cli.file.as_deref() {
        runtime.execute_file(file)
    } else if let Some(source) = cli.eval.as_deref() {
        runtime.execute_string(source)
    } else if cli.repl {
        run_repl(&mut runtime)
    } else {
        println!("Usage:");
        println!("  skald <FILE>          Execute a script file");
        println!("  skald --eval <CODE>   Evaluate inline source");
        println!("  skald --repl          Start the interactive REPL");
        println!();
        println!("Run 'skald --help' for all options.");
        Ok(())
    };

    if let Err(err) = result {
        match err {
            // VM errors were already reported through the error hook.
            CliError::Vm(_) => {}
            other => eprintln!("{}", other),
        }
        std::process::exit(1);
    }
}
