//! Argument parsing and runtime smoke tests for the CLI.

use clap::Parser;
use skald_cli::{Cli, Runtime};

#[test]
fn test_parse_file_argument() {
    let cli = Cli::parse_from(["skald", "script.sk"]);
    assert_eq!(cli.file.as_deref(), Some("script.sk"));
    assert!(cli.eval.is_none());
    assert!(!cli.repl);
}

#[test]
fn test_parse_eval_argument() {
    let cli = Cli::parse_from(["skald", "--eval", "var x = 1;"]);
    assert_eq!(cli.eval.as_deref(), Some("var x = 1;"));
}

#[test]
fn test_parse_repl_and_dump_flags() {
    let cli = Cli::parse_from(["skald", "--repl", "--dump-bytecode"]);
    assert!(cli.repl);
    assert!(cli.dump_bytecode);
}

#[test]
fn test_execute_file_from_disk() {
    let dir = std::env::temp_dir().join("skald_cli_test");
    std::fs::create_dir_all(&dir).unwrap();
    let script = dir.join("entry.sk");
    std::fs::write(&script, "var value = 40 + 2;").unwrap();

    let mut runtime = Runtime::new();
    runtime.execute_file(script.to_str().unwrap()).unwrap();

    let vm = runtime.vm();
    vm.stack_resize(2).unwrap();
    vm.stack_load_variable(1, 0, "value");
    assert_eq!(vm.stack_read_number(1).unwrap(), 42.0);
}

#[test]
fn test_imports_resolve_next_to_the_entry_script() {
    let dir = std::env::temp_dir().join("skald_cli_import_test");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("util.sk"), "func triple(x) { return x * 3; }").unwrap();
    std::fs::write(
        dir.join("app.sk"),
        r#"import "util" for triple; var out = triple(14);"#,
    )
    .unwrap();

    let mut runtime = Runtime::new();
    runtime
        .execute_file(dir.join("app.sk").to_str().unwrap())
        .unwrap();

    let vm = runtime.vm();
    vm.stack_resize(2).unwrap();
    vm.stack_load_variable(1, 0, "out");
    assert_eq!(vm.stack_read_number(1).unwrap(), 42.0);
}

#[test]
fn test_missing_file_is_an_io_error() {
    let mut runtime = Runtime::new();
    assert!(runtime.execute_file("/no/such/path.sk").is_err());
}

#[test]
fn test_dump_bytecode_renders_opcodes() {
    let mut runtime = Runtime::new();
    runtime.execute_string("var x = 1 + 2;").unwrap();
    let dump = runtime.vm().dump_module_bytecode(0).unwrap();
    assert!(dump.contains("MATH_ADD"));
    assert!(dump.contains("RETURN"));
}
