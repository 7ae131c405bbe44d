//! Command-line entry point: runs a script file, or drops into a REPL when
//! invoked with no arguments. Exit codes follow the conventions `sysexits.h`
//! popularized and clox itself used: 64 for bad usage, 65 for a compile
//! error, 70 for a runtime error, 74 for an I/O error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use quill_core::ObjClosure;
use quill_compiler::compile;
use quill_vm::Vm;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Parser)]
#[command(name = "quill", about = "Bytecode compiler and stack-based virtual machine")]
struct Cli {
    /// Script to run. Omit to start an interactive REPL.
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .with_target(false)
        .init();

    if std::env::args().count() > 2 {
        eprintln!("Usage: quill [path]");
        return ExitCode::from(64);
    }

    let cli = Cli::parse();
    let code = match cli.script {
        Some(path) => run_file(&path),
        None => run_repl(),
    };
    ExitCode::from(code)
}

fn run_file(path: &Path) -> u8 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {err}", path.display());
            return 74;
        }
    };
    let mut vm = Vm::new();
    run_source(&mut vm, &source)
}

fn run_repl() -> u8 {
    let mut editor = DefaultEditor::new().expect("failed to initialize line editor");
    let mut vm = Vm::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                run_source(&mut vm, &line);
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(err) => {
                eprintln!("Readline error: {err}");
                break;
            }
        }
    }
    0
}

/// Compiles and runs one program against an already-initialized `Vm`,
/// returning the exit code `main` should propagate.
fn run_source(vm: &mut Vm, source: &str) -> u8 {
    let function_handle = match compile(source, vm.heap_mut()) {
        Ok(handle) => handle,
        Err(errors) => {
            for error in &errors {
                eprintln!("{error}");
            }
            return 65;
        }
    };
    let closure_handle = vm
        .heap_mut()
        .alloc_closure(ObjClosure::new(function_handle, 0), |h| h.mark_handle(function_handle));
    match vm.interpret(closure_handle) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            70
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn running_a_valid_script_exits_zero() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("ok.ql");
        fs::write(&script, "print 1 + 2 * 3;").unwrap();

        assert_eq!(run_file(&script), 0);
    }

    #[test]
    fn running_a_script_with_a_compile_error_exits_65() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("bad.ql");
        fs::write(&script, "var;").unwrap();

        assert_eq!(run_file(&script), 65);
    }

    #[test]
    fn running_a_script_with_a_runtime_error_exits_70() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("runtime_error.ql");
        fs::write(&script, "print -true;").unwrap();

        assert_eq!(run_file(&script), 70);
    }

    #[test]
    fn running_a_missing_file_exits_74() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("does_not_exist.ql");

        assert_eq!(run_file(&missing), 74);
    }
}
