//! Ember CLI.
//!
//! Two modes: `ember script.em` runs a file, `ember` with no script starts
//! an interactive session against one long-lived VM, so definitions stick
//! around between lines. Diagnostics go to stderr; program output goes to
//! stdout; the exit code tells scripts what went wrong.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::info;

use ember_runtime::{InterpretError, Vm, VmOptions};

const EXIT_OK: i32 = 0;
/// Command-line misuse.
const EXIT_USAGE: i32 = 64;
const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;
const EXIT_IO_ERROR: i32 = 74;

#[derive(Parser)]
#[command(name = "ember")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ember interpreter - run a script or start a REPL", long_about = None)]
struct Cli {
    /// Script to run; omit to start an interactive session
    script: Option<PathBuf>,

    /// Run the garbage collector on every allocation (slow; flushes out
    /// rooting bugs)
    #[arg(long)]
    stress_gc: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    EXIT_OK
                }
                _ => EXIT_USAGE,
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ember_core=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = VmOptions {
        stress_gc: gc_stress_enabled(&cli),
    };
    if options.stress_gc {
        info!("GC stress mode enabled");
    }

    let code = match cli.script {
        Some(path) => run_file(&path, options),
        None => repl(options),
    };
    process::exit(code);
}

/// The `--stress-gc` flag, with `EMBER_STRESS_GC` as the environment
/// fallback so test harnesses can force it without touching argv.
fn gc_stress_enabled(cli: &Cli) -> bool {
    cli.stress_gc || std::env::var_os("EMBER_STRESS_GC").is_some()
}

fn run_file(path: &Path, options: VmOptions) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read \"{}\": {err}", path.display());
            return EXIT_IO_ERROR;
        }
    };
    let mut vm = Vm::with_options(options);
    match vm.interpret(&source) {
        Ok(()) => EXIT_OK,
        Err(error) => report(&error),
    }
}

fn report(error: &InterpretError) -> i32 {
    eprintln!("{error}");
    match error {
        InterpretError::Compile(_) => EXIT_COMPILE_ERROR,
        InterpretError::Runtime(_) => EXIT_RUNTIME_ERROR,
    }
}

fn repl(options: VmOptions) -> i32 {
    let mut vm = Vm::with_options(options);
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start line editor: {err}");
            return EXIT_IO_ERROR;
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        // Absent on first run; any other failure is not worth dying over.
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Errors are reported and the session keeps going; the VM
                // unwinds its stack but keeps globals and classes.
                if let Err(error) = vm.interpret(&line) {
                    eprintln!("{error}");
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Input error: {err}");
                return EXIT_IO_ERROR;
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    EXIT_OK
}

fn history_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ember_history"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_run_file_exit_codes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let write = |name: &str, contents: &str| {
            let path = dir.path().join(name);
            fs::write(&path, contents).expect("write script");
            path
        };

        let ok = write("ok.em", "var x = 1 + 2; x = x * 2;");
        assert_eq!(run_file(&ok, VmOptions::default()), EXIT_OK);

        let compile = write("compile.em", "var = 1;");
        assert_eq!(run_file(&compile, VmOptions::default()), EXIT_COMPILE_ERROR);

        let runtime = write("runtime.em", "missing();");
        assert_eq!(run_file(&runtime, VmOptions::default()), EXIT_RUNTIME_ERROR);

        let missing = dir.path().join("does-not-exist.em");
        assert_eq!(run_file(&missing, VmOptions::default()), EXIT_IO_ERROR);
    }

    #[test]
    #[serial]
    fn test_stress_env_var_enables_stress() {
        let plain = Cli {
            script: None,
            stress_gc: false,
        };
        unsafe { std::env::set_var("EMBER_STRESS_GC", "1") };
        assert!(gc_stress_enabled(&plain));
        unsafe { std::env::remove_var("EMBER_STRESS_GC") };
        assert!(!gc_stress_enabled(&plain));

        let flagged = Cli {
            script: None,
            stress_gc: true,
        };
        assert!(gc_stress_enabled(&flagged));
    }
}
