use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;

use gravlax::{Error, VM};

#[derive(Debug, Parser)]
#[command(name = "gravlax")]
#[command(about = "A bytecode interpreter for a small class-based scripting language")]
struct Cli {
    /// Script to run; omit it to get an interactive prompt
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };
    match cli.script {
        Some(path) => run_file(&path),
        None => repl(),
    }
}

fn run_file(path: &PathBuf) -> ExitCode {
    let src = match std::fs::read_to_string(path) {
        Ok(src) => src,
        Err(err) => {
            eprintln!("Could not read '{}': {}", path.display(), err);
            return ExitCode::from(74);
        }
    };
    let mut vm = VM::new();
    let mut stdout = io::stdout();
    match vm.interpret(&src, &mut stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Compile) => ExitCode::from(65),
        Err(Error::Runtime) => ExitCode::from(70),
    }
}

fn repl() -> ExitCode {
    let stdin = io::stdin();
    let mut vm = VM::new();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let mut stdout = io::stdout();
                // Errors were already reported on stderr; keep prompting.
                let _ = vm.interpret(&line, &mut stdout);
            }
            Err(err) => {
                eprintln!("Could not read input: {}", err);
                return ExitCode::from(74);
            }
        }
    }
    ExitCode::SUCCESS
}
