//! `rvmctl`: assembles-or-loads and runs a program in one step, generalized
//! from the teacher's `vex` crate's `PROGRAM`-vs-`-a`/`--assembly` `ArgGroup`
//! (spec.md §6 "Convenience CLI").

#[macro_use]
extern crate clap;

use std::fs;

use clap::{Arg, ArgGroup};
use thiserror::Error;

use rvm::vm::{ExecutionBackend, Prologue, Vm};

#[derive(Error, Debug)]
enum CliError {
    #[error("reading \"{path}\": {source}")]
    ReadHex { path: String, source: hexio::HexError },

    #[error("reading \"{path}\": {source}")]
    ReadAssembly { path: String, source: std::io::Error },

    #[error("assembling \"{path}\": {source}")]
    Assemble { path: String, source: rasm::AsmError },

    #[error("unknown execution type {0:?}; expected INTERPRETER, AArch64JIT or x86_64JIT")]
    UnknownBackend(String),

    #[error("invalid --memory value {0:?}")]
    InvalidMemory(String),

    #[error(transparent)]
    Vm(#[from] rvm::VmError),
}

fn main() {
    if let Err(err) = run() {
        eprintln!("rvmctl: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("PROGRAM")
                .help("hex image to run")
                .index(1),
        )
        .arg(
            Arg::with_name("assembly")
                .short("a")
                .long("assembly")
                .takes_value(true)
                .value_name("PATH")
                .help("assembly source to assemble and run"),
        )
        .group(
            ArgGroup::with_name("input")
                .args(&["PROGRAM", "assembly"])
                .required(true),
        )
        .arg(
            Arg::with_name("memory")
                .short("m")
                .long("memory")
                .takes_value(true)
                .value_name("MIB")
                .default_value("4")
                .help("linear memory size in mebibytes"),
        )
        .arg(
            Arg::with_name("execution_type")
                .short("e")
                .long("execution-type")
                .takes_value(true)
                .value_name("BACKEND")
                .default_value("INTERPRETER")
                .help("INTERPRETER, AArch64JIT or x86_64JIT"),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .help("enable debug tracing"),
        )
        .get_matches();

    if matches.is_present("debug") {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::init();
    }

    let (image, prologue) = match matches.value_of("PROGRAM") {
        Some(path) => {
            let image = hexio::read_file(path).map_err(|source| CliError::ReadHex {
                path: path.to_string(),
                source,
            })?;
            (image, Prologue::standard())
        }
        None => {
            let path = matches.value_of("assembly").unwrap();
            let source = fs::read_to_string(path).map_err(|source| CliError::ReadAssembly {
                path: path.to_string(),
                source,
            })?;
            let program = rasm::assemble(&source).map_err(|source| CliError::Assemble {
                path: path.to_string(),
                source,
            })?;
            (program.image(), program.prologue)
        }
    };

    let memory_mib: u64 = matches
        .value_of("memory")
        .unwrap()
        .parse()
        .map_err(|_| CliError::InvalidMemory(matches.value_of("memory").unwrap().to_string()))?;

    let backend = parse_backend(matches.value_of("execution_type").unwrap())?;

    let mut vm = Vm::new(&image, memory_mib, prologue);
    let exit = vm.run(backend)?;
    log::debug!("final registers: {:?}", exit.registers);
    log::debug!("final flags: {:?}", exit.flags);

    Ok(())
}

fn parse_backend(text: &str) -> Result<ExecutionBackend, CliError> {
    match text {
        "INTERPRETER" => Ok(ExecutionBackend::Interpreter),
        "AArch64JIT" => Ok(ExecutionBackend::Aarch64Jit),
        "x86_64JIT" => Ok(ExecutionBackend::X86_64Jit),
        other => Err(CliError::UnknownBackend(other.to_string())),
    }
}
