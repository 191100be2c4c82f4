//! VM CLI: loads an assembled hex image and executes it on the requested
//! back-end (spec.md §6 "VM CLI").

#[macro_use]
extern crate clap;

use clap::Arg;
use thiserror::Error;

use rvm::vm::{ExecutionBackend, Prologue, Vm};

#[derive(Error, Debug)]
enum CliError {
    #[error("reading \"{path}\": {source}")]
    Read { path: String, #[source] source: hexio::HexError },

    #[error(
        "unknown execution type {0:?}; expected INTERPRETER, AArch64JIT or x86_64JIT"
    )]
    UnknownBackend(String),

    #[error("invalid --memory value {0:?}")]
    InvalidMemory(String),

    #[error(transparent)]
    Vm(#[from] rvm::VmError),
}

fn main() {
    if let Err(err) = run() {
        eprintln!("rvm: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("IMAGE")
                .help("hex image to execute")
                .required(true)
                .index(1),
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

    let image_path = matches.value_of("IMAGE").unwrap();
    let image = hexio::read_file(image_path).map_err(|source| CliError::Read {
        path: image_path.to_string(),
        source,
    })?;

    let memory_mib: u64 = matches
        .value_of("memory")
        .unwrap()
        .parse()
        .map_err(|_| CliError::InvalidMemory(matches.value_of("memory").unwrap().to_string()))?;

    let backend = parse_backend(matches.value_of("execution_type").unwrap())?;

    let mut vm = Vm::new(&image, memory_mib, Prologue::standard());
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
