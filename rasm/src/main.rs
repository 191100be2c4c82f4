//! `rasm` CLI: assembles a source file (or stdin) to a hex image (or stdout),
//! optionally alongside a label table (spec.md §4.4 "Assembler CLI").

#[macro_use]
extern crate clap;

use std::fs;
use std::io::{self, Read};

use clap::Arg;
use thiserror::Error;

#[derive(Error, Debug)]
enum CliError {
    #[error("reading \"{path}\": {source}")]
    ReadInput { path: String, source: io::Error },

    #[error("reading stdin: {0}")]
    ReadStdin(io::Error),

    #[error("writing hex image to \"{path}\": {source}")]
    WriteImage { path: String, source: io::Error },

    #[error("writing hex image to stdout: {0}")]
    WriteImageStdout(io::Error),

    #[error("writing label table to \"{path}\": {source}")]
    WriteLabels { path: String, source: io::Error },

    #[error(transparent)]
    Asm(#[from] rasm::AsmError),
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("rasm: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("INPUT")
                .help("assembly source file; defaults to stdin")
                .index(1),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .takes_value(true)
                .value_name("PATH")
                .help("hex image output file; defaults to stdout"),
        )
        .arg(
            Arg::with_name("labels")
                .short("l")
                .long("labels")
                .takes_value(true)
                .value_name("PATH")
                .help("also write the resolved label table to PATH"),
        )
        .get_matches();

    let source = read_input(matches.value_of("INPUT"))?;
    let program = rasm::assemble(&source)?;

    write_image(matches.value_of("output"), &program.instructions)?;

    if let Some(path) = matches.value_of("labels") {
        hexio::write_label_table_file(path, &program.labels).map_err(|source| CliError::WriteLabels {
            path: path.to_string(),
            source,
        })?;
    }

    Ok(())
}

fn read_input(path: Option<&str>) -> Result<String, CliError> {
    match path {
        Some(path) => fs::read_to_string(path).map_err(|source| CliError::ReadInput {
            path: path.to_string(),
            source,
        }),
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .map_err(CliError::ReadStdin)?;
            Ok(text)
        }
    }
}

fn write_image(path: Option<&str>, instructions: &[Vec<u8>]) -> Result<(), CliError> {
    match path {
        Some(path) => {
            hexio::write_instructions_file(path, instructions).map_err(|source| CliError::WriteImage {
                path: path.to_string(),
                source,
            })
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            hexio::write_instructions(&mut lock, instructions).map_err(CliError::WriteImageStdout)
        }
    }
}
