//! Whitespace-tolerant hex byte-stream I/O (spec.md §4.4/§6 "Hex file
//! format" and "Label file format").
//!
//! Generalized from the teacher's `vexfile` crate's read/write-trait idiom
//! (`ReadVexExt`/`WriteVexExt`, `read_file`/`write_file` over
//! `BufReader`/`BufWriter`), but operating on an ASCII hex text container
//! instead of a binary length-prefixed one.

use std::fs::File;
use std::io::{self, prelude::*, BufReader, BufWriter};
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("odd number of hex digits in input")]
    OddDigitCount,

    #[error("invalid hex digit {digit:?}")]
    InvalidDigit { digit: char },
}

/// Reads a whitespace-tolerant hex byte stream: every non-whitespace
/// character must be a hex digit, and all whitespace (including newlines
/// between one-instruction-per-line records) is ignored.
pub fn read<R: Read>(reader: &mut R) -> Result<Vec<u8>, HexError> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;

    let mut digits = text.chars().filter(|c| !c.is_whitespace());
    let mut bytes = Vec::new();
    loop {
        let hi = match digits.next() {
            Some(c) => c,
            None => break,
        };
        let lo = digits.next().ok_or(HexError::OddDigitCount)?;
        let byte = (hex_digit(hi)? << 4) | hex_digit(lo)?;
        bytes.push(byte);
    }
    Ok(bytes)
}

fn hex_digit(c: char) -> Result<u8, HexError> {
    c.to_digit(16)
        .map(|d| d as u8)
        .ok_or(HexError::InvalidDigit { digit: c })
}

/// Writes one assembled instruction per line, each byte as a lowercase hex
/// pair separated by single spaces. Each `instructions` entry is already a
/// fixed-width byte buffer for its opcode/access-mode form (see
/// `rvm::isa`'s width table), so there is no leading-zero-nibble padding to
/// do here — unlike the reference assembler, which derives each line from a
/// single big integer and must re-pad a dropped leading zero nibble, this
/// crate never collapses an instruction's leading zero byte in the first
/// place.
pub fn write_instructions<W: Write>(writer: &mut W, instructions: &[Vec<u8>]) -> io::Result<()> {
    for instr in instructions {
        let line: Vec<String> = instr.iter().map(|b| format!("{:02x}", b)).collect();
        writeln!(writer, "{}", line.join(" "))?;
    }
    Ok(())
}

/// Writes a label table: one `<address, hex, space-padded to 8 wide>   <name>`
/// record per line, sorted by address ascending.
pub fn write_label_table<W: Write>(writer: &mut W, labels: &[(u64, String)]) -> io::Result<()> {
    let mut sorted = labels.to_vec();
    sorted.sort_by_key(|(addr, _)| *addr);
    for (addr, name) in sorted {
        writeln!(writer, "{:>8x}   {}", addr, name)?;
    }
    Ok(())
}

pub trait ReadHexExt: Read + Sized {
    fn read_hex(&mut self) -> Result<Vec<u8>, HexError> {
        read(self)
    }
}

impl<R: Read + Sized> ReadHexExt for R {}

pub trait WriteHexExt: Write + Sized {
    fn write_hex_instructions(&mut self, instructions: &[Vec<u8>]) -> io::Result<()> {
        write_instructions(self, instructions)
    }

    fn write_hex_labels(&mut self, labels: &[(u64, String)]) -> io::Result<()> {
        write_label_table(self, labels)
    }
}

impl<W: Write + Sized> WriteHexExt for W {}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, HexError> {
    BufReader::new(File::open(path)?).read_hex()
}

pub fn write_instructions_file<P: AsRef<Path>>(
    path: P,
    instructions: &[Vec<u8>],
) -> io::Result<()> {
    BufWriter::new(File::create(path)?).write_hex_instructions(instructions)
}

pub fn write_label_table_file<P: AsRef<Path>>(path: P, labels: &[(u64, String)]) -> io::Result<()> {
    BufWriter::new(File::create(path)?).write_hex_labels(labels)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_ignores_all_whitespace() {
        let mut input = "de ad\nbe  ef\t00\n".as_bytes();
        let bytes = read(&mut input).unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef, 0x00]);
    }

    #[test]
    fn read_rejects_odd_digit_count() {
        let mut input = "abc".as_bytes();
        assert!(matches!(read(&mut input), Err(HexError::OddDigitCount)));
    }

    #[test]
    fn write_instructions_one_line_each() {
        let mut out = Vec::new();
        write_instructions(&mut out, &[vec![0x01, 0x02], vec![0xff]]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "01 02\nff\n");
    }

    #[test]
    fn write_label_table_sorts_and_pads_address() {
        let mut out = Vec::new();
        write_label_table(&mut out, &[(0x10, "bar".into()), (0x0, "foo".into())]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "       0   foo\n      10   bar\n"
        );
    }

    #[test]
    fn round_trips_through_write_then_read() {
        let instructions = vec![vec![0xde, 0xad, 0xbe, 0xef], vec![0x00]];
        let mut buf = Vec::new();
        write_instructions(&mut buf, &instructions).unwrap();
        let flat = read(&mut buf.as_slice()).unwrap();
        assert_eq!(flat, vec![0xde, 0xad, 0xbe, 0xef, 0x00]);
    }
}
