//! Output writers. All of them consume the finalized statement stream;
//! every statement is expected to be a resolved scalar, a resolved blob
//! or a no-op by the time it gets here (the object writer additionally
//! accepts unresolved words of a relocatable pattern).

use std::fmt::Write as FmtWrite;

use ast::{Statement, StatementKind};
use error::{self, fatal, ErrorKind};

pub mod object;

/// Flat memory image sized to the highest address used.
pub(crate) struct Image {
    words: Vec<u16>,
}

impl Image {
    pub fn new() -> Image {
        Image { words: Vec::new() }
    }

    pub fn put(&mut self, addr: i64, word: u16) {
        let addr = addr as usize;
        if addr >= self.words.len() {
            self.words.resize(addr + 1, 0);
        }
        self.words[addr] = word;
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    /// Serializes 16-bit words big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 2);
        for w in &self.words {
            bytes.push((w >> 8) as u8);
            bytes.push(*w as u8);
        }
        bytes
    }
}

pub(crate) fn addr_of(stmt: &Statement) -> error::Result<i64> {
    match stmt.addr {
        Some(addr) => Ok(addr),
        None => Err(ErrorKind::InternalError("statement without an address".into()).into()),
    }
}

/// Renders `value` into `pattern`, replacing each `.` with the next binary
/// digit, most significant first. Other characters pass through.
pub(crate) fn bin_format(pattern: &str, value: u16) -> String {
    let mut bit: i32 = 15;
    let mut out = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        if ch == '.' {
            if bit >= 0 {
                out.push(if (value >> bit) & 1 == 1 { '1' } else { '0' });
                bit -= 1;
            } else {
                out.push('?');
            }
        } else {
            out.push(ch);
        }
    }
    out
}

// Instruction field grouping of the debug format.
const DEBUG_BIN: &'static str = "... ... . ... ... ...";

pub fn write_raw(program: &[Statement]) -> error::Result<Vec<u8>> {
    debug!("==== RAW writer ====");
    let mut image = Image::new();
    for stmt in program {
        match stmt.kind {
            StatementKind::Data(v) => {
                let addr = addr_of(stmt)?;
                image.put(addr, v.val as u16);
            }
            StatementKind::Blob(ref words) => {
                let addr = addr_of(stmt)?;
                for (i, w) in words.iter().enumerate() {
                    image.put(addr + i as i64, *w);
                }
            }
            StatementKind::None => {}
            _ => return fatal(&stmt.loc, "Relocation not possible for raw output".into()),
        }
    }
    Ok(image.to_bytes())
}

pub fn write_debug(program: &[Statement]) -> error::Result<String> {
    debug!("==== DEBUG writer ====");
    let mut out = String::new();
    for stmt in program {
        let addr = addr_of(stmt)?;
        match stmt.kind {
            StatementKind::Data(v) => {
                writeln!(
                    out,
                    "@ 0x{:04x} : 0x{:04x}  /  {}  /  {}",
                    addr,
                    v.val as u16,
                    bin_format(DEBUG_BIN, v.val as u16),
                    v.val
                )?;
            }
            StatementKind::Blob(ref words) => {
                for (i, w) in words.iter().enumerate() {
                    writeln!(
                        out,
                        "@ 0x{:04x} : 0x{:04x}  /  {}  /  {}",
                        addr + i as i64,
                        w,
                        bin_format(DEBUG_BIN, *w),
                        w
                    )?;
                }
            }
            StatementKind::None => {
                writeln!(out, "@ 0x{:04x} : (none)", addr)?;
            }
            _ => {
                writeln!(out, "@ 0x{:04x} : unresolved", addr)?;
            }
        }
    }
    Ok(out)
}

/// The front-panel view: octal value, binary digits and the positions of
/// the set key switches, most significant bit as key 0.
fn keys_line(out: &mut String, addr: i64, data: u16) -> ::std::fmt::Result {
    write!(
        out,
        "{:4}: {:06o}   {}   ",
        addr,
        data,
        bin_format(".... .... .... ....", data)
    )?;
    let mut first = true;
    for i in 0..16 {
        if data & (1 << (15 - i)) != 0 {
            if first {
                write!(out, "{}", i)?;
                first = false;
            } else {
                write!(out, ", {}", i)?;
            }
        }
    }
    writeln!(out)
}

pub fn write_keys(program: &[Statement]) -> error::Result<String> {
    debug!("==== KEYS writer ====");
    let mut out = String::new();
    writeln!(out, "addr: oct      bin                   keys")?;
    writeln!(
        out,
        "-------------------------------------------------------------------"
    )?;
    for stmt in program {
        match stmt.kind {
            StatementKind::Data(v) => {
                keys_line(&mut out, addr_of(stmt)?, v.val as u16)?;
            }
            StatementKind::Blob(ref words) => {
                let addr = addr_of(stmt)?;
                for (i, w) in words.iter().enumerate() {
                    keys_line(&mut out, addr + i as i64, *w)?;
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ast::{Statement, StatementKind, Value};
    use src_loc::SrcLoc;

    fn resolved(addr: i64, val: i64) -> Statement {
        let mut stmt = Statement::new(SrcLoc::none(), StatementKind::Data(Value::absolute(val)));
        stmt.addr = Some(addr);
        stmt.size = 1;
        stmt
    }

    #[test]
    fn test_bin_format() {
        assert_eq!(
            "000 000 0 000 100 101",
            bin_format("... ... . ... ... ...", 0x25)
        );
        assert_eq!("0000 0000 0010 0101", bin_format(".... .... .... ....", 0x25));
    }

    #[test]
    fn test_raw_big_endian() {
        let program = vec![resolved(0, 0x1234), resolved(1, 0x5678)];
        let bytes = write_raw(&program).unwrap();
        assert_eq!(vec![0x12, 0x34, 0x56, 0x78], bytes);
    }

    #[test]
    fn test_raw_gap_filled_with_zeros() {
        let program = vec![resolved(0, 0xffff), resolved(2, 0x0001)];
        let bytes = write_raw(&program).unwrap();
        assert_eq!(vec![0xff, 0xff, 0x00, 0x00, 0x00, 0x01], bytes);
    }

    #[test]
    fn test_raw_rejects_unresolved() {
        use ast::Expr;
        let mut stmt = Statement::word(SrcLoc::none(), Expr::name(SrcLoc::none(), "ext"));
        stmt.addr = Some(0);
        let err = write_raw(&[stmt]).unwrap_err();
        assert!(format!("{}", err).contains("Relocation not possible"));
    }

    #[test]
    fn test_debug_line() {
        let text = write_debug(&[resolved(2, 0x25)]).unwrap();
        assert_eq!(
            "@ 0x0002 : 0x0025  /  000 000 0 000 100 101  /  37\n",
            text
        );
    }

    #[test]
    fn test_keys_lines() {
        let text = write_keys(&[resolved(1, 0x8001)]).unwrap();
        let line = text.lines().nth(2).unwrap();
        assert_eq!("   1: 100001   1000 0000 0000 0001   0, 15", line);
    }
}
