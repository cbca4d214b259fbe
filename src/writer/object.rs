//! Relocatable object writer (KRO format).
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic    4 bytes  "KRO\x01"
//! cpu      u16      cpu tag (1 = kr16, 2 = kr16x)
//! flags    u16      bit 0: entry point present
//! entry    u16      entry address (0 when absent)
//! isize    u32      image length in words
//! image    isize big-endian words
//! scount   u16      symbol record count
//!          records: nlen u8, name bytes, flags u16, value u16
//! rcount   u16      relocation record count
//!          records: addr u16, kind u8, sign u8, symbol index u16
//! ```

use ast::{BinOp, Expr, ExprKind, Statement, StatementKind, UnOp};
use error::{self, fatal, ErrorKind};
use eval::Evaluator;
use src_loc::SrcLoc;

use super::{addr_of, Image};

pub const MAGIC: &'static [u8; 4] = b"KRO\x01";

pub const FLAG_ENTRY: u16 = 1;

pub const SYM_UNDEFINED: u16 = 1;
pub const SYM_RELATIVE: u16 = 1 << 1;
pub const SYM_CONST: u16 = 1 << 2;
pub const SYM_GLOBAL: u16 = 1 << 3;
pub const SYM_ENTRY: u16 = 1 << 4;

/// Add the load base to the word.
pub const RELOC_BASE: u8 = 1;
/// Add (or subtract) the symbol's value.
pub const RELOC_SYM: u8 = 2;
/// Add the symbol's value and the load base.
pub const RELOC_SYM_BASE: u8 = 3;

#[derive(Debug, new)]
struct SymRecord {
    name: String,
    flags: u16,
    value: u16,
}

#[derive(Debug, new)]
struct RelocRecord {
    addr: u16,
    kind: u8,
    /// 0 = add, 1 = subtract.
    sign: u8,
    sym: u16,
}

/// An unresolved word reduced to something the loader can fix up:
/// `sign * symbol + addend`, with `base` set when the addend itself
/// needs the load base added.
struct Fixup<'a> {
    name: &'a str,
    sign: u8,
    addend: i64,
    base: bool,
}

/// Matches the small family of expressions the loader can relocate. Each
/// folding pass has already collapsed every resolvable subtree, so by the
/// time we get here any relocatable leftover is a name, a negated name, or
/// a name combined with a folded value.
fn fixup_pattern(expr: &Expr) -> Option<Fixup> {
    match expr.kind {
        ExprKind::Name(ref name) => Some(Fixup {
            name: name,
            sign: 0,
            addend: 0,
            base: false,
        }),
        ExprKind::Unary(UnOp::Neg, ref arg) => match arg.kind {
            ExprKind::Name(ref name) => Some(Fixup {
                name: name,
                sign: 1,
                addend: 0,
                base: false,
            }),
            _ => None,
        },
        ExprKind::Binary(op, ref lhs, ref rhs) if op == BinOp::Add || op == BinOp::Sub => {
            match (&lhs.kind, &rhs.kind) {
                (&ExprKind::Name(ref name), &ExprKind::Value(v)) => Some(Fixup {
                    name: name,
                    sign: 0,
                    addend: if op == BinOp::Add { v.val } else { -v.val },
                    base: v.relative,
                }),
                (&ExprKind::Value(v), &ExprKind::Name(ref name)) => Some(Fixup {
                    name: name,
                    sign: if op == BinOp::Add { 0 } else { 1 },
                    addend: v.val,
                    base: v.relative,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

fn intern(symbols: &mut Vec<SymRecord>, name: &str, flags: u16, value: u16) -> u16 {
    if let Some(i) = symbols.iter().position(|s| s.name == name) {
        symbols[i].flags |= flags;
        return i as u16;
    }
    symbols.push(SymRecord::new(name.into(), flags, value));
    (symbols.len() - 1) as u16
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.push((v >> 8) as u8);
    out.push(v as u8);
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.push((v >> 24) as u8);
    out.push((v >> 16) as u8);
    out.push((v >> 8) as u8);
    out.push(v as u8);
}

pub fn write_object(program: &[Statement], ev: &mut Evaluator) -> error::Result<Vec<u8>> {
    debug!("==== OBJECT writer ====");

    let mut image = Image::new();
    let mut symbols: Vec<SymRecord> = Vec::new();
    let mut relocs: Vec<RelocRecord> = Vec::new();

    for stmt in program {
        match stmt.kind {
            StatementKind::Data(v) => {
                let addr = addr_of(stmt)?;
                image.put(addr, v.val as u16);
                if v.relative {
                    relocs.push(RelocRecord::new(addr as u16, RELOC_BASE, 0, 0));
                }
            }
            StatementKind::Blob(ref words) => {
                let addr = addr_of(stmt)?;
                for (i, w) in words.iter().enumerate() {
                    image.put(addr + i as i64, *w);
                }
            }
            StatementKind::None => {}
            StatementKind::Word(ref expr) => {
                let addr = addr_of(stmt)?;
                let fixup = match fixup_pattern(expr) {
                    Some(fixup) => fixup,
                    None => {
                        return fatal(
                            &stmt.loc,
                            format!("Cannot relocate expression: '{:?}'", expr.kind),
                        )
                    }
                };
                image.put(addr, fixup.addend as u16);
                let sym = intern(&mut symbols, fixup.name, SYM_UNDEFINED, 0);
                let kind = if fixup.base { RELOC_SYM_BASE } else { RELOC_SYM };
                relocs.push(RelocRecord::new(addr as u16, kind, fixup.sign, sym));
            }
            _ => {
                return fatal(
                    &stmt.loc,
                    format!("Cannot relocate statement: {}", stmt.kind.name()),
                )
            }
        }
    }

    // Exported symbols. Deferred values may still be unfolded if nothing in
    // the program referenced them, so run the folder here.
    let globals: Vec<String> = ev
        .syms
        .iter()
        .filter(|e| e.flags.global)
        .map(|e| e.name.clone())
        .collect();
    for name in globals {
        let (undefined, constant) = {
            let entry = ev.syms.lookup(&name).ok_or_else(|| {
                error::Error::from(ErrorKind::InternalError(format!(
                    "global '{}' vanished from the symbol table",
                    name
                )))
            })?;
            (entry.flags.undefined, entry.flags.constant)
        };
        if undefined {
            intern(&mut symbols, &name, SYM_UNDEFINED | SYM_GLOBAL, 0);
            continue;
        }
        let mut expr = Expr::name(SrcLoc::none(), &name);
        if !ev.eval_expr(&mut expr)?.is_resolved() {
            return fatal(
                &expr.loc,
                format!("Cannot export unresolved global: '{}'", name),
            );
        }
        let v = expr
            .value()
            .ok_or_else(|| ErrorKind::InternalError("resolved global has no value".into()))?;
        let mut flags = SYM_GLOBAL;
        if constant {
            flags |= SYM_CONST;
        }
        if v.relative {
            flags |= SYM_RELATIVE;
        }
        intern(&mut symbols, &name, flags, v.val as u16);
    }

    // Entry point. When it is a plain exported name, flag that symbol too.
    let entry_name = match ev.entry {
        Some(ref expr) => match expr.kind {
            ExprKind::Name(ref name) => Some(name.clone()),
            _ => None,
        },
        None => None,
    };
    let entry = match ev.entry.take() {
        Some(mut expr) => {
            if !ev.eval_expr(&mut expr)?.is_resolved() {
                return fatal(&expr.loc, "Cannot resolve program entry point".into());
            }
            let v = expr
                .value()
                .ok_or_else(|| ErrorKind::InternalError("resolved entry has no value".into()))?;
            Some(v.val as u16)
        }
        None => None,
    };
    if entry.is_some() {
        if let Some(ref name) = entry_name {
            if let Some(i) = symbols.iter().position(|s| &s.name == name) {
                symbols[i].flags |= SYM_ENTRY;
            }
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    push_u16(&mut out, ev.cpu.kind().map(|c| c.tag()).unwrap_or(1));
    push_u16(&mut out, if entry.is_some() { FLAG_ENTRY } else { 0 });
    push_u16(&mut out, entry.unwrap_or(0));
    push_u32(&mut out, image.words().len() as u32);
    for w in image.words() {
        push_u16(&mut out, *w);
    }
    push_u16(&mut out, symbols.len() as u16);
    for sym in &symbols {
        out.push(sym.name.len() as u8);
        out.extend_from_slice(sym.name.as_bytes());
        push_u16(&mut out, sym.flags);
        push_u16(&mut out, sym.value);
    }
    push_u16(&mut out, relocs.len() as u16);
    for reloc in &relocs {
        push_u16(&mut out, reloc.addr);
        out.push(reloc.kind);
        out.push(reloc.sign);
        push_u16(&mut out, reloc.sym);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ast::{BinOp, Expr, Statement, StatementKind, Value};
    use eval::Evaluator;
    use src_loc::SrcLoc;

    fn final_stmt(addr: i64, kind: StatementKind) -> Statement {
        let mut stmt = Statement::new(SrcLoc::none(), kind);
        stmt.addr = Some(addr);
        stmt
    }

    #[test]
    fn test_fixup_patterns() {
        let loc = SrcLoc::none;
        let e = Expr::name(loc(), "ext");
        let f = fixup_pattern(&e).unwrap();
        assert_eq!(("ext", 0, 0, false), (f.name, f.sign, f.addend, f.base));

        let e = Expr::binary(loc(), BinOp::Add, Expr::name(loc(), "ext"), Expr::int(loc(), 4));
        let f = fixup_pattern(&e).unwrap();
        assert_eq!(("ext", 0, 4, false), (f.name, f.sign, f.addend, f.base));

        let e = Expr::binary(loc(), BinOp::Sub, Expr::int(loc(), 10), Expr::name(loc(), "ext"));
        let f = fixup_pattern(&e).unwrap();
        assert_eq!(("ext", 1, 10, false), (f.name, f.sign, f.addend, f.base));

        let e = Expr::binary(
            loc(),
            BinOp::Mul,
            Expr::name(loc(), "ext"),
            Expr::int(loc(), 2),
        );
        assert!(fixup_pattern(&e).is_none());
    }

    #[test]
    fn test_base_relocation_for_relative_word() {
        let program = vec![final_stmt(0, StatementKind::Data(Value::relative(5)))];
        let mut ev = Evaluator::new();
        let bytes = write_object(&program, &mut ev).unwrap();
        // isize 1, word 0x0005, no symbols, one reloc (addr 0, base, +, 0).
        let tail = &bytes[10..];
        assert_eq!(
            &[0, 0, 0, 1, 0, 5, 0, 0, 0, 1, 0, 0, RELOC_BASE, 0, 0, 0],
            tail
        );
    }

    #[test]
    fn test_external_reference_becomes_symbol_reloc() {
        let loc = SrcLoc::none;
        let expr = Expr::binary(loc(), BinOp::Add, Expr::name(loc(), "ext"), Expr::int(loc(), 4));
        let program = vec![final_stmt(0, StatementKind::Word(expr))];
        let mut ev = Evaluator::new();
        let bytes = write_object(&program, &mut ev).unwrap();
        // The image word holds the addend.
        assert_eq!(&[0, 0, 0, 1, 0, 4], &bytes[10..16]);
        // One undefined symbol named "ext".
        assert_eq!(&[0, 1, 3], &bytes[16..19]);
        assert_eq!(b"ext", &bytes[19..22]);
        assert_eq!(&[0, SYM_UNDEFINED as u8, 0, 0], &bytes[22..26]);
        // One symbol relocation at address 0.
        assert_eq!(&[0, 1, 0, 0, RELOC_SYM, 0, 0, 0], &bytes[26..34]);
    }

    #[test]
    fn test_unrelocatable_statement_is_fatal() {
        let loc = SrcLoc::none;
        let expr = Expr::binary(
            loc(),
            BinOp::Mul,
            Expr::name(loc(), "ext"),
            Expr::int(loc(), 2),
        );
        let program = vec![final_stmt(0, StatementKind::Word(expr))];
        let mut ev = Evaluator::new();
        let err = write_object(&program, &mut ev).unwrap_err();
        assert!(format!("{}", err).contains("Cannot relocate"));
    }
}
