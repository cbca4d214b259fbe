//
// Copyright 2026 kr16_asm Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//

//! Syntax-tree nodes handed over by the front end.
//!
//! Nodes are two-state: unevaluated kinds carry subtrees, and the evaluator
//! folds them in place into `Value`/`Data`/`Blob`/`None`. Ownership is
//! strictly tree-shaped; binding a subtree to a symbol moves it into the
//! symbol table.

use src_loc::SrcLoc;

/// A folded scalar. `relative` marks values that depend on the program's
/// load address (label addresses, the location counter).
#[derive(Debug, Clone, Copy, Eq, PartialEq, new)]
pub struct Value {
    pub val: i64,
    pub relative: bool,
}

impl Value {
    pub fn absolute(val: i64) -> Value {
        Value {
            val: val,
            relative: false,
        }
    }

    pub fn relative(val: i64) -> Value {
        Value {
            val: val,
            relative: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    /// The `\` operator: `lhs << (15 - rhs)`, bit numbering with MSB = 0.
    Scale,
}

impl BinOp {
    pub fn name(&self) -> &'static str {
        match *self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Scale => "\\",
        }
    }
}

#[derive(Debug)]
pub enum ExprKind {
    /// Folded result; terminal state.
    Value(Value),
    Name(String),
    /// `.` — the current location counter.
    CurLoc,
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SrcLoc,
}

impl Expr {
    pub fn int(loc: SrcLoc, val: i64) -> Expr {
        Expr {
            kind: ExprKind::Value(Value::absolute(val)),
            loc: loc,
        }
    }

    pub fn name(loc: SrcLoc, name: &str) -> Expr {
        Expr {
            kind: ExprKind::Name(name.into()),
            loc: loc,
        }
    }

    pub fn curloc(loc: SrcLoc) -> Expr {
        Expr {
            kind: ExprKind::CurLoc,
            loc: loc,
        }
    }

    pub fn unary(loc: SrcLoc, op: UnOp, arg: Expr) -> Expr {
        Expr {
            kind: ExprKind::Unary(op, Box::new(arg)),
            loc: loc,
        }
    }

    pub fn binary(loc: SrcLoc, op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            loc: loc,
        }
    }

    /// The folded scalar, if this expression has reached its terminal state.
    pub fn value(&self) -> Option<Value> {
        match self.kind {
            ExprKind::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Instruction shapes. Arguments of short forms are merged into the low
/// bits of the instruction word; full-word arguments are emitted by the
/// front end as a separate `Word` statement following the opcode.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpShape {
    /// The word is already complete (no-argument and register forms).
    NoArg,
    /// Complete word, but the instruction exists only on the extended CPU.
    Extended,
    Short(ShortShape),
}

/// Short-argument instruction classes, each with its own field range and
/// encoding quirks.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShortShape {
    /// 4-bit shift count, -15..15.
    Shc,
    /// Signed 7-bit displacement, always IC-relative.
    T,
    /// Signed 7-bit displacement; IC-relative for some opcodes only.
    Rt,
    /// 7-bit halt code with a bit shuffle.
    Hlt,
    /// Right-byte control field, 0..255.
    Brc,
    /// Left-byte control field; low byte must be zero.
    Blc,
    /// 8-bit extracode number.
    Exl,
    /// 8-bit fault number.
    Nrf,
}

impl ShortShape {
    pub fn name(&self) -> &'static str {
        match *self {
            ShortShape::Shc => "SHC",
            ShortShape::T => "OP (T)",
            ShortShape::Rt => "OP (R,T)",
            ShortShape::Hlt => "HLT",
            ShortShape::Brc => "BRC",
            ShortShape::Blc => "BLC",
            ShortShape::Exl => "EXL",
            ShortShape::Nrf => "NRF",
        }
    }
}

#[derive(Debug, new)]
pub struct Op {
    /// Base instruction word with register fields already merged in.
    pub word: u16,
    pub shape: OpShape,
    pub arg: Option<Expr>,
}

/// One field of a `.struct` layout. `offset` is filled in by the evaluator
/// once the previous field's size and offset are both known.
#[derive(Debug)]
pub struct StructField {
    pub name: String,
    pub size: Expr,
    pub offset: Option<i64>,
    pub loc: SrcLoc,
}

impl StructField {
    pub fn new(loc: SrcLoc, name: &str, size: Expr) -> StructField {
        StructField {
            name: name.into(),
            size: size,
            offset: None,
            loc: loc,
        }
    }
}

#[derive(Debug)]
pub enum StatementKind {
    // Terminal states; the only kinds legal at serialization time
    // (plus `Word` holding a relocatable pattern, for object output).
    /// One resolved storage word.
    Data(Value),
    /// N resolved storage words, already packed.
    Blob(Vec<u16>),
    /// Contributes nothing to the image.
    None,

    // Unevaluated statements, as produced by the front end.
    Word(Expr),
    DWord(Expr),
    Float(f64),
    /// Reserve N words, optionally filled with a value.
    Res(Expr, Option<Expr>),
    Org(Expr),
    Ascii(String),
    Asciiz(String),
    Label(String),
    Equ(String, Expr),
    Const(String, Expr),
    Entry(Expr),
    Global(String),
    Cpu(String),
    /// Branches for the symbol-defined and symbol-undefined cases.
    IfDef(String, Vec<Statement>, Vec<Statement>),
    StructDef(String, Vec<StructField>),
    Op(Op),
}

impl StatementKind {
    pub fn name(&self) -> &'static str {
        match *self {
            StatementKind::Data(_) => "INT",
            StatementKind::Blob(_) => "BLOB",
            StatementKind::None => "NONE",
            StatementKind::Word(_) => ".word",
            StatementKind::DWord(_) => ".dword",
            StatementKind::Float(_) => ".float",
            StatementKind::Res(_, _) => ".res",
            StatementKind::Org(_) => ".org",
            StatementKind::Ascii(_) => ".ascii",
            StatementKind::Asciiz(_) => ".asciiz",
            StatementKind::Label(_) => "LABEL",
            StatementKind::Equ(_, _) => ".equ",
            StatementKind::Const(_, _) => ".const",
            StatementKind::Entry(_) => ".entry",
            StatementKind::Global(_) => ".global",
            StatementKind::Cpu(_) => ".cpu",
            StatementKind::IfDef(_, _, _) => ".ifdef",
            StatementKind::StructDef(_, _) => ".struct",
            StatementKind::Op(_) => "OP",
        }
    }
}

/// A top-level statement. `addr` is assigned on the first pass and sticky
/// across later passes; `size` is in 16-bit storage words.
#[derive(Debug)]
pub struct Statement {
    pub kind: StatementKind,
    pub loc: SrcLoc,
    pub addr: Option<i64>,
    pub size: i64,
}

impl Statement {
    pub fn new(loc: SrcLoc, kind: StatementKind) -> Statement {
        Statement {
            kind: kind,
            loc: loc,
            addr: None,
            size: 0,
        }
    }

    pub fn word(loc: SrcLoc, expr: Expr) -> Statement {
        Statement::new(loc, StatementKind::Word(expr))
    }

    pub fn dword(loc: SrcLoc, expr: Expr) -> Statement {
        Statement::new(loc, StatementKind::DWord(expr))
    }

    pub fn float(loc: SrcLoc, value: f64) -> Statement {
        Statement::new(loc, StatementKind::Float(value))
    }

    pub fn res(loc: SrcLoc, count: Expr, fill: Option<Expr>) -> Statement {
        Statement::new(loc, StatementKind::Res(count, fill))
    }

    pub fn org(loc: SrcLoc, addr: Expr) -> Statement {
        Statement::new(loc, StatementKind::Org(addr))
    }

    pub fn ascii(loc: SrcLoc, text: &str) -> Statement {
        Statement::new(loc, StatementKind::Ascii(text.into()))
    }

    pub fn asciiz(loc: SrcLoc, text: &str) -> Statement {
        Statement::new(loc, StatementKind::Asciiz(text.into()))
    }

    pub fn label(loc: SrcLoc, name: &str) -> Statement {
        Statement::new(loc, StatementKind::Label(name.into()))
    }

    pub fn equ(loc: SrcLoc, name: &str, expr: Expr) -> Statement {
        Statement::new(loc, StatementKind::Equ(name.into(), expr))
    }

    pub fn constant(loc: SrcLoc, name: &str, expr: Expr) -> Statement {
        Statement::new(loc, StatementKind::Const(name.into(), expr))
    }

    pub fn entry(loc: SrcLoc, expr: Expr) -> Statement {
        Statement::new(loc, StatementKind::Entry(expr))
    }

    pub fn global(loc: SrcLoc, name: &str) -> Statement {
        Statement::new(loc, StatementKind::Global(name.into()))
    }

    pub fn cpu(loc: SrcLoc, name: &str) -> Statement {
        Statement::new(loc, StatementKind::Cpu(name.into()))
    }

    pub fn ifdef(
        loc: SrcLoc,
        name: &str,
        defined: Vec<Statement>,
        undefined: Vec<Statement>,
    ) -> Statement {
        Statement::new(loc, StatementKind::IfDef(name.into(), defined, undefined))
    }

    pub fn struct_def(loc: SrcLoc, name: &str, fields: Vec<StructField>) -> Statement {
        Statement::new(loc, StatementKind::StructDef(name.into(), fields))
    }

    pub fn op(loc: SrcLoc, word: u16, shape: OpShape, arg: Option<Expr>) -> Statement {
        Statement::new(loc, StatementKind::Op(Op::new(word, shape, arg)))
    }

    /// True once evaluation has collapsed this statement into a state the
    /// raw/debug/keys writers accept.
    pub fn is_final(&self) -> bool {
        match self.kind {
            StatementKind::Data(_) | StatementKind::Blob(_) | StatementKind::None => true,
            _ => false,
        }
    }
}
