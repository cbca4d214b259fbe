//
// Copyright 2026 kr16_asm Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//

//! Expression folding, statement evaluation and the two-pass driver.
//!
//! Evaluation rewrites nodes in place: a folded subtree collapses into a
//! `Value`, a folded statement into `Data`/`Blob`/`None`. A fatal error
//! aborts the whole assembly; an unresolved forward reference is not an
//! error but a count the pass driver sums up to decide whether another
//! pass can make progress.

use std::mem;

use ast::{BinOp, Expr, ExprKind, OpShape, ShortShape, Statement, StatementKind, UnOp, Value};
use error::{self, fatal, ErrorKind};
use float;
use src_loc::SrcLoc;
use symtab::{SymFlags, SymbolTable};

/// Non-fatal evaluation result. `Unresolved(n)` counts the undefined
/// symbol references transitively beneath the node.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    Resolved,
    Unresolved(u32),
}

impl Outcome {
    pub fn count(&self) -> u32 {
        match *self {
            Outcome::Resolved => 0,
            Outcome::Unresolved(n) => n,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.count() == 0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CpuType {
    /// Base CPU: 32 Ki words of addressable memory.
    Kr16,
    /// Extended CPU: 64 Ki words and the extended instruction set.
    Kr16x,
}

impl CpuType {
    pub fn from_name(name: &str) -> Option<CpuType> {
        if name.eq_ignore_ascii_case("kr16") {
            Some(CpuType::Kr16)
        } else if name.eq_ignore_ascii_case("kr16x") {
            Some(CpuType::Kr16x)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match *self {
            CpuType::Kr16 => "kr16",
            CpuType::Kr16x => "kr16x",
        }
    }

    pub fn ic_max(&self) -> i64 {
        match *self {
            CpuType::Kr16 => 0x7fff,
            CpuType::Kr16x => 0xffff,
        }
    }

    /// CPU-variant tag used by the object format.
    pub fn tag(&self) -> u16 {
        match *self {
            CpuType::Kr16 => 1,
            CpuType::Kr16x => 2,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum CpuError {
    Unknown,
    AlreadySet,
}

/// CPU-variant selection. A forced (command-line) choice silently wins
/// over `.cpu` directives; a second `.cpu` directive is an error.
#[derive(Debug)]
pub struct CpuState {
    kind: Option<CpuType>,
    forced: bool,
}

impl CpuState {
    pub fn new() -> CpuState {
        CpuState {
            kind: None,
            forced: false,
        }
    }

    pub fn set(&mut self, name: &str, force: bool) -> ::std::result::Result<(), CpuError> {
        if self.forced {
            return Ok(());
        }
        if self.kind.is_some() {
            return Err(CpuError::AlreadySet);
        }
        match CpuType::from_name(name) {
            Some(kind) => {
                self.kind = Some(kind);
                self.forced = force;
                Ok(())
            }
            None => Err(CpuError::Unknown),
        }
    }

    pub fn kind(&self) -> Option<CpuType> {
        self.kind
    }

    pub fn is_extended(&self) -> bool {
        self.kind == Some(CpuType::Kr16x)
    }

    pub fn ic_max(&self) -> i64 {
        self.kind.map_or(CpuType::Kr16.ic_max(), |k| k.ic_max())
    }
}

/// All the mutable state one assembly run threads through evaluation:
/// the symbol table, the location counter, the CPU variant, the program
/// entry point and the retained best-effort diagnostic.
#[derive(Debug)]
pub struct Evaluator {
    pub syms: SymbolTable,
    pub ic: i64,
    pub cpu: CpuState,
    pub entry: Option<Expr>,
    diag: Option<(SrcLoc, String)>,
}

/// Internal result of a name lookup during folding.
enum Folded {
    Value(Value),
    Unresolved(u32),
}

fn value_of(expr: &Expr) -> error::Result<Value> {
    match expr.value() {
        Some(v) => Ok(v),
        None => Err(ErrorKind::InternalError("expression not folded".into()).into()),
    }
}

impl Evaluator {
    pub fn new() -> Evaluator {
        Evaluator {
            syms: SymbolTable::new(16000, true),
            ic: 0,
            cpu: CpuState::new(),
            entry: None,
            diag: None,
        }
    }

    /// Predefines a constant (command-line `-D` equivalent). An existing
    /// entry just gets its value updated.
    pub fn define_const(&mut self, name: &str, val: i64) {
        let value = Some(Expr::int(SrcLoc::none(), val));
        if self.syms.lookup(name).is_some() {
            if let Some(entry) = self.syms.lookup_mut(name) {
                entry.value = value;
                entry.flags.undefined = false;
            }
        } else {
            let _ = self.syms.insert(name, SymFlags::constant(), value);
        }
    }

    fn ic_max(&self) -> i64 {
        self.cpu.ic_max()
    }

    /// Retains the best-effort diagnostic for an unresolved reference; the
    /// strict pass turns it into the fatal error.
    fn note_unresolved(&mut self, loc: &SrcLoc, msg: String) {
        trace!("unresolved: {}: {}", loc, msg);
        self.diag = Some((loc.clone(), msg));
    }

    fn take_diag(&mut self, fallback: &SrcLoc) -> error::Error {
        match self.diag.take() {
            Some((loc, msg)) => ErrorKind::AssemblerError(loc, msg).into(),
            None => {
                ErrorKind::AssemblerError(fallback.clone(), "Unresolved statement".into()).into()
            }
        }
    }

    // ---- expression folding ----------------------------------------

    pub fn eval_expr(&mut self, expr: &mut Expr) -> error::Result<Outcome> {
        let folded: Value = match expr.kind {
            ExprKind::Value(_) => return Ok(Outcome::Resolved),
            ExprKind::CurLoc => Value::relative(self.ic),
            ExprKind::Name(ref name) => {
                let name = name.clone();
                match self.eval_name(&expr.loc, &name)? {
                    Folded::Value(v) => v,
                    Folded::Unresolved(n) => return Ok(Outcome::Unresolved(n)),
                }
            }
            ExprKind::Unary(op, ref mut arg) => {
                match self.eval_expr(arg)? {
                    Outcome::Unresolved(n) => return Ok(Outcome::Unresolved(n)),
                    Outcome::Resolved => {}
                }
                let v = value_of(arg)?;
                match op {
                    UnOp::Neg => Value::new(-v.val, v.relative),
                    UnOp::Not => Value::new(!v.val, v.relative),
                }
            }
            ExprKind::Binary(op, ref mut lhs, ref mut rhs) => {
                let u1 = self.eval_expr(lhs)?;
                let u2 = self.eval_expr(rhs)?;
                let pending = u1.count() + u2.count();
                if pending > 0 {
                    return Ok(Outcome::Unresolved(pending));
                }
                let a = value_of(lhs)?;
                let b = value_of(rhs)?;
                combine(&expr.loc, op, a, b)?
            }
        };
        expr.kind = ExprKind::Value(folded);
        Ok(Outcome::Resolved)
    }

    /// Looks a symbol up and lazily folds its deferred subtree. A missing
    /// or still-undefined symbol is unresolved, not fatal; re-entering an
    /// entry that is currently being folded is the fatal recursive
    /// definition error.
    fn eval_name(&mut self, loc: &SrcLoc, name: &str) -> error::Result<Folded> {
        let mut subtree = {
            let entry = match self.syms.lookup_mut(name) {
                Some(entry) => entry,
                None => {
                    let msg = format!("Symbol '{}' not defined", name);
                    self.note_unresolved(loc, msg);
                    return Ok(Folded::Unresolved(1));
                }
            };
            if entry.flags.undefined {
                let msg = format!("Symbol '{}' not defined", name);
                self.note_unresolved(loc, msg);
                return Ok(Folded::Unresolved(1));
            }
            if entry.busy {
                return fatal(loc, format!("Symbol '{}' is defined recursively", name));
            }
            match entry.value.take() {
                Some(subtree) => {
                    entry.busy = true;
                    subtree
                }
                None => {
                    return Err(
                        ErrorKind::InternalError(format!("symbol '{}' has no value", name)).into(),
                    )
                }
            }
        };

        let result = self.eval_expr(&mut subtree);

        // Hand the subtree back before propagating anything.
        if let Some(entry) = self.syms.lookup_mut(name) {
            entry.value = Some(subtree);
            entry.busy = false;
        }

        match result? {
            Outcome::Unresolved(n) => Ok(Folded::Unresolved(n)),
            Outcome::Resolved => {
                let v = match self.syms.lookup(name).and_then(|e| e.value.as_ref()) {
                    Some(expr) => value_of(expr)?,
                    None => {
                        return Err(ErrorKind::InternalError(
                            format!("symbol '{}' lost its value", name),
                        ).into())
                    }
                };
                Ok(Folded::Value(v))
            }
        }
    }

    // ---- statement evaluation --------------------------------------

    pub fn eval_statement(&mut self, stmt: &mut Statement) -> error::Result<Outcome> {
        // Bindings hand their subtree over to the symbol table, so they
        // take ownership of the statement kind up front.
        match stmt.kind {
            StatementKind::Equ(_, _) | StatementKind::Const(_, _) | StatementKind::Entry(_) => {
                let kind = mem::replace(&mut stmt.kind, StatementKind::None);
                let loc = stmt.loc.clone();
                return self.eval_binding(&loc, kind);
            }
            _ => {}
        }

        let folded: StatementKind = match stmt.kind {
            StatementKind::Data(_) | StatementKind::Blob(_) | StatementKind::None => {
                return Ok(Outcome::Resolved)
            }

            StatementKind::Word(ref mut expr) => {
                stmt.size = 1;
                match self.eval_expr(expr)? {
                    Outcome::Unresolved(n) => return Ok(Outcome::Unresolved(n)),
                    Outcome::Resolved => {}
                }
                let v = value_of(expr)?;
                if v.val < -32768 || v.val > 65535 {
                    return fatal(
                        &stmt.loc,
                        format!("Value {} is not a 16-bit signed/unsigned integer", v.val),
                    );
                }
                StatementKind::Data(v)
            }

            StatementKind::DWord(ref mut expr) => {
                stmt.size = 2;
                match self.eval_expr(expr)? {
                    Outcome::Unresolved(n) => return Ok(Outcome::Unresolved(n)),
                    Outcome::Resolved => {}
                }
                let v = value_of(expr)?;
                StatementKind::Blob(vec![(v.val >> 16) as u16, v.val as u16])
            }

            StatementKind::Float(value) => {
                stmt.size = 3;
                match float::encode(value) {
                    Ok(words) => StatementKind::Blob(words.to_vec()),
                    Err(float::FloatError::Overflow) => {
                        return fatal(&stmt.loc, "Floating point overflow".into())
                    }
                    Err(float::FloatError::Underflow) => {
                        return fatal(&stmt.loc, "Floating point underflow".into())
                    }
                }
            }

            StatementKind::Res(ref mut count, ref mut fill) => {
                // The reserved size decides every following address; it has
                // to fold the first time the node is visited.
                match self.eval_expr(count)? {
                    Outcome::Unresolved(_) => {
                        let err = self.take_diag(&stmt.loc);
                        return Err(err);
                    }
                    Outcome::Resolved => {}
                }
                let c = value_of(count)?;
                if c.val < 0 || c.val > 65536 {
                    return fatal(
                        &stmt.loc,
                        format!(
                            "Cannot reserve memory outside the process address space \
                             (requested {} words)",
                            c.val
                        ),
                    );
                }
                stmt.size = c.val;
                let fill_val = match *fill {
                    Some(ref mut f) => {
                        match self.eval_expr(f)? {
                            Outcome::Unresolved(n) => return Ok(Outcome::Unresolved(n)),
                            Outcome::Resolved => {}
                        }
                        value_of(f)?.val
                    }
                    None => 0,
                };
                StatementKind::Blob(vec![fill_val as u16; c.val as usize])
            }

            StatementKind::Org(ref mut expr) => {
                match self.eval_expr(expr)? {
                    Outcome::Unresolved(_) => {
                        let err = self.take_diag(&stmt.loc);
                        return Err(err);
                    }
                    Outcome::Resolved => {}
                }
                let v = value_of(expr)?;
                if v.val < self.ic {
                    return fatal(
                        &stmt.loc,
                        format!(
                            "Cannot move location pointer backwards by {} words",
                            self.ic - v.val
                        ),
                    );
                }
                self.ic = v.val;
                StatementKind::None
            }

            StatementKind::Ascii(ref text) => {
                let words = pack_string(&stmt.loc, text, false)?;
                stmt.size = words.len() as i64;
                StatementKind::Blob(words)
            }

            StatementKind::Asciiz(ref text) => {
                let words = pack_string(&stmt.loc, text, true)?;
                stmt.size = words.len() as i64;
                StatementKind::Blob(words)
            }

            StatementKind::Label(ref name) => {
                let value = Expr {
                    kind: ExprKind::Value(Value::relative(self.ic)),
                    loc: stmt.loc.clone(),
                };
                if self.syms.lookup(name).is_none() {
                    if self.syms.insert(name, SymFlags::constant(), Some(value)).is_err() {
                        return Err(ErrorKind::InternalError("insert after lookup".into()).into());
                    }
                } else {
                    let filled = {
                        let entry = self.syms.lookup_mut(name).unwrap_or_else(|| unreachable!());
                        if entry.flags.undefined {
                            // .global declared the name before the label.
                            entry.flags.undefined = false;
                            entry.flags.constant = true;
                            entry.value = Some(value);
                            true
                        } else {
                            false
                        }
                    };
                    if !filled {
                        return fatal(&stmt.loc, format!("Symbol '{}' already defined", name));
                    }
                }
                StatementKind::None
            }

            StatementKind::Global(ref name) => {
                if self.syms.lookup(name).is_some() {
                    if let Some(entry) = self.syms.lookup_mut(name) {
                        entry.flags.global = true;
                    }
                } else if self.syms.insert(name, SymFlags::undefined_global(), None).is_err() {
                    return Err(ErrorKind::InternalError("insert after lookup".into()).into());
                }
                StatementKind::None
            }

            StatementKind::Cpu(ref name) => match self.cpu.set(name, false) {
                Ok(()) => StatementKind::None,
                Err(CpuError::AlreadySet) => {
                    return fatal(&stmt.loc, "CPU type already set".into())
                }
                Err(CpuError::Unknown) => {
                    return fatal(&stmt.loc, format!("Unknown CPU type: '{}'", name))
                }
            },

            StatementKind::IfDef(_, _, _) => {
                return Err(ErrorKind::InternalError(
                    "conditional node must be spliced by the pass driver".into(),
                ).into())
            }

            StatementKind::StructDef(ref name, ref mut fields) => {
                let name = name.clone();
                match eval_struct(self, &stmt.loc, &name, fields)? {
                    Outcome::Unresolved(n) => return Ok(Outcome::Unresolved(n)),
                    Outcome::Resolved => {}
                }
                StatementKind::None
            }

            StatementKind::Op(ref mut op) => {
                stmt.size = 1;
                match op.shape {
                    OpShape::NoArg => StatementKind::Data(Value::absolute(op.word as i64)),
                    OpShape::Extended => {
                        if !self.cpu.is_extended() {
                            return fatal(
                                &stmt.loc,
                                format!("Instruction valid only for {}", CpuType::Kr16x.name()),
                            );
                        }
                        StatementKind::Data(Value::absolute(op.word as i64))
                    }
                    OpShape::Short(shape) => {
                        let encoded = {
                            let arg = match op.arg {
                                Some(ref mut arg) => arg,
                                None => {
                                    return Err(ErrorKind::InternalError(
                                        "short-form instruction without an argument".into(),
                                    ).into())
                                }
                            };
                            match self.eval_expr(arg)? {
                                Outcome::Unresolved(n) => return Ok(Outcome::Unresolved(n)),
                                Outcome::Resolved => {}
                            }
                            let v = value_of(arg)?;
                            self.encode_short(&stmt.loc, shape, op.word, v)?
                        };
                        StatementKind::Data(Value::absolute((op.word | encoded) as i64))
                    }
                }
            }

            StatementKind::Equ(_, _) | StatementKind::Const(_, _) | StatementKind::Entry(_) => {
                unreachable!("handled above")
            }
        };

        stmt.kind = folded;
        Ok(Outcome::Resolved)
    }

    fn eval_binding(&mut self, loc: &SrcLoc, kind: StatementKind) -> error::Result<Outcome> {
        match kind {
            StatementKind::Equ(name, mut expr) => {
                // Fatal errors propagate; an unresolved subtree is fine, it
                // is bound as a deferred value and folded lazily.
                self.eval_expr(&mut expr)?;
                if self.syms.lookup(&name).is_some() {
                    let entry = match self.syms.lookup_mut(&name) {
                        Some(entry) => entry,
                        None => unreachable!(),
                    };
                    if entry.flags.constant {
                        return fatal(
                            loc,
                            format!("Const symbol '{}' cannot be redefined", name),
                        );
                    }
                    entry.flags.undefined = false;
                    entry.value = Some(expr);
                } else if self.syms.insert(&name, SymFlags::none(), Some(expr)).is_err() {
                    return Err(ErrorKind::InternalError("insert after lookup".into()).into());
                }
                Ok(Outcome::Resolved)
            }

            StatementKind::Const(name, mut expr) => {
                self.eval_expr(&mut expr)?;
                if self.syms.lookup(&name).is_some() {
                    let filled = {
                        let entry = match self.syms.lookup_mut(&name) {
                            Some(entry) => entry,
                            None => unreachable!(),
                        };
                        if entry.flags.undefined {
                            entry.flags.undefined = false;
                            entry.flags.constant = true;
                            entry.value = Some(expr);
                            true
                        } else {
                            false
                        }
                    };
                    if !filled {
                        return fatal(loc, format!("Symbol '{}' already defined", name));
                    }
                } else if self.syms.insert(&name, SymFlags::constant(), Some(expr)).is_err() {
                    return Err(ErrorKind::InternalError("insert after lookup".into()).into());
                }
                Ok(Outcome::Resolved)
            }

            StatementKind::Entry(expr) => {
                if self.entry.is_some() {
                    return fatal(loc, "Program entry already defined".into());
                }
                self.entry = Some(expr);
                Ok(Outcome::Resolved)
            }

            _ => Err(ErrorKind::InternalError("not a binding statement".into()).into()),
        }
    }

    /// Encodes a short-form instruction argument into the low bits of the
    /// instruction word, including the IC-relative displacement rewrite.
    fn encode_short(
        &mut self,
        loc: &SrcLoc,
        shape: ShortShape,
        opword: u16,
        v: Value,
    ) -> error::Result<u16> {
        let (min, max) = match shape {
            ShortShape::Shc => (-15, 15),
            ShortShape::T | ShortShape::Rt => (-63, 63),
            ShortShape::Hlt => (0, 127),
            ShortShape::Brc | ShortShape::Exl | ShortShape::Nrf => (0, 255),
            ShortShape::Blc => (-32768, 65535),
        };

        // T-form arguments are IC-relative; R,T-form only for the opcodes
        // that address relative to IC (opcode bits 10..12).
        let rel_form = match shape {
            ShortShape::T => true,
            ShortShape::Rt => {
                let opl = (opword >> 10) & 0b111;
                opl == 0b010 || opl == 0b011 || opl == 0b110 || opl == 0b111
            }
            _ => false,
        };

        let mut val = v.val;
        if rel_form && v.relative {
            // Displacement from the next location, with 16-bit address
            // space wraparound correction near the edges.
            let diff = val - (self.ic + 1);
            val = if diff >= 65535 - 63 {
                diff - 65536
            } else if diff <= -65535 + 63 {
                diff + 65536
            } else {
                diff
            };
        }

        if val < min || val > max {
            return fatal(
                loc,
                format!(
                    "Argument value {} for {} is out of range ({}..{})",
                    val,
                    shape.name(),
                    min,
                    max
                ),
            );
        }

        let encoded = match shape {
            ShortShape::Shc => {
                let val = if val < 0 { 16 + val } else { val };
                ((val & 0b111) | ((val & 0b1000) << 6)) as u16
            }
            ShortShape::T | ShortShape::Rt => {
                if val < 0 {
                    (-val | 0b0000_0010_0000_0000) as u16
                } else {
                    val as u16
                }
            }
            ShortShape::Hlt => {
                // Bit 6 of the halt code lives at bit 9 of the word.
                let val = (val | ((val & 0b100_0000) << 3)) & !0b100_0000;
                val as u16
            }
            ShortShape::Brc | ShortShape::Exl | ShortShape::Nrf => val as u16,
            ShortShape::Blc => {
                if val & 255 != 0 {
                    return fatal(loc, "Lower byte for BLC argument is not 0".into());
                }
                ((val >> 8) & 255) as u16
            }
        };

        Ok(encoded)
    }

    // ---- pass driver -----------------------------------------------

    /// One full pass over the top-level statement list. Returns the total
    /// number of unresolved references; in strict mode (`keep_going` off)
    /// any unresolved statement is immediately fatal.
    pub fn assemble(
        &mut self,
        program: &mut Vec<Statement>,
        keep_going: bool,
    ) -> error::Result<u32> {
        debug!("==== Assemble pass (keep_going={}) ====", keep_going);
        self.ic = 0;
        let mut unresolved_total = 0;
        let mut i = 0;

        while i < program.len() {
            self.splice_conditional(program, i);

            let stmt = &mut program[i];
            if self.ic > self.ic_max() {
                return fatal(
                    &stmt.loc,
                    format!("Program too large (>{} words)", self.ic_max() + 1),
                );
            }
            // First visit pins the statement's load address; later passes
            // restore it, so addresses never drift between passes.
            match stmt.addr {
                Some(addr) => self.ic = addr,
                None => stmt.addr = Some(self.ic),
            }
            trace!("IC={}, node: {}", self.ic, stmt.kind.name());

            let outcome = self.eval_statement(stmt)?;
            self.ic += stmt.size;

            if let Outcome::Unresolved(n) = outcome {
                if !keep_going {
                    let err = self.take_diag(&stmt.loc);
                    return Err(err);
                }
                unresolved_total += n;
            }
            i += 1;
        }

        debug!("==== pass done, {} unresolved ====", unresolved_total);
        Ok(unresolved_total)
    }

    /// Conditional inclusion: tested once, then the selected branch is
    /// spliced into the top-level stream right after the conditional node
    /// and the node itself becomes a no-op. Never re-evaluated.
    fn splice_conditional(&mut self, program: &mut Vec<Statement>, i: usize) {
        let is_conditional = match program[i].kind {
            StatementKind::IfDef(_, _, _) => true,
            _ => false,
        };
        if !is_conditional {
            return;
        }
        let kind = mem::replace(&mut program[i].kind, StatementKind::None);
        if let StatementKind::IfDef(name, defined, undefined) = kind {
            let is_defined = self
                .syms
                .lookup(&name)
                .map_or(false, |e| !e.flags.undefined);
            debug!("conditional on '{}': {}", name, is_defined);
            let branch = if is_defined { defined } else { undefined };
            program.splice(i + 1..i + 1, branch.into_iter());
        }
    }
}

/// Applies a binary operator to two folded scalars, enforcing the
/// relative-value algebra: only `+`/`-` may touch a relative operand,
/// `rel - rel` cancels to absolute, and `rel + rel` is meaningless.
fn combine(loc: &SrcLoc, op: BinOp, a: Value, b: Value) -> error::Result<Value> {
    let relative = match op {
        BinOp::Sub if a.relative && b.relative => false,
        BinOp::Add if a.relative && b.relative => {
            return fatal(
                loc,
                format!("Invalid argument types for operator '{}': (relative, relative)", op.name()),
            )
        }
        BinOp::Add | BinOp::Sub => a.relative || b.relative,
        _ => {
            if a.relative || b.relative {
                return fatal(
                    loc,
                    format!(
                        "Invalid argument types for operator '{}': ({}, {})",
                        op.name(),
                        if a.relative { "relative" } else { "absolute" },
                        if b.relative { "relative" } else { "absolute" }
                    ),
                );
            }
            false
        }
    };

    let val = match op {
        BinOp::Add => a.val + b.val,
        BinOp::Sub => a.val - b.val,
        BinOp::Mul => match a.val.checked_mul(b.val) {
            Some(val) => val,
            None => {
                return fatal(
                    loc,
                    format!("Arithmetic overflow in '{} {} {}'", a.val, op.name(), b.val),
                )
            }
        },
        BinOp::Div => {
            if b.val == 0 {
                return fatal(loc, "Division by 0".into());
            }
            a.val / b.val
        }
        BinOp::Rem => {
            if b.val == 0 {
                return fatal(loc, "Division by 0".into());
            }
            a.val % b.val
        }
        BinOp::And => a.val & b.val,
        BinOp::Or => a.val | b.val,
        BinOp::Xor => a.val ^ b.val,
        BinOp::Shl => {
            check_shift(loc, op, b.val, 63)?;
            a.val << b.val
        }
        BinOp::Shr => {
            check_shift(loc, op, b.val, 63)?;
            a.val >> b.val
        }
        BinOp::Scale => {
            // Bit numbering with MSB = 0, so the operand doubles as the
            // shift count complement and must fit a 16-bit word.
            check_shift(loc, op, b.val, 15)?;
            a.val << (15 - b.val)
        }
    };

    Ok(Value::new(val, relative))
}

fn check_shift(loc: &SrcLoc, op: BinOp, count: i64, max: i64) -> error::Result<()> {
    if count < 0 || count > max {
        return fatal(
            loc,
            format!(
                "Argument value {} for '{}' is out of range (0..{})",
                count,
                op.name(),
                max
            ),
        );
    }
    Ok(())
}

/// Packs two 8-bit characters per storage word, left character in the
/// high byte; the zero-terminated kind appends a NUL.
fn pack_string(loc: &SrcLoc, text: &str, zero_terminated: bool) -> error::Result<Vec<u16>> {
    let mut bytes: Vec<u8> = text.bytes().collect();
    if zero_terminated {
        bytes.push(0);
    }
    let words = (bytes.len() + 1) / 2;
    if words > 65536 {
        return fatal(
            loc,
            format!(
                "Cannot fit the string in a process address space ({} words needed)",
                words
            ),
        );
    }
    let mut packed = Vec::with_capacity(words);
    for chunk in bytes.chunks(2) {
        let hi = chunk[0] as u16;
        let lo = if chunk.len() > 1 { chunk[1] as u16 } else { 0 };
        packed.push((hi << 8) | lo);
    }
    Ok(packed)
}

/// Struct layouts form a sequential dependency chain: each field's offset
/// needs the previous field's offset and resolved size, so resolution may
/// take several passes with no symbol missing at all.
fn eval_struct(
    ev: &mut Evaluator,
    loc: &SrcLoc,
    name: &str,
    fields: &mut Vec<::ast::StructField>,
) -> error::Result<Outcome> {
    // The struct symbol exists as a placeholder from the first visit so
    // references to it count as unresolved rather than missing.
    ensure_placeholder(ev, name, loc)?;

    let mut pending = 0;
    let mut prev: Option<(Option<i64>, Option<i64>)> = None;

    for field in fields.iter_mut() {
        ensure_placeholder(ev, &field.name, &field.loc)?;

        if field.offset.is_none() {
            let offset = match prev {
                None => Some(0),
                Some((Some(prev_offset), Some(prev_size))) => Some(prev_offset + prev_size),
                Some(_) => None,
            };
            if let Some(offset) = offset {
                field.offset = Some(offset);
                if let Some(entry) = ev.syms.lookup_mut(&field.name) {
                    entry.value = Some(Expr::int(field.loc.clone(), offset));
                    entry.flags.undefined = false;
                }
            }
        }
        if field.offset.is_none() {
            pending += 1;
        }

        pending += ev.eval_expr(&mut field.size)?.count();
        prev = Some((field.offset, field.size.value().map(|v| v.val)));
    }

    if pending > 0 {
        return Ok(Outcome::Unresolved(pending));
    }

    // Every field resolved; the struct symbol becomes the total size.
    let total = match prev {
        Some((Some(offset), Some(size))) => offset + size,
        _ => 0,
    };
    if let Some(entry) = ev.syms.lookup_mut(name) {
        entry.value = Some(Expr::int(loc.clone(), total));
        entry.flags.undefined = false;
    }
    Ok(Outcome::Resolved)
}

fn ensure_placeholder(ev: &mut Evaluator, name: &str, loc: &SrcLoc) -> error::Result<()> {
    if ev.syms.lookup(name).is_none() {
        let flags = SymFlags {
            undefined: true,
            constant: true,
            global: false,
        };
        if ev.syms.insert(name, flags, Some(Expr::int(loc.clone(), 0))).is_err() {
            return Err(ErrorKind::InternalError("insert after lookup".into()).into());
        }
    }
    Ok(())
}
