//! The two-pass driver tying the evaluator and the writers together.

use ast::Statement;
use error;
use eval::{CpuError, Evaluator};
use map::SourceMap;
use writer;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OutputKind {
    /// Big-endian memory image, no header.
    Raw,
    /// Human-readable word-by-word listing.
    Debug,
    /// Front-panel key switch listing.
    Keys,
    /// Relocatable KRO object.
    Object,
}

impl OutputKind {
    pub fn from_name(name: &str) -> Option<OutputKind> {
        match name {
            "raw" => Some(OutputKind::Raw),
            "debug" => Some(OutputKind::Debug),
            "keys" => Some(OutputKind::Keys),
            "object" => Some(OutputKind::Object),
            _ => None,
        }
    }
}

#[derive(Debug, new)]
pub struct AssemblerOutput {
    pub bytes: Option<Vec<u8>>,
    pub text: Option<String>,
    pub map: Option<SourceMap>,
}

pub struct Assembler {
    evaluator: Evaluator,
    program: Vec<Statement>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            evaluator: Evaluator::new(),
            program: Vec::new(),
        }
    }

    /// Selects the target cpu up front. A forced selection wins silently
    /// over any `.cpu` directive in the program.
    pub fn set_cpu(&mut self, name: &str) -> error::Result<()> {
        match self.evaluator.cpu.set(name, true) {
            Ok(()) => Ok(()),
            Err(CpuError::Unknown) => bail!("Unknown cpu: '{}'", name),
            Err(CpuError::AlreadySet) => bail!("Cpu already set"),
        }
    }

    /// Predefines an absolute constant, as if by a `.const` directive.
    pub fn define_const(&mut self, name: &str, val: i64) {
        self.evaluator.define_const(name, val);
    }

    pub fn push_program(&mut self, statements: Vec<Statement>) {
        self.program.extend(statements.into_iter());
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Runs the passes and serializes. The first pass is always tolerant of
    /// unresolved names. If anything is left over, a second pass runs: for
    /// object output it is tolerant again and the leftovers become
    /// relocations, otherwise it is strict and the first unresolved name is
    /// reported as an error.
    pub fn assemble(mut self, output: OutputKind) -> error::Result<AssemblerOutput> {
        let unresolved = self.evaluator.assemble(&mut self.program, true)?;
        info!("pass 1: {} unresolved", unresolved);
        if unresolved > 0 {
            let tolerant = output == OutputKind::Object;
            let unresolved = self.evaluator.assemble(&mut self.program, tolerant)?;
            info!("pass 2: {} unresolved", unresolved);
        }

        let map = SourceMap::new(&self.program);
        let mut result = AssemblerOutput::new(None, None, Some(map));
        match output {
            OutputKind::Raw => result.bytes = Some(writer::write_raw(&self.program)?),
            OutputKind::Debug => result.text = Some(writer::write_debug(&self.program)?),
            OutputKind::Keys => result.text = Some(writer::write_keys(&self.program)?),
            OutputKind::Object => {
                result.bytes = Some(writer::object::write_object(
                    &self.program,
                    &mut self.evaluator,
                )?)
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_kind_names() {
        assert_eq!(Some(OutputKind::Raw), OutputKind::from_name("raw"));
        assert_eq!(Some(OutputKind::Object), OutputKind::from_name("object"));
        assert_eq!(None, OutputKind::from_name("elf"));
    }

    #[test]
    fn test_unknown_cpu_rejected() {
        assert!(Assembler::new().set_cpu("pdp11").is_err());
        assert!(Assembler::new().set_cpu("kr16x").is_ok());
    }
}
