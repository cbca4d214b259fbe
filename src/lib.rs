#![recursion_limit = "1024"]

#[macro_use]
extern crate derive_new;

#[macro_use]
extern crate error_chain;

#[macro_use]
extern crate log;

extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

mod assembler;
pub mod ast;
pub mod error;
mod eval;
pub mod float;
mod map;
mod src_loc;
mod symtab;
pub mod writer;

pub use assembler::{Assembler, AssemblerOutput, OutputKind};
pub use eval::{CpuType, Evaluator, Outcome};
pub use map::{MapEntry, SourceMap};
pub use src_loc::SrcLoc;
pub use symtab::{SymFlags, SymbolTable};
