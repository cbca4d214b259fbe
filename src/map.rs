//! Address-to-source mapping, produced from the finalized statement
//! stream for consumption by debuggers and listing tools.

use ast::{Statement, StatementKind};
use error;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, new)]
pub struct MapEntry {
    pub addr: u16,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct SourceMap {
    entries: Vec<MapEntry>,
}

impl SourceMap {
    pub fn new(program: &[Statement]) -> SourceMap {
        let mut entries = Vec::new();
        for stmt in program {
            let addr = match stmt.addr {
                Some(addr) => addr as u16,
                None => continue,
            };
            match stmt.kind {
                StatementKind::Data(_) | StatementKind::Blob(_) | StatementKind::Word(_) => {
                    entries.push(MapEntry::new(
                        addr,
                        stmt.loc.file.as_ref().clone(),
                        stmt.loc.line,
                        stmt.loc.column,
                    ));
                }
                _ => {}
            }
        }
        entries.sort_by_key(|e| e.addr);
        SourceMap { entries: entries }
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn to_json(&self) -> error::Result<String> {
        Ok(::serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ast::{Statement, StatementKind, Value};
    use src_loc::SrcLoc;
    use std::sync::Arc;

    fn stmt_at(addr: i64, line: u32) -> Statement {
        let loc = SrcLoc::new(Arc::new("prog.asm".into()), line, 1);
        let mut stmt = Statement::new(loc, StatementKind::Data(Value::absolute(0)));
        stmt.addr = Some(addr);
        stmt
    }

    #[test]
    fn test_map_entries() {
        let map = SourceMap::new(&[stmt_at(2, 10), stmt_at(0, 12)]);
        assert_eq!(2, map.entries().len());
        assert_eq!(0, map.entries()[0].addr);
        assert_eq!(12, map.entries()[0].line);
        assert_eq!("prog.asm", map.entries()[1].file);
    }

    #[test]
    fn test_map_to_json() {
        let map = SourceMap::new(&[stmt_at(0, 1)]);
        let json = map.to_json().unwrap();
        assert!(json.contains("\"addr\": 0"));
        assert!(json.contains("\"file\": \"prog.asm\""));
    }
}
