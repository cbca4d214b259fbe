use std::fmt;
use std::sync::Arc;

/// Where a node came from in the source tree. The front end fills this in
/// while building statements; diagnostics print it as `file:line:col`.
#[derive(Debug, Clone, Eq, PartialEq, new)]
pub struct SrcLoc {
    pub file: Arc<String>,
    pub line: u32,
    pub column: u32,
}

impl SrcLoc {
    /// Location for nodes built programmatically (predefined constants,
    /// tests) rather than read from a source file.
    pub fn none() -> SrcLoc {
        SrcLoc {
            file: Arc::new(String::from("(none)")),
            line: 0,
            column: 0,
        }
    }
}

impl fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let loc = SrcLoc::new(Arc::new("prog.s".into()), 12, 3);
        assert_eq!("prog.s:12:3", format!("{}", loc));
    }
}
