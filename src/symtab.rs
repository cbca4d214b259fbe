//! Chained-hash symbol table with deferred values.
//!
//! Symbols either hold a folded subtree already (labels, predefined
//! constants) or an arbitrary expression bound by `.equ`/`.const` that is
//! folded lazily on first reference.

use ast::Expr;

/// Symbol attributes. `undefined` marks placeholders created by `.global`
/// (and struct fields awaiting their offset); `constant` entries can never
/// be replaced.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SymFlags {
    pub undefined: bool,
    pub constant: bool,
    pub global: bool,
}

impl SymFlags {
    pub fn none() -> SymFlags {
        Default::default()
    }

    pub fn constant() -> SymFlags {
        SymFlags {
            constant: true,
            ..Default::default()
        }
    }

    pub fn undefined_global() -> SymFlags {
        SymFlags {
            undefined: true,
            global: true,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct SymEntry {
    pub name: String,
    pub flags: SymFlags,
    /// Owned value subtree; `None` for `.global` placeholders, and while
    /// the evaluator has temporarily taken the subtree out for folding.
    pub value: Option<Expr>,
    /// Recursion guard: set while the deferred subtree is being folded.
    pub busy: bool,
}

/// Attempted to insert over an existing entry.
#[derive(Debug, Eq, PartialEq)]
pub struct DuplicateSymbol;

#[derive(Debug)]
pub struct SymbolTable {
    buckets: Vec<Vec<SymEntry>>,
    case_sensitive: bool,
    len: usize,
}

impl SymbolTable {
    pub fn new(buckets: usize, case_sensitive: bool) -> SymbolTable {
        assert!(buckets > 0);
        let mut slots = Vec::with_capacity(buckets);
        for _ in 0..buckets {
            slots.push(Vec::new());
        }
        SymbolTable {
            buckets: slots,
            case_sensitive: case_sensitive,
            len: 0,
        }
    }

    /// Multiply-and-add rolling hash over every character, case-folded for
    /// case-insensitive tables, modulo the bucket count.
    fn hash(&self, name: &str) -> usize {
        let mut h: u32 = 0;
        for c in name.chars() {
            let c = if self.case_sensitive {
                c
            } else {
                c.to_ascii_lowercase()
            };
            h = (c as u32).wrapping_add(h << 5).wrapping_sub(h);
        }
        h as usize % self.buckets.len()
    }

    fn names_equal(&self, a: &str, b: &str) -> bool {
        if self.case_sensitive {
            a == b
        } else {
            a.eq_ignore_ascii_case(b)
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&SymEntry> {
        let slot = self.hash(name);
        self.buckets[slot]
            .iter()
            .find(|e| self.names_equal(&e.name, name))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut SymEntry> {
        let slot = self.hash(name);
        let case_sensitive = self.case_sensitive;
        self.buckets[slot].iter_mut().find(|e| {
            if case_sensitive {
                e.name == name
            } else {
                e.name.eq_ignore_ascii_case(name)
            }
        })
    }

    /// Adds a new entry. Fails if the name is already present — in
    /// particular, a `constant` entry can never be replaced.
    pub fn insert(
        &mut self,
        name: &str,
        flags: SymFlags,
        value: Option<Expr>,
    ) -> ::std::result::Result<(), DuplicateSymbol> {
        if self.lookup(name).is_some() {
            return Err(DuplicateSymbol);
        }
        let slot = self.hash(name);
        self.buckets[slot].push(SymEntry {
            name: name.into(),
            flags: flags,
            value: value,
            busy: false,
        });
        self.len += 1;
        Ok(())
    }

    /// Removes an entry together with its owned subtree. Returns whether
    /// the name was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let slot = self.hash(name);
        let found = {
            let bucket = &self.buckets[slot];
            let mut index = None;
            for (i, e) in bucket.iter().enumerate() {
                if self.names_equal(&e.name, name) {
                    index = Some(i);
                    break;
                }
            }
            index
        };
        match found {
            Some(i) => {
                self.buckets[slot].swap_remove(i);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Visits every entry, in no particular order. Used for global-symbol
    /// export by the object writer.
    pub fn iter(&self) -> impl Iterator<Item = &SymEntry> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ast::Expr;
    use src_loc::SrcLoc;

    fn int(val: i64) -> Option<Expr> {
        Some(Expr::int(SrcLoc::none(), val))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut t = SymbolTable::new(7, true);
        assert!(t.insert("alpha", SymFlags::none(), int(1)).is_ok());
        assert!(t.insert("beta", SymFlags::none(), int(2)).is_ok());
        assert_eq!(2, t.len());
        assert_eq!(
            1,
            t.lookup("alpha").unwrap().value.as_ref().unwrap().value().unwrap().val
        );
        assert!(t.lookup("gamma").is_none());
        assert!(t.remove("alpha"));
        assert!(!t.remove("alpha"));
        assert!(t.lookup("alpha").is_none());
        assert_eq!(1, t.len());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut t = SymbolTable::new(7, true);
        assert!(t.insert("x", SymFlags::constant(), int(1)).is_ok());
        assert_eq!(
            Err(DuplicateSymbol),
            t.insert("x", SymFlags::none(), int(2))
        );
    }

    #[test]
    fn test_case_insensitive() {
        let mut t = SymbolTable::new(7, false);
        assert!(t.insert("Loop", SymFlags::none(), int(3)).is_ok());
        assert!(t.lookup("LOOP").is_some());
        assert!(t.lookup("loop").is_some());
        assert_eq!(Err(DuplicateSymbol), t.insert("LOOP", SymFlags::none(), int(4)));

        let mut t = SymbolTable::new(7, true);
        assert!(t.insert("Loop", SymFlags::none(), int(3)).is_ok());
        assert!(t.lookup("LOOP").is_none());
    }

    #[test]
    fn test_collisions_chain() {
        // One bucket forces every entry to chain.
        let mut t = SymbolTable::new(1, true);
        for i in 0..32 {
            let name = format!("sym{}", i);
            assert!(t.insert(&name, SymFlags::none(), int(i)).is_ok());
        }
        assert_eq!(32, t.len());
        for i in 0..32 {
            let name = format!("sym{}", i);
            let e = t.lookup(&name).unwrap();
            assert_eq!(i, e.value.as_ref().unwrap().value().unwrap().val);
        }
        assert_eq!(32, t.iter().count());
    }
}
