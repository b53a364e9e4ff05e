//! Process-wide symbol interning for one VM instance.

use core_types::SymbolId;

/// Append-only table of interned names. The index of a name is its
/// symbol id and never changes for the life of the VM; lookup is a
/// linear scan, which is fine for the symbol counts scripts produce.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<Box<str>>,
}

impl SymbolTable {
    /// Creates an empty table.
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Returns the id of `name`, interning it if new.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(existing) = self.find(name) {
            return existing;
        }
        self.names.push(name.into());
        SymbolId((self.names.len() - 1) as u32)
    }

    /// Looks a name up without interning it. Host-side lookups use
    /// this so probing for a variable never grows the table.
    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.names
            .iter()
            .position(|n| n.as_ref() == name)
            .map(|i| SymbolId(i as u32))
    }

    /// The name behind a symbol id.
    pub fn name(&self, sym: SymbolId) -> &str {
        &self.names[sym.index()]
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
