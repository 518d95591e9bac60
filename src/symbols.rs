//! Symbol and label bookkeeping.
//!
//! Labels resolve to an offset in a tagged segment, or alias another label.
//! Alias chains are followed iteratively with a hard depth cap, so a cyclic
//! chain can never hang the resolver. External (dynamically-linked) symbols
//! get dense GOT/IAT slot indices in first-registration order; undefined
//! (statically-linked) symbols are a plain name set whose references become
//! relocation records instead of patches.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Which buffer a resolved label points into.
///
/// Tagged explicitly at definition time; classification never falls back to
/// name-pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Code,
    Data,
}

/// A label is either resolved to an offset or an alias to another label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelValue {
    Resolved { offset: usize, segment: Segment },
    Alias(String),
}

/// Maximum alias-chain depth followed during resolution
pub const MAX_ALIAS_DEPTH: usize = 10;

/// Name -> label value map for one compilation unit
#[derive(Debug, Default)]
pub struct LabelTable {
    entries: HashMap<String, LabelValue>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Bind a name to a concrete offset. A later definition wins.
    pub fn define(&mut self, name: &str, offset: usize, segment: Segment) {
        self.entries
            .insert(name.to_string(), LabelValue::Resolved { offset, segment });
    }

    /// Bind a name as an alias of another label
    pub fn alias(&mut self, name: &str, target: &str) {
        self.entries
            .insert(name.to_string(), LabelValue::Alias(target.to_string()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Follow the alias chain (at most [`MAX_ALIAS_DEPTH`] hops) to a
    /// concrete offset. Returns `None` for unknown names, over-depth
    /// chains, and cycles.
    pub fn resolve(&self, name: &str) -> Option<(usize, Segment)> {
        let mut current = name;
        for _ in 0..=MAX_ALIAS_DEPTH {
            match self.entries.get(current)? {
                LabelValue::Resolved { offset, segment } => return Some((*offset, *segment)),
                LabelValue::Alias(next) => current = next,
            }
        }
        None
    }
}

/// A dynamically-linked symbol with its assigned GOT/IAT slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSymbol {
    pub name: String,
    /// Owning dynamic-library index (container writers map this to an
    /// import table / dylib ordinal)
    pub dylib: u16,
    /// Dense slot index, unique per unit, assigned in registration order
    pub slot: u32,
}

/// Registry of dynamically-linked symbols.
///
/// Slot indices are dense from 0 and stable: re-registering a name returns
/// its existing slot.
#[derive(Debug, Default)]
pub struct ExternalSymbols {
    by_name: HashMap<String, u32>,
    entries: Vec<ExternalSymbol>,
}

impl ExternalSymbols {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Register a symbol, returning its slot index (idempotent per name)
    pub fn register(&mut self, name: &str, dylib: u16) -> u32 {
        if let Some(&slot) = self.by_name.get(name) {
            return slot;
        }
        let slot = self.entries.len() as u32;
        self.by_name.insert(name.to_string(), slot);
        self.entries.push(ExternalSymbol {
            name: name.to_string(),
            dylib,
            slot,
        });
        slot
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in slot order
    pub fn entries(&self) -> &[ExternalSymbol] {
        &self.entries
    }
}

/// Registry of statically-linked symbols whose definitions arrive later.
/// References to these are reported as relocation records, not errors.
#[derive(Debug, Default)]
pub struct UndefinedSymbols {
    names: HashSet<String>,
}

impl UndefinedSymbols {
    pub fn new() -> Self {
        Self {
            names: HashSet::new(),
        }
    }

    pub fn register(&mut self, name: &str) {
        self.names.insert(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// Architecture-specific relocation kind.
///
/// Deliberately the minimum set a later static-link stage needs, not a
/// general object-file relocation vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelocationKind {
    /// ARM64 B/BL 26-bit word displacement
    Arm64Branch26,
    /// ARM64 ADRP 21-bit page delta
    Arm64Page21,
    /// ARM64 ADD/LDR low-12 page offset
    Arm64PageOff12,
    /// ARM64 ADR 21-bit byte displacement
    Arm64Adr21,
    /// x86-64 32-bit PC-relative displacement
    X64Rel32,
}

/// A reference a later linking stage must patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationRecord {
    /// Byte offset of the fixup site in the code buffer
    pub offset: usize,
    /// Symbol name, without the global sigil
    pub symbol: String,
    pub kind: RelocationKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_resolve() {
        let mut labels = LabelTable::new();
        labels.define("@main", 0x40, Segment::Code);
        assert_eq!(labels.resolve("@main"), Some((0x40, Segment::Code)));
        assert_eq!(labels.resolve("@missing"), None);
    }

    #[test]
    fn test_alias_chain_resolves() {
        let mut labels = LabelTable::new();
        labels.define("real", 8, Segment::Data);
        labels.alias("a", "real");
        labels.alias("b", "a");
        assert_eq!(labels.resolve("b"), Some((8, Segment::Data)));
    }

    #[test]
    fn test_alias_chain_depth_cap() {
        let mut labels = LabelTable::new();
        labels.define("end", 0, Segment::Code);
        // depth 10 resolves, depth 11 does not
        labels.alias("hop0", "end");
        for i in 1..=10 {
            labels.alias(&format!("hop{}", i), &format!("hop{}", i - 1));
        }
        assert_eq!(labels.resolve("hop9"), Some((0, Segment::Code)));
        assert_eq!(labels.resolve("hop10"), None);
    }

    #[test]
    fn test_alias_cycle_terminates() {
        let mut labels = LabelTable::new();
        labels.alias("x", "y");
        labels.alias("y", "x");
        assert_eq!(labels.resolve("x"), None);
    }

    #[test]
    fn test_redefinition_wins() {
        let mut labels = LabelTable::new();
        labels.define("l", 4, Segment::Code);
        labels.define("l", 12, Segment::Code);
        assert_eq!(labels.resolve("l"), Some((12, Segment::Code)));
    }

    #[test]
    fn test_external_slots_dense_and_idempotent() {
        let mut externs = ExternalSymbols::new();
        assert_eq!(externs.register("printf", 1), 0);
        assert_eq!(externs.register("malloc", 1), 1);
        assert_eq!(externs.register("printf", 1), 0);
        assert_eq!(externs.len(), 2);
        assert_eq!(externs.entries()[1].name, "malloc");
        assert_eq!(externs.entries()[1].slot, 1);
    }
}
