//! The constant pool.
//!
//! An append-only, deduplicating sequence of `Value`s. Inserting data equal
//! to an existing entry returns the existing index, so a chunk never
//! carries the same literal twice. Indices are 16-bit on the wire; running
//! out of them is a (pathological) fatal error surfaced by the caller.

use crate::fx::FxHashMap;
use crate::value::Value;

/// Index of a pool entry, as encoded in instruction operands.
pub type ConstIdx = u16;

/// Deduplicated literal pool.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstantPool {
    values: Vec<Value>,
    #[cfg_attr(feature = "enable-serde", serde(skip))]
    index: FxHashMap<Value, ConstIdx>,
}

impl ConstantPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning its index. Values equal to an existing
    /// entry reuse that entry's index. Returns `None` when the 16-bit index
    /// space is exhausted.
    pub fn insert(&mut self, value: Value) -> Option<ConstIdx> {
        if let Some(&idx) = self.index.get(&value) {
            return Some(idx);
        }
        if self.values.len() > ConstIdx::MAX as usize {
            return None;
        }
        let idx = self.values.len() as ConstIdx;
        log::trace!("pool[{}] = {}", idx, value);
        self.index.insert(value.clone(), idx);
        self.values.push(value);
        Some(idx)
    }

    /// The value at `idx`.
    pub fn get(&self, idx: ConstIdx) -> &Value {
        &self.values[idx as usize]
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Is the pool empty?
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates_equal_values() {
        let mut pool = ConstantPool::new();
        let a = pool.insert(Value::I32(7)).unwrap();
        let b = pool.insert(Value::Str("seven".into())).unwrap();
        let c = pool.insert(Value::I32(7)).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn strings_deduplicate_structurally() {
        let mut pool = ConstantPool::new();
        let a = pool.insert(Value::Str("x".into())).unwrap();
        let b = pool.insert(Value::Str("x".into())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_numeric_kinds() {
        let mut pool = ConstantPool::new();
        let a = pool.insert(Value::I32(1)).unwrap();
        let b = pool.insert(Value::I64(1)).unwrap();
        assert_ne!(a, b);
    }
}
