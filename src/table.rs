//! Uniform columnar table keyed by normalized file path.
//!
//! Both libraries are projected into this shape so that reconciliation,
//! export projection, and sync diffing are generic column-wise operations
//! driven by the field mapping, never per-field code.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A typed scalar cell. `Null` marks a value absent at the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Attribute rendering for the XML writer. `Null` renders empty and is
    /// skipped by the writer alongside empty strings.
    pub fn render(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Null => String::new(),
        }
    }
}

/// One column of cells plus the shared key vector make up a [`Table`].
///
/// Keys and every column have identical length; row `i` of every column
/// belongs to key `i`. Keys are unique (loaders deduplicate, first row wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    keys: Vec<String>,
    columns: BTreeMap<String, Vec<Value>>,
}

impl Table {
    pub fn new(keys: Vec<String>, columns: BTreeMap<String, Vec<Value>>) -> Result<Self, SyncError> {
        for (name, values) in &columns {
            if values.len() != keys.len() {
                return Err(SyncError::Load(format!(
                    "column '{}' has {} rows, expected {}",
                    name,
                    values.len(),
                    keys.len()
                )));
            }
        }
        Ok(Self { keys, columns })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        self.columns.get(column).and_then(|values| values.get(row))
    }

    fn key_positions(&self) -> HashMap<&str, usize> {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.as_str(), i))
            .collect()
    }

    /// Drop rows whose key already appeared earlier. First occurrence wins.
    /// Returns the number of dropped rows.
    pub fn dedup_keys(&mut self) -> usize {
        let mut seen = HashSet::new();
        let keep: Vec<bool> = self.keys.iter().map(|k| seen.insert(k.clone())).collect();
        let dropped = keep.iter().filter(|&&k| !k).count();
        if dropped == 0 {
            return 0;
        }
        let mut it = keep.iter();
        self.keys.retain(|_| *it.next().unwrap());
        for values in self.columns.values_mut() {
            let mut it = keep.iter();
            values.retain(|_| *it.next().unwrap());
        }
        dropped
    }

    /// Rows for the given keys, in the given order. Unknown keys are skipped.
    pub fn select(&self, keys: &[String]) -> Table {
        let positions = self.key_positions();
        let rows: Vec<usize> = keys
            .iter()
            .filter_map(|k| positions.get(k.as_str()).copied())
            .collect();
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    rows.iter().map(|&i| values[i].clone()).collect(),
                )
            })
            .collect();
        Table {
            keys: rows.iter().map(|&i| self.keys[i].clone()).collect(),
            columns,
        }
    }

    /// Keys present in both tables, in this table's row order.
    pub fn intersection_keys(&self, other: &Table) -> Vec<String> {
        let theirs: HashSet<&str> = other.keys.iter().map(String::as_str).collect();
        self.keys
            .iter()
            .filter(|k| theirs.contains(k.as_str()))
            .cloned()
            .collect()
    }

    /// Keys present here but not in `other`, in this table's row order.
    pub fn difference_keys(&self, other: &Table) -> Vec<String> {
        let theirs: HashSet<&str> = other.keys.iter().map(String::as_str).collect();
        self.keys
            .iter()
            .filter(|k| !theirs.contains(k.as_str()))
            .cloned()
            .collect()
    }

    /// Rows whose key starts with `prefix`. The caller normalizes the prefix
    /// the same way the keys were normalized.
    pub fn filter_key_prefix(&self, prefix: &str) -> Table {
        let keys: Vec<String> = self
            .keys
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        self.select(&keys)
    }

    /// Inner join on the key. Row set is the key intersection in this
    /// table's order; the result carries every column from both sides.
    /// A shared column name is a schema conflict.
    pub fn join(&self, other: &Table) -> Result<Table, SyncError> {
        let shared = self.intersection_keys(other);
        let left = self.select(&shared);
        let right = other.select(&shared);

        let mut columns = left.columns;
        for (name, values) in right.columns {
            if columns.contains_key(&name) {
                return Err(SyncError::Mapping(format!(
                    "join would duplicate column '{name}'"
                )));
            }
            columns.insert(name, values);
        }
        Ok(Table {
            keys: left.keys,
            columns,
        })
    }

    /// Rename columns per the mapping. Renaming onto a name that already
    /// exists (and is not itself being renamed away) is ambiguous.
    pub fn rename_columns(&self, renames: &BTreeMap<String, String>) -> Result<Table, SyncError> {
        let mut columns = BTreeMap::new();
        for (name, values) in &self.columns {
            let target = renames.get(name).unwrap_or(name);
            if columns.contains_key(target) {
                return Err(SyncError::Mapping(format!(
                    "rename collision on column '{target}'"
                )));
            }
            // A not-yet-visited column that keeps its name can still collide.
            if target != name && self.columns.contains_key(target) && !renames.contains_key(target)
            {
                return Err(SyncError::Mapping(format!(
                    "rename collision on column '{target}'"
                )));
            }
            columns.insert(target.clone(), values.clone());
        }
        Ok(Table {
            keys: self.keys.clone(),
            columns,
        })
    }

    /// Drop the named columns. Missing names are ignored.
    pub fn drop_columns(&self, names: &[String]) -> Table {
        let drop: HashSet<&str> = names.iter().map(String::as_str).collect();
        Table {
            keys: self.keys.clone(),
            columns: self
                .columns
                .iter()
                .filter(|(name, _)| !drop.contains(name.as_str()))
                .map(|(name, values)| (name.clone(), values.clone()))
                .collect(),
        }
    }

    /// Replace nulls in a column with a default value.
    pub fn fill_nulls(&mut self, column: &str, default: &Value) {
        if let Some(values) = self.columns.get_mut(column) {
            for value in values.iter_mut() {
                if value.is_null() {
                    *value = default.clone();
                }
            }
        }
    }

    /// Apply a value transform to every cell of a column.
    pub fn map_column(&mut self, column: &str, f: impl Fn(&Value) -> Value) {
        if let Some(values) = self.columns.get_mut(column) {
            for value in values.iter_mut() {
                *value = f(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[(&str, &[(&str, Value)])]) -> Table {
        let keys: Vec<String> = rows.iter().map(|(k, _)| k.to_string()).collect();
        let mut columns: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (_, cells) in rows {
            for (name, value) in cells.iter() {
                columns
                    .entry(name.to_string())
                    .or_default()
                    .push(value.clone());
            }
        }
        Table::new(keys, columns).unwrap()
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn new_rejects_ragged_columns() {
        let mut columns = BTreeMap::new();
        columns.insert("a".to_string(), vec![Value::Int(1)]);
        let err = Table::new(vec!["x".into(), "y".into()], columns).unwrap_err();
        assert!(matches!(err, SyncError::Load(_)));
    }

    #[test]
    fn select_preserves_requested_order_and_skips_unknown() {
        let t = table(&[
            ("a", &[("n", Value::Int(1))]),
            ("b", &[("n", Value::Int(2))]),
            ("c", &[("n", Value::Int(3))]),
        ]);
        let picked = t.select(&["c".into(), "zzz".into(), "a".into()]);
        assert_eq!(picked.keys(), ["c".to_string(), "a".to_string()]);
        assert_eq!(picked.column("n").unwrap(), &[Value::Int(3), Value::Int(1)]);
    }

    #[test]
    fn set_operations_partition_the_key_space() {
        let left = table(&[
            ("a", &[("l", Value::Int(1))]),
            ("b", &[("l", Value::Int(2))]),
        ]);
        let right = table(&[
            ("b", &[("r", Value::Int(20))]),
            ("c", &[("r", Value::Int(30))]),
        ]);

        assert_eq!(left.intersection_keys(&right), ["b".to_string()]);
        assert_eq!(left.difference_keys(&right), ["a".to_string()]);
        assert_eq!(right.difference_keys(&left), ["c".to_string()]);

        let common = left.join(&right).unwrap();
        assert_eq!(common.len() + right.difference_keys(&left).len(), right.len());
        assert_eq!(common.len() + left.difference_keys(&right).len(), left.len());
    }

    #[test]
    fn join_carries_both_sides_columns() {
        let left = table(&[("k", &[("l", Value::Int(1))])]);
        let right = table(&[("k", &[("r", text("x"))])]);
        let joined = left.join(&right).unwrap();
        assert_eq!(joined.value(0, "l"), Some(&Value::Int(1)));
        assert_eq!(joined.value(0, "r"), Some(&text("x")));
    }

    #[test]
    fn join_rejects_column_collision() {
        let left = table(&[("k", &[("n", Value::Int(1))])]);
        let right = table(&[("k", &[("n", Value::Int(2))])]);
        assert!(matches!(left.join(&right), Err(SyncError::Mapping(_))));
    }

    #[test]
    fn rename_rejects_collision_with_existing_column() {
        let t = table(&[("k", &[("old", Value::Int(1)), ("taken", Value::Int(2))])]);
        let mut renames = BTreeMap::new();
        renames.insert("old".to_string(), "taken".to_string());
        assert!(matches!(
            t.rename_columns(&renames),
            Err(SyncError::Mapping(_))
        ));
    }

    #[test]
    fn rename_swaps_are_not_collisions() {
        let t = table(&[("k", &[("rating", Value::Int(1)), ("mirror", Value::Int(2))])]);
        let mut renames = BTreeMap::new();
        renames.insert("rating".to_string(), "Rating".to_string());
        let renamed = t.rename_columns(&renames).unwrap();
        assert!(renamed.column("Rating").is_some());
        assert!(renamed.column("rating").is_none());
        assert!(renamed.column("mirror").is_some());
    }

    #[test]
    fn fill_and_map_operate_column_wise() {
        let mut t = table(&[
            ("a", &[("n", Value::Null)]),
            ("b", &[("n", Value::Int(2))]),
        ]);
        t.fill_nulls("n", &Value::Int(0));
        assert_eq!(t.column("n").unwrap(), &[Value::Int(0), Value::Int(2)]);

        t.map_column("n", |v| match v {
            Value::Int(n) => Value::Int(n * 1000),
            other => other.clone(),
        });
        assert_eq!(t.column("n").unwrap(), &[Value::Int(0), Value::Int(2000)]);
    }

    #[test]
    fn filter_key_prefix_keeps_only_matching_rows() {
        let t = table(&[
            ("/music/a.mp3", &[("n", Value::Int(1))]),
            ("/other/b.mp3", &[("n", Value::Int(2))]),
        ]);
        let filtered = t.filter_key_prefix("/music");
        assert_eq!(filtered.keys(), ["/music/a.mp3".to_string()]);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut t = table(&[
            ("k", &[("n", Value::Int(1))]),
            ("k", &[("n", Value::Int(2))]),
            ("j", &[("n", Value::Int(3))]),
        ]);
        assert_eq!(t.dedup_keys(), 1);
        assert_eq!(t.keys(), ["k".to_string(), "j".to_string()]);
        assert_eq!(t.column("n").unwrap(), &[Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn json_round_trip_preserves_table() {
        let t = table(&[
            ("a", &[("n", Value::Int(1)), ("s", text("x")), ("f", Value::Float(2.5))]),
            ("b", &[("n", Value::Null), ("s", text("")), ("f", Value::Float(0.0))]),
        ]);
        let json = serde_json::to_string(&t).unwrap();
        let back: Table = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
