//! Row context for fields inside dynamic groups.
//!
//! A [`RowContext`] is a snapshot: the row metadata of one field instance plus
//! the values of every row in its group at the moment it was built. It is
//! rebuilt on demand and never stored, so adding or removing rows can't leave a
//! stale index behind.

use crate::state::{FieldUpdate, FieldUpdates};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use shared::{FieldKey, FieldValue, GroupId};
use std::sync::Arc;

/// Values of one row, keyed by field id.
pub type RowValues = IndexMap<String, FieldValue>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RowInfo {
    pub group: Option<GroupId>,
    pub current_row: usize,
    pub total_rows: usize,
    pub is_last: bool,
}

impl RowInfo {
    pub fn new(group: Option<GroupId>, current_row: usize, total_rows: usize) -> Self {
        Self {
            group,
            current_row,
            total_rows,
            is_last: current_row + 1 == total_rows,
        }
    }
}

/// Which rows a [`RowUpdate`] targets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RowRange {
    /// Every row after the current one.
    #[default]
    Following,
    /// `[from, to)`, each bound defaulting to `current_row + 1` and `total_rows`.
    Interval { from: Option<usize>, to: Option<usize> },
    /// An explicit list of row indices.
    Rows(Vec<usize>),
}

#[derive(Debug, Clone, Default)]
pub struct RowUpdate {
    pub range: RowRange,
    /// Per-field updates applied to every targeted row.
    pub updates: IndexMap<String, FieldUpdate>,
}

#[derive(Debug, Clone)]
pub struct RowContext {
    pub info: RowInfo,
    rows: Arc<[RowValues]>,
}

impl RowContext {
    pub fn build(info: RowInfo, rows: Vec<RowValues>) -> Self {
        Self {
            info,
            rows: rows.into(),
        }
    }

    pub fn current_row(&self) -> usize {
        self.info.current_row
    }

    pub fn total_rows(&self) -> usize {
        self.info.total_rows
    }

    pub fn is_last(&self) -> bool {
        self.info.is_last
    }

    /// Key of `field` at `row` within this context's group.
    pub fn key_at(&self, row: usize, field: impl Into<String>) -> FieldKey {
        FieldKey {
            group: self.info.group.clone(),
            row: Some(row),
            field: field.into(),
        }
    }

    /// Values of the row `offset` rows away: `0` is the current row, positive
    /// offsets look forward and negative ones backward.
    pub fn row_values(&self, offset: isize) -> Option<&RowValues> {
        let target = self.info.current_row.checked_add_signed(offset)?;
        if target >= self.info.total_rows {
            return None;
        }
        self.rows.get(target)
    }

    pub fn row_value(&self, offset: isize, field: &str) -> Option<&FieldValue> {
        self.row_values(offset)?.get(field)
    }

    pub fn current_values(&self) -> RowValues {
        self.row_values(0).cloned().unwrap_or_default()
    }

    pub fn all_rows(&self) -> &[RowValues] {
        &self.rows
    }

    /// Row indices addressed by `range`, clamped to `[0, total_rows)`.
    pub fn target_rows(&self, range: &RowRange) -> Vec<usize> {
        let total = self.info.total_rows;
        match range {
            RowRange::Following => (self.info.current_row + 1..total).collect(),
            RowRange::Interval { from, to } => {
                let from = from.unwrap_or(self.info.current_row + 1);
                let to = to.unwrap_or(total).min(total);
                (from..to).collect()
            }
            RowRange::Rows(rows) => {
                let mut targets: Vec<usize> = rows.iter().copied().filter(|row| *row < total).collect();
                targets.dedup();
                targets
            }
        }
    }

    /// Flat `{row}_{field}` update map for the caller to merge.
    pub fn update_rows(&self, update: &RowUpdate) -> FieldUpdates {
        self.update_rows_with(&update.range, |_, _| update.updates.clone())
    }

    /// Like [`update_rows`](Self::update_rows) but computes each row's updates
    /// from its index and current values.
    pub fn update_rows_with<F>(&self, range: &RowRange, mut updates_for: F) -> FieldUpdates
    where
        F: FnMut(usize, Option<&RowValues>) -> IndexMap<String, FieldUpdate>,
    {
        let mut updates = FieldUpdates::new();
        for row in self.target_rows(range) {
            for (field, update) in updates_for(row, self.rows.get(row)) {
                updates.insert(self.key_at(row, field), update);
            }
        }
        updates
    }

    pub fn update_next_row(&self, field: &str, value: FieldValue) -> FieldUpdates {
        let next = self.info.current_row + 1;
        self.update_rows(&RowUpdate {
            range: RowRange::Interval {
                from: Some(next),
                to: Some(next + 1),
            },
            updates: IndexMap::from([(field.to_string(), FieldUpdate::value(value))]),
        })
    }

    pub fn update_next_rows(&self, field: &str, value: FieldValue) -> FieldUpdates {
        self.update_rows(&RowUpdate {
            range: RowRange::Following,
            updates: IndexMap::from([(field.to_string(), FieldUpdate::value(value))]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(current_row: usize) -> RowContext {
        let rows: Vec<RowValues> = (0..4)
            .map(|row| IndexMap::from([("amount".to_string(), json!(row * 10))]))
            .collect();
        RowContext::build(RowInfo::new(Some("lines".to_string()), current_row, 4), rows)
    }

    #[test]
    fn test_row_info_is_last() {
        assert!(RowInfo::new(None, 2, 3).is_last);
        assert!(!RowInfo::new(None, 1, 3).is_last);
    }

    #[test]
    fn test_row_values_by_offset() {
        let ctx = context(1);
        assert_eq!(ctx.row_value(0, "amount"), Some(&json!(10)));
        assert_eq!(ctx.row_value(1, "amount"), Some(&json!(20)));
        assert_eq!(ctx.row_value(-1, "amount"), Some(&json!(0)));
        assert_eq!(ctx.row_values(-2), None);
        assert_eq!(ctx.row_values(3), None);
    }

    #[test]
    fn test_update_rows_defaults_to_following_rows() {
        let ctx = context(1);
        let updates = ctx.update_rows(&RowUpdate {
            range: RowRange::default(),
            updates: IndexMap::from([("amount".to_string(), FieldUpdate::clear())]),
        });

        let keys: Vec<FieldKey> = updates.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                FieldKey::row("lines", 2, "amount"),
                FieldKey::row("lines", 3, "amount")
            ]
        );
    }

    #[test]
    fn test_update_rows_explicit_list_drops_out_of_range() {
        let ctx = context(0);
        let updates = ctx.update_rows(&RowUpdate {
            range: RowRange::Rows(vec![0, 2, 9]),
            updates: IndexMap::from([("amount".to_string(), FieldUpdate::value(json!(1)))]),
        });
        assert_eq!(updates.len(), 2);
        assert!(updates.contains_key(&FieldKey::row("lines", 0, "amount")));
        assert!(updates.contains_key(&FieldKey::row("lines", 2, "amount")));
    }

    #[test]
    fn test_update_next_row_is_clamped() {
        let updates = context(3).update_next_row("amount", json!(5));
        assert!(updates.is_empty());

        let updates = context(2).update_next_row("amount", json!(5));
        assert_eq!(
            updates.get(&FieldKey::row("lines", 3, "amount")),
            Some(&FieldUpdate::value(json!(5)))
        );
    }

    #[test]
    fn test_update_rows_with_reads_row_values() {
        let ctx = context(0);
        let updates = ctx.update_rows_with(&RowRange::Following, |row, values| {
            let doubled = values
                .and_then(|v| v.get("amount"))
                .and_then(|v| v.as_i64())
                .unwrap_or_default()
                * 2;
            IndexMap::from([("amount".to_string(), FieldUpdate::value(json!(doubled + row as i64)))])
        });
        assert_eq!(
            updates[&FieldKey::row("lines", 3, "amount")],
            FieldUpdate::value(json!(63))
        );
    }
}
