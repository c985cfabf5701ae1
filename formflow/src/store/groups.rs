//! Dynamic groups: ordered rows of one field template.
//!
//! Row keys stay contiguous in `[0, total_rows)`. Inserting or removing a row
//! moves values, field states, row-specific registrations and request state of
//! the following rows along with it.

use super::Store;
use crate::error::{StoreError, StoreResult};
use crate::notify::FormEvent;
use crate::row::{RowContext, RowValues};
use shared::{FieldKey, GroupId};

impl Store {
    /// Declares `group` with its initial rows, replacing any earlier rows.
    ///
    /// The rows also become the group's reset state.
    pub fn register_group(&self, group: impl Into<GroupId>, rows: Vec<RowValues>) {
        let group = group.into();
        let mut state = self.state();
        if state.groups.contains_key(&group) {
            log::warn!("[store] group `{}` registered twice, keeping the latest rows", group);
        }

        let previous = state.row_count(&group);
        let total = rows.len();
        state.shift_group(&group, |row| (row < total).then_some(row));

        let in_group = |key: &FieldKey| key.group.as_ref() == Some(&group) && key.row.is_some();
        state.initial_values.retain(|key, _| !in_group(key));
        let leftovers: Vec<FieldKey> = state.fields.keys().filter(|key| in_group(key)).cloned().collect();

        for (row, values) in rows.iter().enumerate() {
            for (field, value) in values {
                let key = FieldKey::row(group.clone(), row, field.clone());
                state.initial_values.insert(key, value.clone());
            }
        }
        for key in leftovers {
            if !state.initial_values.contains_key(&key) {
                state.write_value(&key, None);
            }
        }
        let fresh: Vec<_> = state
            .initial_values
            .iter()
            .filter(|(key, _)| in_group(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in fresh {
            state.write_value(&key, Some(value));
        }
        state.groups.insert(group.clone(), rows.len());
        state.initial_groups.insert(group.clone(), rows.len());
        state.refresh_row_infos(&group);

        if previous != rows.len() {
            log::debug!("[store] group `{}` now has {} row(s)", group, rows.len());
        }
        state.notifier.publish_form(FormEvent::RowsChanged {
            group,
            total: rows.len(),
        });
    }

    /// Appends a row and returns its index.
    pub fn add_row(&self, group: impl Into<GroupId>, values: RowValues) -> StoreResult<usize> {
        let group = group.into();
        let total = self.group_size(&group)?;
        self.insert_row(group, total, values)?;
        Ok(total)
    }

    /// Inserts a row at `index`; rows from `index` on move one down.
    pub fn insert_row(&self, group: impl Into<GroupId>, index: usize, values: RowValues) -> StoreResult<()> {
        let group = group.into();
        let (stale, independent) = {
            let mut state = self.state();
            let total = state
                .groups
                .get(&group)
                .copied()
                .ok_or_else(|| StoreError::UnknownGroup(group.clone()))?;
            if index > total {
                return Err(StoreError::RowOutOfRange {
                    group,
                    row: index,
                    total,
                });
            }

            state.shift_group(&group, |row| Some(if row >= index { row + 1 } else { row }));
            for (field, value) in values {
                state.write_value(&FieldKey::row(group.clone(), index, field), Some(value));
            }
            state.groups.insert(group.clone(), total + 1);
            state.refresh_row_infos(&group);
            state.notifier.publish_form(FormEvent::RowsChanged {
                group: group.clone(),
                total: total + 1,
            });

            let independent: Vec<FieldKey> = if state.init_settled() {
                state
                    .requests
                    .independent_keys(&state.groups)
                    .into_iter()
                    .filter(|key| key.group.as_ref() == Some(&group) && key.row == Some(index))
                    .collect()
            } else {
                Vec::new()
            };
            (stale_keys(&state, &group), independent)
        };

        self.settle_moved_rows(stale);
        for key in independent {
            self.dispatch_logged(key);
        }
        Ok(())
    }

    /// Removes the row at `index` and returns its values; following rows move up.
    pub fn remove_row(&self, group: impl Into<GroupId>, index: usize) -> StoreResult<RowValues> {
        let group = group.into();
        let (removed, stale) = {
            let mut state = self.state();
            let total = state
                .groups
                .get(&group)
                .copied()
                .ok_or_else(|| StoreError::UnknownGroup(group.clone()))?;
            if index >= total {
                return Err(StoreError::RowOutOfRange {
                    group,
                    row: index,
                    total,
                });
            }

            let removed = state
                .group_rows(&group)
                .into_iter()
                .nth(index)
                .unwrap_or_default();
            state.shift_group(&group, |row| match row {
                row if row == index => None,
                row if row > index => Some(row - 1),
                row => Some(row),
            });
            state.groups.insert(group.clone(), total - 1);
            state.refresh_row_infos(&group);
            state.notifier.publish_form(FormEvent::RowsChanged {
                group: group.clone(),
                total: total - 1,
            });
            (removed, stale_keys(&state, &group))
        };

        self.settle_moved_rows(stale);
        Ok(removed)
    }

    pub fn row_count(&self, group: &str) -> usize {
        self.state().row_count(group)
    }

    /// Current values of every row of `group`.
    pub fn group_rows(&self, group: &str) -> Vec<RowValues> {
        self.state().group_rows(group)
    }

    /// Row snapshot of `key`, rebuilt from the current layout.
    pub fn row_context(&self, key: impl Into<FieldKey>) -> Option<RowContext> {
        self.state().row_context(&key.into())
    }

    fn group_size(&self, group: &GroupId) -> StoreResult<usize> {
        self.state()
            .groups
            .get(group)
            .copied()
            .ok_or_else(|| StoreError::UnknownGroup(group.clone()))
    }

    /// In-flight work on moved rows lost its generation; start it again.
    fn settle_moved_rows(&self, stale: StaleRows) {
        self.revalidate_stale(stale.validating);
        for key in stale.loading {
            self.dispatch_logged(key);
        }
    }
}

#[derive(Default)]
struct StaleRows {
    validating: Vec<FieldKey>,
    loading: Vec<FieldKey>,
}

fn stale_keys(state: &super::StoreState, group: &GroupId) -> StaleRows {
    let in_group = |key: &FieldKey| key.group.as_ref() == Some(group) && key.row.is_some();
    StaleRows {
        validating: state
            .fields
            .iter()
            .filter(|(key, field)| in_group(key) && field.validating)
            .map(|(key, _)| key.clone())
            .collect(),
        loading: state
            .requests
            .states
            .iter()
            .filter(|(key, request)| in_group(key) && request.loading)
            .map(|(key, _)| key.clone())
            .collect(),
    }
}
