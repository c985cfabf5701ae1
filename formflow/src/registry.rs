//! Field dependency graphs.
//!
//! Edges point from a source field to the fields that must react when the
//! source changes. Edges registered on template keys apply to every row of a
//! group and are instantiated at the changing row on lookup.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use shared::{FieldKey, GroupId};

/// Configuration registered on `key`, falling back to its template.
pub fn lookup<'a, V>(map: &'a IndexMap<FieldKey, V>, key: &FieldKey) -> Option<&'a V> {
    map.get(key)
        .or_else(|| key.template_key().and_then(|template| map.get(&template)))
}

/// Keys a field id named by `owner` can refer to: the field in the owner's
/// row and, for fields inside a group, the form-level field of that name.
pub fn referenced_keys(owner: &FieldKey, id: &str) -> Vec<FieldKey> {
    let sibling = owner.sibling(id);
    if is_form_level(owner) {
        vec![sibling]
    } else {
        vec![sibling, FieldKey::new(id)]
    }
}

pub fn is_form_level(key: &FieldKey) -> bool {
    key.group.is_none() && key.row.is_none()
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: IndexMap<FieldKey, IndexSet<FieldKey>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, source: FieldKey, dependent: FieldKey) -> bool {
        self.edges.entry(source).or_default().insert(dependent)
    }

    pub fn remove_edge(&mut self, source: &FieldKey, dependent: &FieldKey) -> bool {
        let Some(dependents) = self.edges.get_mut(source) else {
            return false;
        };
        let removed = dependents.shift_remove(dependent);
        if dependents.is_empty() {
            self.edges.shift_remove(source);
        }
        removed
    }

    /// Drops every edge that ends at `dependent`.
    pub fn remove_dependent(&mut self, dependent: &FieldKey) {
        self.edges.retain(|_, dependents| {
            dependents.shift_remove(dependent);
            !dependents.is_empty()
        });
    }

    /// Fields to notify when `source` changes, concrete edges first.
    pub fn dependents_of(&self, source: &FieldKey) -> Vec<FieldKey> {
        let mut found: IndexSet<FieldKey> = self
            .edges
            .get(source)
            .into_iter()
            .flatten()
            .cloned()
            .collect();

        if let (Some(template), Some(row)) = (source.template_key(), source.row) {
            for dependent in self.edges.get(&template).into_iter().flatten() {
                if dependent.is_template() {
                    found.insert(dependent.at_row(row));
                } else {
                    found.insert(dependent.clone());
                }
            }
        }

        found.shift_remove(source);
        found.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Rewrites every key through `remap`; keys mapped to `None` lose their edges.
    pub fn remap(&mut self, remap: impl Fn(&FieldKey) -> Option<FieldKey>) {
        let edges = std::mem::take(&mut self.edges);
        for (source, dependents) in edges {
            let Some(source) = remap(&source) else {
                continue;
            };
            for dependent in dependents {
                if let Some(dependent) = remap(&dependent) {
                    self.add_edge(source.clone(), dependent);
                }
            }
        }
    }
}

/// Row-index rewrite for one group: keys of that group pass through `shift`,
/// everything else is kept as is.
pub fn shift_group_key(
    key: &FieldKey,
    group: &GroupId,
    shift: impl Fn(usize) -> Option<usize>,
) -> Option<FieldKey> {
    match (key.group.as_ref(), key.row) {
        (Some(owner), Some(row)) if owner == group => shift(row).map(|row| key.at_row(row)),
        _ => Some(key.clone()),
    }
}

/// Re-keys a map after rows of `group` moved. Entries of removed rows are dropped.
pub fn shift_group_map<V>(
    map: &mut IndexMap<FieldKey, V>,
    group: &GroupId,
    shift: impl Fn(usize) -> Option<usize>,
) {
    let entries = std::mem::take(map);
    for (key, value) in entries {
        if let Some(key) = shift_group_key(&key, group, &shift) {
            map.insert(key, value);
        }
    }
}

/// "When this field changes, re-validate these", optionally on a neighbouring row.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidateEffect {
    /// Field ids to re-validate. Empty means the changing field itself.
    #[serde(default)]
    pub affect_fields: Vec<String>,
    #[serde(default)]
    pub effect_next_row: bool,
    #[serde(default)]
    pub effect_previous_row: bool,
}

impl ValidateEffect {
    pub fn same_row<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            affect_fields: fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn next_row() -> Self {
        Self {
            effect_next_row: true,
            ..Self::default()
        }
    }

    pub fn previous_row() -> Self {
        Self {
            effect_previous_row: true,
            ..Self::default()
        }
    }

    pub fn with_affect_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affect_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Concrete keys to re-validate when `source` changes.
    ///
    /// `group` and `row` locate the source, from its key or from a registered
    /// row info. Relative-row effects resolve to nothing without a row.
    pub fn targets(&self, source: &FieldKey, group: Option<&GroupId>, row: Option<usize>) -> Vec<FieldKey> {
        let rows: Vec<Option<usize>> = if self.effect_next_row || self.effect_previous_row {
            let mut rows = Vec::new();
            if let Some(row) = row {
                if self.effect_previous_row {
                    if let Some(previous) = row.checked_sub(1) {
                        rows.push(Some(previous));
                    }
                }
                if self.effect_next_row {
                    rows.push(Some(row + 1));
                }
            }
            rows
        } else {
            vec![row]
        };

        let fields: Vec<&str> = if self.affect_fields.is_empty() {
            vec![source.field.as_str()]
        } else {
            self.affect_fields.iter().map(String::as_str).collect()
        };

        let located = FieldKey {
            group: group.cloned(),
            row,
            field: source.field.clone(),
        };
        rows.into_iter()
            .flat_map(|row| {
                fields.iter().map(move |field| FieldKey {
                    group: group.cloned(),
                    row,
                    field: field.to_string(),
                })
            })
            .filter(|target| target != source && *target != located)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_dependents_instantiate_at_row() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(
            FieldKey::template("lines", "qty"),
            FieldKey::template("lines", "total"),
        );
        graph.add_edge(FieldKey::template("lines", "qty"), FieldKey::new("grand_total"));

        assert_eq!(
            graph.dependents_of(&FieldKey::row("lines", 4, "qty")),
            vec![FieldKey::row("lines", 4, "total"), FieldKey::new("grand_total")]
        );
        assert!(graph.dependents_of(&FieldKey::row("other", 4, "qty")).is_empty());
    }

    #[test]
    fn test_remove_dependent_prunes_empty_sources() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(FieldKey::new("a"), FieldKey::new("b"));
        graph.remove_dependent(&FieldKey::new("b"));
        assert!(graph.is_empty());
        assert!(!graph.remove_edge(&FieldKey::new("a"), &FieldKey::new("b")));
    }

    #[test]
    fn test_remap_shifts_rows_and_drops_removed() {
        let group = "lines".to_string();
        let mut graph = DependencyGraph::new();
        graph.add_edge(FieldKey::row("lines", 0, "a"), FieldKey::row("lines", 1, "b"));
        graph.add_edge(FieldKey::row("lines", 2, "a"), FieldKey::new("sum"));

        // Row 1 removed.
        graph.remap(|key| {
            shift_group_key(key, &group, |row| match row {
                1 => None,
                row if row > 1 => Some(row - 1),
                row => Some(row),
            })
        });

        assert!(graph.dependents_of(&FieldKey::row("lines", 0, "a")).is_empty());
        assert_eq!(
            graph.dependents_of(&FieldKey::row("lines", 1, "a")),
            vec![FieldKey::new("sum")]
        );
    }

    #[test]
    fn test_validate_effect_targets() {
        let source = FieldKey::row("limits", 0, "threshold");

        let limits = "limits".to_string();

        assert_eq!(
            ValidateEffect::next_row().targets(&source, Some(&limits), Some(0)),
            vec![FieldKey::row("limits", 1, "threshold")]
        );
        assert!(ValidateEffect::previous_row().targets(&source, Some(&limits), Some(0)).is_empty());
        assert!(ValidateEffect::next_row().targets(&FieldKey::new("x"), None, None).is_empty());
        assert_eq!(
            ValidateEffect::same_row(["min", "max"]).targets(&source, Some(&limits), Some(0)),
            vec![FieldKey::row("limits", 0, "min"), FieldKey::row("limits", 0, "max")]
        );
    }

    #[test]
    fn test_validate_effect_targets_follow_row_info_group() {
        let plain = FieldKey::new("t");
        let limits = "limits".to_string();

        assert_eq!(
            ValidateEffect::next_row().targets(&plain, Some(&limits), Some(0)),
            vec![FieldKey::row("limits", 1, "t")]
        );
        assert_eq!(
            ValidateEffect::previous_row().targets(&plain, Some(&limits), Some(1)),
            vec![FieldKey::row("limits", 0, "t")]
        );
        assert!(ValidateEffect::same_row(["t"]).targets(&plain, Some(&limits), Some(1)).is_empty());
    }

    #[test]
    fn test_referenced_keys_reach_form_level_fields() {
        assert_eq!(
            referenced_keys(&FieldKey::template("lines", "product"), "country"),
            vec![FieldKey::template("lines", "country"), FieldKey::new("country")]
        );
        assert_eq!(
            referenced_keys(&FieldKey::new("city"), "country"),
            vec![FieldKey::new("country")]
        );
    }

    #[test]
    fn test_lookup_falls_back_to_template() {
        let mut map = IndexMap::new();
        map.insert(FieldKey::template("lines", "qty"), "template");
        map.insert(FieldKey::row("lines", 2, "qty"), "row two");

        assert_eq!(lookup(&map, &FieldKey::row("lines", 2, "qty")), Some(&"row two"));
        assert_eq!(lookup(&map, &FieldKey::row("lines", 7, "qty")), Some(&"template"));
        assert_eq!(lookup(&map, &FieldKey::new("qty")), None);
    }
}
