//! ModelInstance - a materialized row bound to a model
//!
//! Instances come from two places: a fresh creation state (`is_new`) or a
//! database row. Setters track dirty fields for `save`. Join rows are
//! folded into instances by an explicit grouping pass keyed by root id,
//! so correctness does not depend on the input row order.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::error::{OrmError, OrmResult};
use crate::property::{AssociationKind, PropertySet};

/// A database row as returned by the datastore: column name to value.
pub type Row = Map<String, Value>;

/// Separator between an association alias and its column in join rows
/// (`b$name` carries column `name` of association `b`).
pub const ALIAS_SEPARATOR: char = '$';

/// Resolved association data on an instance.
#[derive(Debug, Clone)]
pub enum Related {
    One(Option<Box<ModelInstance>>),
    Many(Vec<ModelInstance>),
}

impl Related {
    pub fn as_one(&self) -> Option<&ModelInstance> {
        match self {
            Related::One(inner) => inner.as_deref(),
            Related::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> &[ModelInstance] {
        match self {
            Related::Many(items) => items,
            Related::One(_) => &[],
        }
    }
}

/// A materialized row bound to a model.
#[derive(Debug, Clone)]
pub struct ModelInstance {
    model: String,
    values: Map<String, Value>,
    related: HashMap<String, Related>,
    dirty: HashSet<String>,
    is_new: bool,
    is_partial: bool,
    is_shallow: bool,
}

impl ModelInstance {
    /// Fresh creation state, not yet persisted.
    pub fn fresh(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            values: Map::new(),
            related: HashMap::new(),
            dirty: HashSet::new(),
            is_new: true,
            is_partial: false,
            is_shallow: false,
        }
    }

    /// Instance materialized from a database row.
    pub fn from_row(model: impl Into<String>, row: Map<String, Value>) -> Self {
        Self {
            model: model.into(),
            values: row,
            related: HashMap::new(),
            dirty: HashSet::new(),
            is_new: false,
            is_partial: false,
            is_shallow: false,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> Option<Value> {
        self.values.get("id").filter(|v| !v.is_null()).cloned()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Set a field value and mark it dirty for the next `save`.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.dirty.insert(name.clone());
        self.values.insert(name, value);
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Partial instances (create/update/remove results) never auto-resolve
    /// associations.
    pub fn is_partial(&self) -> bool {
        self.is_partial
    }

    pub fn is_shallow(&self) -> bool {
        self.is_shallow
    }

    pub fn mark_partial(&mut self) {
        self.is_partial = true;
    }

    pub fn mark_shallow(&mut self) {
        self.is_shallow = true;
    }

    pub(crate) fn mark_saved(&mut self) {
        self.is_new = false;
        self.dirty.clear();
    }

    /// Names of fields changed since materialization.
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(|s| s.as_str())
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Set-map of the dirty fields, for the update path.
    pub fn dirty_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for name in &self.dirty {
            if let Some(value) = self.values.get(name) {
                map.insert(name.clone(), value.clone());
            }
        }
        map
    }

    /// Loaded association data, if any.
    pub fn related(&self, name: &str) -> Option<&Related> {
        self.related.get(name)
    }

    pub fn set_related(&mut self, name: impl Into<String>, related: Related) {
        self.related.insert(name.into(), related);
    }

    pub(crate) fn related_mut(&mut self) -> &mut HashMap<String, Related> {
        &mut self.related
    }

    /// JSON projection honoring selectability and shallow mode. Shallow
    /// instances render to-one associations as their ids only.
    pub fn to_json(&self, properties: &PropertySet) -> Value {
        let mut out = Map::new();
        for property in properties.iter() {
            if !property.is_selectable() && self.related.get(property.name()).is_none() {
                continue;
            }
            let name = property.name();
            if let Some(related) = self.related.get(name) {
                let value = match related {
                    Related::One(Some(inner)) => {
                        if self.is_shallow {
                            inner.id().unwrap_or(Value::Null)
                        } else {
                            Value::Object(inner.values.clone())
                        }
                    }
                    Related::One(None) => Value::Null,
                    Related::Many(items) => Value::Array(
                        items
                            .iter()
                            .map(|i| {
                                if self.is_shallow {
                                    i.id().unwrap_or(Value::Null)
                                } else {
                                    Value::Object(i.values.clone())
                                }
                            })
                            .collect(),
                    ),
                };
                out.insert(name.to_string(), value);
            } else if let Some(column) = property.column_name() {
                if let Some(value) = self.values.get(&column) {
                    out.insert(name.to_string(), value.clone());
                }
            }
        }
        Value::Object(out)
    }
}

/// Fold join rows into instances.
///
/// Root columns are unprefixed; columns belonging to a joined association
/// arrive as `<assoc>$<column>`. Rows sharing a root id group into one
/// instance whose to-many collections accumulate distinct children. The
/// grouping pass keys an order-preserving map by root id, so duplicate
/// roots fold correctly even when the input is unordered; first-seen
/// order is kept.
pub fn fold_rows(
    model: &str,
    properties: &PropertySet,
    registry_kinds: &HashMap<String, AssociationKind>,
    rows: Vec<Row>,
) -> OrmResult<Vec<ModelInstance>> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, ModelInstance> = HashMap::new();
    // child ids already folded, per (root, association)
    let mut seen_children: HashMap<(String, String), HashSet<String>> = HashMap::new();

    for row in rows {
        let mut root = Map::new();
        let mut nested: HashMap<String, Map<String, Value>> = HashMap::new();
        for (column, value) in row {
            match column.split_once(ALIAS_SEPARATOR) {
                Some((alias, inner)) => {
                    nested
                        .entry(alias.to_string())
                        .or_default()
                        .insert(inner.to_string(), value);
                }
                None => {
                    root.insert(column, value);
                }
            }
        }

        let root_id = root
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OrmError::Execution("join row is missing a root id".to_string()))?
            .to_string();

        let instance = grouped.entry(root_id.clone()).or_insert_with(|| {
            order.push(root_id.clone());
            ModelInstance::from_row(model, root.clone())
        });

        for (alias, columns) in nested {
            let kind = match registry_kinds.get(&alias) {
                Some(kind) => *kind,
                None => continue,
            };
            let child_id = columns.get("id").and_then(|v| v.as_str()).map(String::from);
            let child = child_id.as_ref().map(|_| {
                let target = properties
                    .get(&alias)
                    .and_then(|p| p.associated_model())
                    .unwrap_or(&alias)
                    .to_string();
                ModelInstance::from_row(target, columns)
            });

            if kind.is_collection() {
                let entry = instance
                    .related_mut()
                    .entry(alias.clone())
                    .or_insert_with(|| Related::Many(Vec::new()));
                if let (Some(child), Some(child_id)) = (child, child_id) {
                    let seen = seen_children
                        .entry((root_id.clone(), alias.clone()))
                        .or_default();
                    if seen.insert(child_id) {
                        if let Related::Many(items) = entry {
                            items.push(child);
                        }
                    }
                }
            } else {
                instance
                    .related_mut()
                    .entry(alias)
                    .or_insert_with(|| Related::One(child.map(Box::new)));
            }
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for id in order {
        if let Some(instance) = grouped.remove(&id) {
            out.push(instance);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Modifier, Property, PropertyKind};
    use serde_json::json;

    fn parent_props() -> PropertySet {
        PropertySet::from_properties(vec![
            Property::new("name", PropertyKind::Text, vec![]).unwrap(),
            Property::new("children", PropertyKind::Uuid, vec![Modifier::HasMany(
                "child".to_string(),
            )])
            .unwrap(),
        ])
        .unwrap()
    }

    fn kinds() -> HashMap<String, AssociationKind> {
        let mut kinds = HashMap::new();
        kinds.insert("children".to_string(), AssociationKind::HasMany);
        kinds
    }

    fn join_row(root_id: &str, child_id: &str) -> Row {
        json!({
            "id": root_id,
            "name": "parent",
            "children$id": child_id,
            "children$name": format!("child-{}", child_id),
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn n_join_rows_fold_into_one_parent_with_n_children() {
        let rows = vec![join_row("p1", "c1"), join_row("p1", "c2"), join_row("p1", "c3")];
        let folded = fold_rows("parent", &parent_props(), &kinds(), rows).unwrap();
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].related("children").unwrap().as_many().len(), 3);
    }

    #[test]
    fn folding_survives_unordered_input() {
        // interleaved parents would defeat adjacency-based consumption
        let rows = vec![
            join_row("p1", "c1"),
            join_row("p2", "c9"),
            join_row("p1", "c2"),
        ];
        let folded = fold_rows("parent", &parent_props(), &kinds(), rows).unwrap();
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].related("children").unwrap().as_many().len(), 2);
        assert_eq!(folded[1].related("children").unwrap().as_many().len(), 1);
        // first-seen order is kept
        assert_eq!(folded[0].id(), Some(json!("p1")));
    }

    #[test]
    fn duplicate_children_fold_once() {
        let rows = vec![join_row("p1", "c1"), join_row("p1", "c1")];
        let folded = fold_rows("parent", &parent_props(), &kinds(), rows).unwrap();
        assert_eq!(folded[0].related("children").unwrap().as_many().len(), 1);
    }

    #[test]
    fn null_child_columns_leave_empty_collection() {
        let row = json!({ "id": "p1", "name": "parent", "children$id": null })
            .as_object()
            .unwrap()
            .clone();
        let folded = fold_rows("parent", &parent_props(), &kinds(), vec![row]).unwrap();
        assert_eq!(folded[0].related("children").unwrap().as_many().len(), 0);
    }

    #[test]
    fn shallow_projection_renders_associations_as_ids() {
        let mut parent = ModelInstance::from_row(
            "parent",
            json!({ "id": "p1", "name": "parent" }).as_object().unwrap().clone(),
        );
        let child = ModelInstance::from_row(
            "child",
            json!({ "id": "c1", "name": "kid" }).as_object().unwrap().clone(),
        );
        parent.set_related("children", Related::Many(vec![child]));

        let full = parent.to_json(&parent_props());
        assert_eq!(full["children"][0]["name"], json!("kid"));

        parent.mark_shallow();
        let shallow = parent.to_json(&parent_props());
        assert_eq!(shallow["children"], json!(["c1"]));
    }

    #[test]
    fn dirty_tracking_drives_save_maps() {
        let mut instance = ModelInstance::fresh("user");
        assert!(instance.is_new());
        instance.set("name", json!("Aart"));
        assert!(instance.is_dirty());
        assert_eq!(instance.dirty_map().get("name"), Some(&json!("Aart")));
        instance.mark_saved();
        assert!(!instance.is_dirty());
        assert!(!instance.is_new());
    }
}
