//! Models registry
//!
//! Process-wide map of model name to model, constructed explicitly at
//! startup and passed by reference to every component that needs model
//! lookup. Mutated only while defining the schema and during migrations,
//! which run as a single-writer deploy-time phase.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::property::{AssociationKind, Property, PropertySet};

/// Explicit model registry; share via `Arc`.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<Model>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model from its declared properties. The name becomes
    /// the relation binding; registering twice is a schema error.
    pub fn define(&self, name: &str, properties: Vec<Property>) -> OrmResult<Arc<Model>> {
        crate::security::validate_identifier(name)?;
        let mut models = self.models.write().expect("model registry poisoned");
        if models.contains_key(name) {
            return Err(OrmError::Schema(format!(
                "model '{}' is already defined",
                name
            )));
        }
        let model = Arc::new(Model::new(name, PropertySet::from_properties(properties)?));
        models.insert(name.to_string(), Arc::clone(&model));
        Ok(model)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Model>> {
        self.models
            .read()
            .expect("model registry poisoned")
            .get(name)
            .cloned()
    }

    /// Look up a model, failing with a schema error when unknown.
    pub fn require(&self, name: &str) -> OrmResult<Arc<Model>> {
        self.get(name)
            .ok_or_else(|| OrmError::Schema(format!("model '{}' is not defined", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models
            .read()
            .expect("model registry poisoned")
            .contains_key(name)
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .read()
            .expect("model registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The unique model carrying an authenticating property, if any.
    pub fn authenticator(&self) -> Option<String> {
        self.models
            .read()
            .expect("model registry poisoned")
            .iter()
            .find(|(_, model)| model.properties().authenticator().is_some())
            .map(|(name, _)| name.clone())
    }

    /// Drop a model from the registry (the physical relation is the
    /// caller's concern).
    pub fn remove(&self, name: &str) -> OrmResult<()> {
        let mut models = self.models.write().expect("model registry poisoned");
        models
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| OrmError::Schema(format!("model '{}' is not defined", name)))
    }

    /// Add a property to a registered model.
    pub fn add_property(&self, model: &str, property: Property) -> OrmResult<()> {
        let model = self.require(model)?;
        model.mutate_properties(|props| props.insert(property))
    }

    /// Redefine an existing property's kind and modifiers in place.
    /// Associations cannot be redefined this way; remove the property and
    /// add the new declaration instead.
    pub fn change_property(&self, model: &str, property: Property) -> OrmResult<()> {
        if property.is_association() {
            return Err(OrmError::Schema(format!(
                "association '{}' cannot be redefined in place",
                property.name()
            )));
        }
        let model = self.require(model)?;
        model.mutate_properties(|props| {
            if props.require(property.name())?.is_association() {
                return Err(OrmError::Schema(format!(
                    "association '{}' cannot be redefined in place",
                    property.name()
                )));
            }
            props.replace(property)?;
            Ok(())
        })
    }

    /// Remove a property from a registered model.
    ///
    /// Association removal is symmetric and explicit: removing one side
    /// always removes the paired back-reference property in the target
    /// model in the same call.
    pub fn remove_property(&self, model_name: &str, property_name: &str) -> OrmResult<Property> {
        let model = self.require(model_name)?;
        let removed = model.mutate_properties(|props| props.remove(property_name))?;

        if let Some(target_name) = removed.associated_model() {
            if let Some(target) = self.get(target_name) {
                let paired: Option<String> = target
                    .properties()
                    .associations()
                    .find(|p| p.associated_model() == Some(model_name))
                    .map(|p| p.name().to_string());
                if let Some(paired) = paired {
                    target.mutate_properties(|props| props.remove(&paired))?;
                }
            }
        }
        Ok(removed)
    }

    /// Check that every association property has a resolvable target.
    /// Called at schema-build time.
    pub fn validate_associations(&self) -> OrmResult<()> {
        let models = self.models.read().expect("model registry poisoned");
        for (name, model) in models.iter() {
            for property in model.properties().associations() {
                let target = property.associated_model().unwrap_or_default();
                if !models.contains_key(target) {
                    return Err(OrmError::Schema(format!(
                        "association '{}.{}' targets undefined model '{}'",
                        name,
                        property.name(),
                        target
                    )));
                }
                if let Some(through) = property.through_model() {
                    if !models.contains_key(through) {
                        return Err(OrmError::Schema(format!(
                            "association '{}.{}' goes through undefined model '{}'",
                            name,
                            property.name(),
                            through
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Association kinds declared on a model, keyed by property name.
    /// Used by the row-folding pass.
    pub fn association_kinds(&self, model: &str) -> HashMap<String, AssociationKind> {
        let mut kinds = HashMap::new();
        if let Some(model) = self.get(model) {
            for property in model.properties().associations() {
                if let Some(assoc) = property.association() {
                    kinds.insert(property.name().to_string(), assoc.kind);
                }
            }
        }
        kinds
    }

    /// Snapshot of every model's property set, for rollback when a
    /// migration's task list aborts mid-apply.
    pub fn snapshot(&self) -> HashMap<String, PropertySet> {
        self.models
            .read()
            .expect("model registry poisoned")
            .iter()
            .map(|(name, model)| (name.clone(), model.properties()))
            .collect()
    }

    /// Restore a previously taken snapshot. Models present in the
    /// snapshot get their property sets back; models defined since are
    /// dropped.
    pub fn restore(&self, snapshot: HashMap<String, PropertySet>) {
        let mut models = self.models.write().expect("model registry poisoned");
        models.retain(|name, _| snapshot.contains_key(name));
        for (name, properties) in snapshot {
            match models.get(&name) {
                Some(model) => model.replace_properties(properties),
                None => {
                    let model = Arc::new(Model::with_properties(&name, properties));
                    models.insert(name, model);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Modifier, PropertyKind};

    fn text(name: &str) -> Property {
        Property::new(name, PropertyKind::Text, vec![]).unwrap()
    }

    #[test]
    fn define_and_lookup() {
        let registry = ModelRegistry::new();
        registry.define("user", vec![text("name")]).unwrap();
        assert!(registry.get("user").is_some());
        assert!(registry.require("ghost").is_err());
        assert!(registry.define("user", vec![]).is_err());
    }

    #[test]
    fn authenticator_lookup() {
        let registry = ModelRegistry::new();
        registry.define("post", vec![text("title")]).unwrap();
        assert_eq!(registry.authenticator(), None);
        registry
            .define(
                "user",
                vec![Property::new("email", PropertyKind::Text, vec![Modifier::Authenticate])
                    .unwrap()],
            )
            .unwrap();
        assert_eq!(registry.authenticator(), Some("user".to_string()));
    }

    #[test]
    fn association_validation_catches_dangling_targets() {
        let registry = ModelRegistry::new();
        registry
            .define(
                "post",
                vec![Property::new("author", PropertyKind::Uuid, vec![Modifier::BelongsTo(
                    "user".to_string(),
                )])
                .unwrap()],
            )
            .unwrap();
        assert!(registry.validate_associations().is_err());
        registry.define("user", vec![text("name")]).unwrap();
        assert!(registry.validate_associations().is_ok());
    }

    #[test]
    fn association_removal_is_symmetric() {
        let registry = ModelRegistry::new();
        registry
            .define(
                "a",
                vec![Property::new("b", PropertyKind::Uuid, vec![Modifier::BelongsTo(
                    "b".to_string(),
                )])
                .unwrap()],
            )
            .unwrap();
        registry
            .define(
                "b",
                vec![Property::new("a", PropertyKind::Uuid, vec![Modifier::HasOne(
                    "a".to_string(),
                )])
                .unwrap()],
            )
            .unwrap();

        registry.remove_property("a", "b").unwrap();
        assert!(!registry.get("a").unwrap().properties().contains("b"));
        // paired side removed in the same call
        assert!(!registry.get("b").unwrap().properties().contains("a"));
    }

    #[test]
    fn change_property_redefines_the_kind_in_place() {
        let registry = ModelRegistry::new();
        registry
            .define(
                "user",
                vec![Property::new("age", PropertyKind::Integer, vec![]).unwrap()],
            )
            .unwrap();

        registry
            .change_property(
                "user",
                Property::new("age", PropertyKind::Float, vec![Modifier::Required]).unwrap(),
            )
            .unwrap();
        let model = registry.get("user").unwrap();
        let age = model.properties();
        let age = age.get("age").unwrap().clone();
        assert_eq!(age.kind().sql_type(), "DOUBLE PRECISION");
        assert!(age.options().required);

        let missing = registry
            .change_property("user", Property::new("ghost", PropertyKind::Text, vec![]).unwrap());
        assert!(missing.is_err());
    }

    #[test]
    fn associations_cannot_be_redefined_in_place() {
        let registry = ModelRegistry::new();
        registry
            .define(
                "post",
                vec![Property::new("author", PropertyKind::Uuid, vec![Modifier::BelongsTo(
                    "user".to_string(),
                )])
                .unwrap()],
            )
            .unwrap();
        let err = registry
            .change_property("post", Property::new("author", PropertyKind::Text, vec![]).unwrap())
            .unwrap_err();
        assert!(matches!(err, OrmError::Schema(_)));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let registry = ModelRegistry::new();
        registry.define("user", vec![text("name")]).unwrap();
        let snapshot = registry.snapshot();

        registry.add_property("user", text("extra")).unwrap();
        registry.define("later", vec![]).unwrap();

        registry.restore(snapshot);
        assert!(!registry.get("user").unwrap().properties().contains("extra"));
        assert!(registry.get("later").is_none());
    }
}
