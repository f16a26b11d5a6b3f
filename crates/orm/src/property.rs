//! Property - a single declared model attribute
//!
//! A property is built from a name, a value kind, and an ordered modifier
//! list. Modifiers compose by folding into a shared options record, so a
//! later modifier overrides an earlier one (a second `Default` wins).
//! `PropertySet` owns a model's properties and guarantees the implicit
//! `id` property and the at-most-one-authenticator rule.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{OrmError, OrmResult};

/// Property names that would shadow model operations or internals.
const RESERVED_NAMES: &[&str] = &[
    "find",
    "find_one",
    "get_one",
    "create",
    "update",
    "update_one",
    "remove",
    "remove_one",
    "remove_all",
    "find_or_create",
    "update_or_create",
    "exists",
    "count",
    "execute",
    "setup",
    "save",
    "authorize",
    "model",
    "table",
    "type",
];

/// Value kind of a scalar property, mapped onto a SQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Text,
    Integer,
    Float,
    Boolean,
    Uuid,
    Date,
    Json,
}

impl PropertyKind {
    /// PostgreSQL column type for this kind.
    pub fn sql_type(&self) -> &'static str {
        match self {
            PropertyKind::Text => "TEXT",
            PropertyKind::Integer => "BIGINT",
            PropertyKind::Float => "DOUBLE PRECISION",
            PropertyKind::Boolean => "BOOLEAN",
            PropertyKind::Uuid => "UUID",
            PropertyKind::Date => "TIMESTAMPTZ",
            PropertyKind::Json => "JSONB",
        }
    }
}

/// Association kinds a property can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    BelongsTo,
    HasOne,
    HasMany,
    ManyToMany,
}

impl AssociationKind {
    /// Whether the association resolves to a collection.
    pub fn is_collection(&self) -> bool {
        matches!(self, AssociationKind::HasMany | AssociationKind::ManyToMany)
    }
}

/// Association target resolved at schema-build time against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub kind: AssociationKind,
    /// Target model name
    pub model: String,
    /// Junction model name for many-to-many
    pub through: Option<String>,
}

/// Default value for a property: a literal or a generator run per row.
#[derive(Clone)]
pub enum DefaultValue {
    Value(Value),
    Generator(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultValue {
    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Value(v) => v.clone(),
            DefaultValue::Generator(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(v) => write!(f, "DefaultValue::Value({})", v),
            DefaultValue::Generator(_) => write!(f, "DefaultValue::Generator(..)"),
        }
    }
}

/// User-supplied value transform, run against the incoming set-map before
/// hashing and default fill.
#[async_trait]
pub trait PropertyTransform: Send + Sync {
    /// Produce the stored value from the submitted value and the full
    /// set-map (other submitted fields are visible for derived values).
    async fn transform(&self, value: Value, set_map: &Map<String, Value>) -> OrmResult<Value>;
}

/// Modifier applied during property construction. Order matters: each
/// modifier folds into the options record and may override earlier ones.
#[derive(Clone)]
pub enum Modifier {
    Required,
    Unique,
    Default(DefaultValue),
    /// Restrict default fill on update to set-maps containing the named
    /// companion field (the default always fills on create).
    OnChangeOf(String),
    Transform(Arc<dyn PropertyTransform>),
    /// Store a bcrypt hash of the submitted value
    Hash,
    /// Computed select: a SQL expression evaluated in place of a column
    SelectExpr(String),
    /// Never client-settable or updatable
    ReadOnly,
    /// Settable at creation only
    WriteOnce,
    /// Excluded from select projections
    Private,
    BelongsTo(String),
    HasOne(String),
    HasMany(String),
    ManyToMany { model: String, through: String },
    /// Resolve this association on `find` without an explicit request
    AutoFetch,
    Optional,
    /// Marks the model's authenticating property (login name)
    Authenticate,
    /// Marks the property that scopes rows to the creating actor
    Ownership,
}

/// Options record produced by folding the modifier list.
#[derive(Clone, Default)]
pub struct PropertyOptions {
    pub required: bool,
    pub unique: bool,
    pub default: Option<DefaultValue>,
    pub change_companion: Option<String>,
    pub transform: Option<Arc<dyn PropertyTransform>>,
    pub hash: bool,
    pub select_expr: Option<String>,
    pub read_only: bool,
    pub write_once: bool,
    pub private: bool,
    pub association: Option<Association>,
    pub auto_fetch: bool,
    pub optional: bool,
    pub authenticate: bool,
    pub ownership: bool,
}

impl fmt::Debug for PropertyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyOptions")
            .field("required", &self.required)
            .field("unique", &self.unique)
            .field("default", &self.default)
            .field("change_companion", &self.change_companion)
            .field("transform", &self.transform.as_ref().map(|_| ".."))
            .field("hash", &self.hash)
            .field("select_expr", &self.select_expr)
            .field("read_only", &self.read_only)
            .field("write_once", &self.write_once)
            .field("private", &self.private)
            .field("association", &self.association)
            .field("auto_fetch", &self.auto_fetch)
            .field("optional", &self.optional)
            .field("authenticate", &self.authenticate)
            .field("ownership", &self.ownership)
            .finish()
    }
}

/// A declared model attribute.
#[derive(Debug, Clone)]
pub struct Property {
    name: String,
    kind: PropertyKind,
    options: PropertyOptions,
}

impl Property {
    /// Build a property from a name, kind, and ordered modifier list.
    ///
    /// Fails fast with a `Schema` error when the name starts with a
    /// reserved prefix (`_`, `$`) or collides with a reserved word.
    pub fn new(
        name: impl Into<String>,
        kind: PropertyKind,
        modifiers: Vec<Modifier>,
    ) -> OrmResult<Self> {
        let name = name.into();
        if name.starts_with('_') || name.starts_with('$') {
            return Err(OrmError::Schema(format!(
                "property name '{}' starts with a reserved prefix",
                name
            )));
        }
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(OrmError::Schema(format!(
                "property name '{}' is reserved",
                name
            )));
        }
        crate::security::validate_identifier(&name)?;

        let mut options = PropertyOptions::default();
        for modifier in modifiers {
            options = Self::apply_modifier(options, modifier);
        }
        Ok(Self {
            name,
            kind,
            options,
        })
    }

    fn apply_modifier(mut options: PropertyOptions, modifier: Modifier) -> PropertyOptions {
        match modifier {
            Modifier::Required => options.required = true,
            Modifier::Unique => options.unique = true,
            Modifier::Default(value) => options.default = Some(value),
            Modifier::OnChangeOf(name) => options.change_companion = Some(name),
            Modifier::Transform(transform) => options.transform = Some(transform),
            Modifier::Hash => options.hash = true,
            Modifier::SelectExpr(expr) => options.select_expr = Some(expr),
            Modifier::ReadOnly => options.read_only = true,
            Modifier::WriteOnce => options.write_once = true,
            Modifier::Private => options.private = true,
            Modifier::BelongsTo(model) => {
                options.association = Some(Association {
                    kind: AssociationKind::BelongsTo,
                    model,
                    through: None,
                })
            }
            Modifier::HasOne(model) => {
                options.association = Some(Association {
                    kind: AssociationKind::HasOne,
                    model,
                    through: None,
                })
            }
            Modifier::HasMany(model) => {
                options.association = Some(Association {
                    kind: AssociationKind::HasMany,
                    model,
                    through: None,
                })
            }
            Modifier::ManyToMany { model, through } => {
                options.association = Some(Association {
                    kind: AssociationKind::ManyToMany,
                    model,
                    through: Some(through),
                })
            }
            Modifier::AutoFetch => options.auto_fetch = true,
            Modifier::Optional => options.optional = true,
            Modifier::Authenticate => options.authenticate = true,
            Modifier::Ownership => options.ownership = true,
        }
        options
    }

    /// The implicit primary-key property present on every model.
    pub fn id() -> Self {
        Self {
            name: "id".to_string(),
            kind: PropertyKind::Uuid,
            options: PropertyOptions {
                unique: true,
                read_only: true,
                default: Some(DefaultValue::Generator(Arc::new(|| {
                    Value::String(Uuid::new_v4().to_string())
                }))),
                ..PropertyOptions::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    pub fn options(&self) -> &PropertyOptions {
        &self.options
    }

    pub fn is_association(&self) -> bool {
        self.options.association.is_some()
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(
            self.options.association,
            Some(Association {
                kind: AssociationKind::ManyToMany,
                ..
            })
        )
    }

    pub fn is_transformable(&self) -> bool {
        self.options.transform.is_some()
    }

    /// Whether the property participates in select projections.
    pub fn is_selectable(&self) -> bool {
        if self.options.private {
            return false;
        }
        // to-one associations project their FK column; to-many own no column
        match &self.options.association {
            Some(assoc) => assoc.kind == AssociationKind::BelongsTo,
            None => true,
        }
    }

    /// Whether clients may include this property in a create set-map.
    pub fn can_set(&self) -> bool {
        !self.options.read_only
    }

    /// Whether clients may include this property in an update set-map.
    pub fn can_update(&self) -> bool {
        !self.options.read_only && !self.options.write_once
    }

    pub fn association(&self) -> Option<&Association> {
        self.options.association.as_ref()
    }

    pub fn associated_model(&self) -> Option<&str> {
        self.options.association.as_ref().map(|a| a.model.as_str())
    }

    pub fn through_model(&self) -> Option<&str> {
        self.options
            .association
            .as_ref()
            .and_then(|a| a.through.as_deref())
    }

    /// Physical column name: to-one associations store a `<name>_id`
    /// foreign key; everything else maps onto the property name.
    pub fn column_name(&self) -> Option<String> {
        match &self.options.association {
            Some(assoc) if assoc.kind == AssociationKind::BelongsTo => {
                Some(format!("{}_id", self.name))
            }
            Some(_) => None,
            None => Some(self.name.clone()),
        }
    }
}

/// A model's properties: ordered, unique by name, with the implicit `id`.
#[derive(Debug, Clone, Default)]
pub struct PropertySet {
    properties: Vec<Property>,
    index: HashMap<String, usize>,
}

impl PropertySet {
    /// An empty set still containing the implicit `id` property.
    pub fn new() -> Self {
        let mut set = Self {
            properties: Vec::new(),
            index: HashMap::new(),
        };
        set.push(Property::id());
        set
    }

    /// Build a set from declared properties, adding `id` first.
    pub fn from_properties(properties: Vec<Property>) -> OrmResult<Self> {
        let mut set = Self::new();
        for property in properties {
            set.insert(property)?;
        }
        Ok(set)
    }

    fn push(&mut self, property: Property) {
        self.index
            .insert(property.name().to_string(), self.properties.len());
        self.properties.push(property);
    }

    /// Insert a declared property; duplicate names and a second
    /// authenticating property are schema errors.
    pub fn insert(&mut self, property: Property) -> OrmResult<()> {
        if self.index.contains_key(property.name()) {
            return Err(OrmError::Schema(format!(
                "duplicate property '{}'",
                property.name()
            )));
        }
        if property.options().authenticate && self.authenticator().is_some() {
            return Err(OrmError::Schema(
                "a model may declare at most one authenticating property".to_string(),
            ));
        }
        self.push(property);
        Ok(())
    }

    /// Remove a property by name. The implicit `id` cannot be removed.
    pub fn remove(&mut self, name: &str) -> OrmResult<Property> {
        if name == "id" {
            return Err(OrmError::Schema(
                "the id property cannot be removed".to_string(),
            ));
        }
        let position = self
            .index
            .remove(name)
            .ok_or_else(|| OrmError::Schema(format!("property '{}' not found", name)))?;
        let removed = self.properties.remove(position);
        for (i, property) in self.properties.iter().enumerate() {
            self.index.insert(property.name().to_string(), i);
        }
        Ok(removed)
    }

    /// Swap a property for a new declaration with the same name, keeping
    /// its position. The implicit `id` cannot be redefined.
    pub fn replace(&mut self, property: Property) -> OrmResult<Property> {
        if property.name() == "id" {
            return Err(OrmError::Schema(
                "the id property cannot be redefined".to_string(),
            ));
        }
        let position = *self.index.get(property.name()).ok_or_else(|| {
            OrmError::Schema(format!("property '{}' not found", property.name()))
        })?;
        if property.options().authenticate {
            if let Some(auth) = self.authenticator() {
                if auth.name() != property.name() {
                    return Err(OrmError::Schema(
                        "a model may declare at most one authenticating property".to_string(),
                    ));
                }
            }
        }
        Ok(std::mem::replace(&mut self.properties[position], property))
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.index.get(name).map(|&i| &self.properties[i])
    }

    /// Resolve a where/set-map key to a property, failing with a
    /// "property not found" schema error.
    pub fn require(&self, name: &str) -> OrmResult<&Property> {
        self.get(name)
            .ok_or_else(|| OrmError::Schema(format!("property '{}' not found", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// All association properties, in declaration order.
    pub fn associations(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter().filter(|p| p.is_association())
    }

    /// The authenticating property, if the model declares one.
    pub fn authenticator(&self) -> Option<&Property> {
        self.properties.iter().find(|p| p.options().authenticate)
    }

    /// The hash-bearing property (stored secret), if any.
    pub fn hashed(&self) -> Option<&Property> {
        self.properties.iter().find(|p| p.options().hash)
    }

    /// The actor-ownership property, if the model declares one.
    pub fn ownership(&self) -> Option<&Property> {
        self.properties.iter().find(|p| p.options().ownership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_property_always_present_exactly_once() {
        let set = PropertySet::new();
        let ids: Vec<_> = set.iter().filter(|p| p.name() == "id").collect();
        assert_eq!(ids.len(), 1);

        let set = PropertySet::from_properties(vec![Property::new(
            "name",
            PropertyKind::Text,
            vec![Modifier::Required],
        )
        .unwrap()])
        .unwrap();
        let ids: Vec<_> = set.iter().filter(|p| p.name() == "id").collect();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn id_generates_uuid_defaults() {
        let id = Property::id();
        let a = id.options().default.as_ref().unwrap().produce();
        let b = id.options().default.as_ref().unwrap().produce();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str().unwrap()).is_ok());
    }

    #[test]
    fn reserved_names_fail_fast() {
        assert!(Property::new("_secret", PropertyKind::Text, vec![]).is_err());
        assert!(Property::new("$where", PropertyKind::Text, vec![]).is_err());
        assert!(Property::new("remove_all", PropertyKind::Text, vec![]).is_err());
        assert!(Property::new("name", PropertyKind::Text, vec![]).is_ok());
    }

    #[test]
    fn later_modifier_overrides_earlier() {
        let property = Property::new(
            "state",
            PropertyKind::Text,
            vec![
                Modifier::Default(DefaultValue::Value(json!("draft"))),
                Modifier::Default(DefaultValue::Value(json!("published"))),
            ],
        )
        .unwrap();
        assert_eq!(
            property.options().default.as_ref().unwrap().produce(),
            json!("published")
        );
    }

    #[test]
    fn at_most_one_authenticator() {
        let mut set = PropertySet::new();
        set.insert(
            Property::new("email", PropertyKind::Text, vec![Modifier::Authenticate]).unwrap(),
        )
        .unwrap();
        let err = set.insert(
            Property::new("phone", PropertyKind::Text, vec![Modifier::Authenticate]).unwrap(),
        );
        assert!(matches!(err, Err(OrmError::Schema(_))));
    }

    #[test]
    fn duplicate_property_is_schema_error() {
        let mut set = PropertySet::new();
        set.insert(Property::new("name", PropertyKind::Text, vec![]).unwrap())
            .unwrap();
        assert!(set
            .insert(Property::new("name", PropertyKind::Text, vec![]).unwrap())
            .is_err());
    }

    #[test]
    fn association_columns() {
        let belongs = Property::new("author", PropertyKind::Uuid, vec![Modifier::BelongsTo(
            "user".to_string(),
        )])
        .unwrap();
        assert_eq!(belongs.column_name().unwrap(), "author_id");
        assert!(belongs.is_association());
        assert_eq!(belongs.associated_model(), Some("user"));

        let many = Property::new("posts", PropertyKind::Uuid, vec![Modifier::HasMany(
            "post".to_string(),
        )])
        .unwrap();
        assert!(many.column_name().is_none());
        assert!(!many.is_selectable());
    }

    #[test]
    fn removing_id_is_rejected() {
        let mut set = PropertySet::new();
        assert!(set.remove("id").is_err());
    }
}
