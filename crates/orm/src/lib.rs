//! # cinder-orm: Schema-evolution-aware data layer
//!
//! Models are declared at runtime as named property sets; the registry
//! binds them to physical relations, compiles parameterized SQL, folds
//! joined result sets back into nested instances, and replays recorded
//! migration task lists to evolve both the schema and the data.

pub mod access;
pub mod backends;
pub mod database;
pub mod error;
pub mod instance;
pub mod migrations;
pub mod model;
pub mod property;
pub mod query;
pub mod registry;
pub mod security;
pub mod table;


// Re-export the working surface
pub use access::{Access, AccessControl, AllowAll, OpContext};
pub use backends::{Datastore, DatastoreTransaction, PostgresDatastore};
pub use database::Database;
pub use error::{OrmError, OrmResult};
pub use instance::{fold_rows, ModelInstance, Related, Row};
pub use migrations::{
    MigrationOp, MigrationRecorder, MigrationScript, Migrator, RecordingModel,
};
pub use model::{Model, ModelHandle, ModelHooks, NoHooks};
pub use property::{
    Association, AssociationKind, DefaultValue, Modifier, Property, PropertyKind,
    PropertyOptions, PropertySet, PropertyTransform,
};
pub use query::{
    parse_where, Comparison, Condition, OrderDirection, QueryOptions, WhereExpr,
    DEFAULT_AUTO_FETCH_DEPTH,
};
pub use registry::ModelRegistry;
pub use table::{pluralize, Statement, Table};
