//! Database context
//!
//! Owns the model registry and the datastore and hands out bound model
//! handles. One context per process is typical; everything inside is
//! shared via `Arc` and safe to clone across tasks.

use std::sync::Arc;

use tracing::info;

use crate::backends::{Datastore, PostgresDatastore};
use crate::error::OrmResult;
use crate::migrations::Migrator;
use crate::model::ModelHandle;
use crate::property::Property;
use crate::registry::ModelRegistry;

pub(crate) struct DatabaseInner {
    pub(crate) registry: ModelRegistry,
    pub(crate) store: Arc<dyn Datastore>,
}

/// The ORM entry point.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                registry: ModelRegistry::new(),
                store,
            }),
        }
    }

    /// Connect a PostgreSQL-backed context.
    pub async fn connect(database_url: &str) -> OrmResult<Self> {
        let store = PostgresDatastore::connect(database_url).await?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Declare a model and hand back its bound handle.
    pub fn define(&self, name: &str, properties: Vec<Property>) -> OrmResult<ModelHandle> {
        let model = self.inner.registry.define(name, properties)?;
        Ok(ModelHandle {
            db: Arc::clone(&self.inner),
            model,
        })
    }

    /// Handle for an already-declared model.
    pub fn model(&self, name: &str) -> OrmResult<ModelHandle> {
        Ok(ModelHandle {
            db: Arc::clone(&self.inner),
            model: self.inner.registry.require(name)?,
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// The model carrying the authenticating property, when one exists.
    pub fn authenticator(&self) -> Option<ModelHandle> {
        let name = self.inner.registry.authenticator()?;
        self.model(&name).ok()
    }

    /// Validate every association and create all physical relations.
    /// Idempotent; safe to run at every startup.
    pub async fn setup(&self) -> OrmResult<()> {
        self.inner.registry.validate_associations()?;
        for name in self.inner.registry.model_names() {
            self.model(&name)?.setup().await?;
        }
        info!(models = self.inner.registry.model_names().len(), "schema ready");
        Ok(())
    }

    /// A migration runner bound to this context.
    pub fn migrator(&self) -> Migrator {
        Migrator::new(Arc::clone(&self.inner))
    }
}
