//! Migration runner
//!
//! Replays recorded task lists against the registry and the datastore.
//! Schema tasks mutate the in-memory registry as they compile, so data
//! tasks later in the same list see the schema they were written
//! against. Each script's statements execute inside one transaction;
//! the version marker is written only after the commit succeeds, and a
//! failed script restores the registry to its pre-script snapshot.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info};

use super::recorder::{MigrationOp, MigrationRecorder};
use super::MigrationScript;
use crate::database::DatabaseInner;
use crate::error::{OrmError, OrmResult};
use crate::model::ModelHandle;
use crate::query::QueryOptions;
use crate::table::{Statement, Table};

const VERSION_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS \"schema_migrations\" \
     (\"version\" BIGINT PRIMARY KEY, \"applied_at\" TIMESTAMPTZ NOT NULL DEFAULT now())";

/// Orders and applies migration scripts.
pub struct Migrator {
    db: Arc<DatabaseInner>,
    scripts: Vec<Arc<dyn MigrationScript>>,
}

impl Migrator {
    pub(crate) fn new(db: Arc<DatabaseInner>) -> Self {
        Self {
            db,
            scripts: Vec::new(),
        }
    }

    /// Register a script; versions must be positive and unique.
    pub fn register(&mut self, script: Arc<dyn MigrationScript>) -> OrmResult<()> {
        let version = script.version();
        if version <= 0 {
            return Err(OrmError::Migration(format!(
                "migration versions must be positive, got {}",
                version
            )));
        }
        if self.scripts.iter().any(|s| s.version() == version) {
            return Err(OrmError::Migration(format!(
                "migration version {} is registered twice",
                version
            )));
        }
        self.scripts.push(script);
        self.scripts.sort_by_key(|s| s.version());
        Ok(())
    }

    /// Probe for the version-marker relation and create it when absent.
    pub async fn ensure_version_table(&self) -> OrmResult<()> {
        let probe = Table::for_model("schema_migration").exists();
        if self.db.store.exists(probe).await? {
            return Ok(());
        }
        self.db
            .store
            .create(Statement::new(VERSION_TABLE_DDL, Vec::new()))
            .await
    }

    /// Highest applied version marker, 0 when none.
    pub async fn current_version(&self) -> OrmResult<i64> {
        let rows = self
            .db
            .store
            .select(Statement::new(
                "SELECT COALESCE(MAX(\"version\"), 0) AS \"version\" FROM \"schema_migrations\"",
                Vec::new(),
            ))
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("version"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    /// Migrate from the caller's believed version to the target. A
    /// mismatch between `from` and the stored marker aborts before any
    /// script runs; concurrent deploys racing each other must fail, not
    /// double-apply.
    pub async fn migrate(&self, from: i64, to: i64) -> OrmResult<()> {
        self.ensure_version_table().await?;
        let current = self.current_version().await?;
        if current != from {
            return Err(OrmError::Migration(format!(
                "version conflict: expected schema version {} but the datastore is at {}",
                from, current
            )));
        }
        if to == from {
            return Ok(());
        }
        if to > from {
            let pending: Vec<&Arc<dyn MigrationScript>> = self
                .scripts
                .iter()
                .filter(|s| s.version() > from && s.version() <= to)
                .collect();
            if pending.last().map(|s| s.version()) != Some(to) {
                return Err(OrmError::Migration(format!(
                    "no migration script for target version {}",
                    to
                )));
            }
            for script in pending {
                self.apply(script.as_ref(), true).await?;
            }
        } else {
            if to != 0 && !self.scripts.iter().any(|s| s.version() == to) {
                return Err(OrmError::Migration(format!(
                    "no migration script for target version {}",
                    to
                )));
            }
            let pending: Vec<&Arc<dyn MigrationScript>> = self
                .scripts
                .iter()
                .rev()
                .filter(|s| s.version() <= from && s.version() > to)
                .collect();
            for script in pending {
                self.apply(script.as_ref(), false).await?;
            }
        }
        Ok(())
    }

    /// Migrate from the stored version to the newest registered script.
    pub async fn migrate_to_latest(&self) -> OrmResult<()> {
        self.ensure_version_table().await?;
        let from = self.current_version().await?;
        let Some(to) = self.scripts.last().map(|s| s.version()) else {
            return Ok(());
        };
        if to <= from {
            return Ok(());
        }
        self.migrate(from, to).await
    }

    async fn apply(&self, script: &dyn MigrationScript, up: bool) -> OrmResult<()> {
        let snapshot = self.db.registry.snapshot();
        match self.try_apply(script, up).await {
            Ok(()) => {
                info!(
                    version = script.version(),
                    direction = if up { "up" } else { "down" },
                    "migration applied"
                );
                Ok(())
            }
            Err(e) => {
                self.db.registry.restore(snapshot);
                error!(version = script.version(), error = %e, "migration failed");
                Err(OrmError::Migration(format!(
                    "migration {} failed: {}",
                    script.version(),
                    e
                )))
            }
        }
    }

    async fn try_apply(&self, script: &dyn MigrationScript, up: bool) -> OrmResult<()> {
        let mut recorder = MigrationRecorder::new();
        if up {
            script.up(&mut recorder)?;
        } else {
            script.down(&mut recorder)?;
        }
        let statements = self.compile(recorder.into_ops()).await?;

        let mut transaction = self.db.store.begin().await?;
        for statement in statements {
            if let Err(e) = transaction.execute(statement).await {
                if let Err(rollback_error) = transaction.rollback().await {
                    error!(error = %rollback_error, "rollback failed");
                }
                return Err(e);
            }
        }
        transaction.commit().await?;

        let marker = if up {
            Statement::new(
                "INSERT INTO \"schema_migrations\" (\"version\") VALUES ($1)",
                vec![Value::from(script.version())],
            )
        } else {
            Statement::new(
                "DELETE FROM \"schema_migrations\" WHERE \"version\" = $1",
                vec![Value::from(script.version())],
            )
        };
        self.db.store.execute(marker).await?;
        Ok(())
    }

    /// Turn a task list into statements, evolving the registry eagerly
    /// so later tasks compile against the schema as amended.
    async fn compile(&self, ops: Vec<MigrationOp>) -> OrmResult<Vec<Statement>> {
        let mut statements = Vec::new();
        for op in ops {
            match op {
                MigrationOp::Define { model, properties } => {
                    self.db.registry.define(&model, properties)?;
                }
                MigrationOp::Setup { model } => {
                    statements.extend(self.handle(&model)?.plan_setup()?);
                }
                MigrationOp::AddProperty { model, property } => {
                    let handle = self.handle(&model)?;
                    self.db.registry.add_property(&model, property.clone())?;
                    statements.extend(handle.model().table().alter(
                        &[property],
                        &[],
                        &[],
                        &self.db.registry,
                    )?);
                }
                MigrationOp::ChangeProperty { model, property } => {
                    let handle = self.handle(&model)?;
                    self.db.registry.change_property(&model, property.clone())?;
                    statements.extend(handle.model().table().alter(
                        &[],
                        &[],
                        &[property],
                        &self.db.registry,
                    )?);
                }
                MigrationOp::RemoveProperty { model, property } => {
                    let handle = self.handle(&model)?;
                    let properties = handle.model().properties();
                    let named = properties.require(&property)?.clone();
                    // the paired back-reference goes away with this call
                    let paired_column = named.associated_model().and_then(|target| {
                        self.db.registry.get(target).and_then(|target_model| {
                            target_model
                                .properties()
                                .associations()
                                .find(|p| p.associated_model() == Some(model.as_str()))
                                .and_then(|p| {
                                    p.column_name().map(|column| (target.to_string(), column))
                                })
                        })
                    });
                    self.db.registry.remove_property(&model, &property)?;

                    if let Some(column) = named.column_name() {
                        statements.extend(handle.model().table().alter(
                            &[],
                            &[column],
                            &[],
                            &self.db.registry,
                        )?);
                    }
                    if let Some((target, column)) = paired_column {
                        statements.extend(self.handle(&target)?.model().table().alter(
                            &[],
                            &[column],
                            &[],
                            &self.db.registry,
                        )?);
                    }
                }
                MigrationOp::Create { model, set_map } => {
                    statements.push(self.handle(&model)?.plan_create(set_map).await?);
                }
                MigrationOp::Update {
                    model,
                    where_map,
                    set_map,
                } => {
                    statements.push(
                        self.handle(&model)?
                            .plan_update(&where_map, set_map, &QueryOptions::default())
                            .await?,
                    );
                }
                MigrationOp::Remove { model, where_map } => {
                    if where_map.is_empty() {
                        return Err(OrmError::BadRequest(
                            "remove requires a non-empty where-map; use remove_all to delete everything"
                                .to_string(),
                        ));
                    }
                    statements.push(
                        self.handle(&model)?
                            .plan_remove(&where_map, &QueryOptions::default())?,
                    );
                }
                MigrationOp::RemoveAll { model } => {
                    statements.push(
                        self.handle(&model)?
                            .plan_remove(&Default::default(), &QueryOptions::default())?,
                    );
                }
                MigrationOp::Execute { sql, params } => {
                    statements.push(Statement::new(sql, params));
                }
                MigrationOp::ForceDestroy { model } => {
                    let handle = self.handle(&model)?;
                    statements.push(handle.model().table().drop(true));
                    self.db.registry.remove(&model)?;
                }
            }
        }
        Ok(statements)
    }

    fn handle(&self, model: &str) -> OrmResult<ModelHandle> {
        Ok(ModelHandle {
            db: Arc::clone(&self.db),
            model: self.db.registry.require(model)?,
        })
    }
}
