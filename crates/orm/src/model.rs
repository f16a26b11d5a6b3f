//! Model - declarative schema unit and CRUD orchestration
//!
//! A `Model` owns a property set and its policies; a `ModelHandle` binds
//! the model to the shared database context and exposes the CRUD surface.
//! Every write runs the set-map pipeline in a fixed order: property
//! transforms, then hash-on-set, then default-value fill, then hooks,
//! then the compiled statement.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::access::{merge_scope, Access, AccessControl, AllowAll, OpContext};
use crate::backends::Datastore;
use crate::database::DatabaseInner;
use crate::error::{OrmError, OrmResult};
use crate::instance::{fold_rows, ModelInstance, Related};
use crate::property::{AssociationKind, Modifier, Property, PropertyKind, PropertySet};
use crate::query::{association_operand, parse_where, QueryOptions};
use crate::table::{Statement, Table};

/// Lifecycle hooks invoked around datastore round-trips. All default to
/// no-ops; hook failures reject the operation.
#[async_trait]
pub trait ModelHooks: Send + Sync {
    async fn before_create(&self, _set_map: &mut Map<String, Value>) -> OrmResult<()> {
        Ok(())
    }
    async fn after_create(&self, _instance: &ModelInstance) -> OrmResult<()> {
        Ok(())
    }
    async fn before_update(
        &self,
        _where_map: &Map<String, Value>,
        _set_map: &mut Map<String, Value>,
    ) -> OrmResult<()> {
        Ok(())
    }
    async fn after_update(&self, _instances: &[ModelInstance]) -> OrmResult<()> {
        Ok(())
    }
    async fn before_remove(&self, _where_map: &Map<String, Value>) -> OrmResult<()> {
        Ok(())
    }
    async fn after_remove(&self, _instances: &[ModelInstance]) -> OrmResult<()> {
        Ok(())
    }
}

/// Hook set that does nothing.
pub struct NoHooks;

#[async_trait]
impl ModelHooks for NoHooks {}

/// The declarative schema unit. Created once at startup, shared
/// process-wide, mutated only through migrations.
pub struct Model {
    name: String,
    table: Table,
    properties: RwLock<PropertySet>,
    access: RwLock<Arc<dyn AccessControl>>,
    hooks: RwLock<Arc<dyn ModelHooks>>,
}

impl Model {
    pub(crate) fn new(name: &str, properties: PropertySet) -> Self {
        Self {
            name: name.to_string(),
            table: Table::for_model(name),
            properties: RwLock::new(properties),
            access: RwLock::new(Arc::new(AllowAll)),
            hooks: RwLock::new(Arc::new(NoHooks)),
        }
    }

    pub(crate) fn with_properties(name: &str, properties: PropertySet) -> Self {
        Self::new(name, properties)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Snapshot of the current property set.
    pub fn properties(&self) -> PropertySet {
        self.properties.read().expect("property set poisoned").clone()
    }

    pub(crate) fn mutate_properties<T>(
        &self,
        f: impl FnOnce(&mut PropertySet) -> OrmResult<T>,
    ) -> OrmResult<T> {
        let mut properties = self.properties.write().expect("property set poisoned");
        f(&mut properties)
    }

    pub(crate) fn replace_properties(&self, properties: PropertySet) {
        *self.properties.write().expect("property set poisoned") = properties;
    }

    pub fn set_access(&self, access: Arc<dyn AccessControl>) {
        *self.access.write().expect("access policy poisoned") = access;
    }

    pub fn set_hooks(&self, hooks: Arc<dyn ModelHooks>) {
        *self.hooks.write().expect("hooks poisoned") = hooks;
    }

    fn access(&self) -> Arc<dyn AccessControl> {
        Arc::clone(&self.access.read().expect("access policy poisoned"))
    }

    fn hooks(&self) -> Arc<dyn ModelHooks> {
        Arc::clone(&self.hooks.read().expect("hooks poisoned"))
    }
}

/// A model bound to the shared database context.
#[derive(Clone)]
pub struct ModelHandle {
    pub(crate) db: Arc<DatabaseInner>,
    pub(crate) model: Arc<Model>,
}

impl ModelHandle {
    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn properties(&self) -> PropertySet {
        self.model.properties()
    }

    fn handle_for(&self, model: &str) -> OrmResult<ModelHandle> {
        Ok(ModelHandle {
            db: Arc::clone(&self.db),
            model: self.db.registry.require(model)?,
        })
    }

    // ---- read path ----

    /// Find instances matching the where-map. Returns an empty list,
    /// never an error, when nothing matches.
    pub async fn find(
        &self,
        where_map: Map<String, Value>,
        options: QueryOptions,
        ctx: &OpContext,
    ) -> OrmResult<Vec<ModelInstance>> {
        let properties = self.model.properties();
        let mut where_map = where_map;
        self.guard_read(&properties, &mut where_map, ctx).await?;

        let fetch = self.fetch_list(&properties, &options)?;
        let where_expr = parse_where(&properties, &where_map)?;
        let statement =
            self.model
                .table()
                .select(&properties, &self.db.registry, &where_expr, &options, &fetch)?;
        let rows = self.db.store.select(statement).await?;

        let kinds = self.db.registry.association_kinds(self.model.name());
        let mut instances = fold_rows(self.model.name(), &properties, &kinds, rows)?;

        if options.auto_fetch_depth > 1 && !fetch.is_empty() {
            for instance in &mut instances {
                self.resolve_nested(instance, &fetch, options.auto_fetch_depth - 1)
                    .await?;
            }
        }
        Ok(instances)
    }

    /// `find` with limit 1.
    pub async fn find_one(
        &self,
        where_map: Map<String, Value>,
        options: QueryOptions,
        ctx: &OpContext,
    ) -> OrmResult<Option<ModelInstance>> {
        let options = options.limit(1);
        Ok(self.find(where_map, options, ctx).await?.into_iter().next())
    }

    /// `find_one` that fails with `NotFound` on a miss.
    pub async fn get_one(
        &self,
        where_map: Map<String, Value>,
        options: QueryOptions,
        ctx: &OpContext,
    ) -> OrmResult<ModelInstance> {
        self.find_one(where_map, options, ctx)
            .await?
            .ok_or_else(|| OrmError::NotFound(format!("{} not found", self.model.name())))
    }

    /// Whether any row matches the where-map.
    pub async fn exists(&self, where_map: Map<String, Value>, ctx: &OpContext) -> OrmResult<bool> {
        Ok(self.count(where_map, ctx).await? > 0)
    }

    /// Count rows matching the where-map.
    pub async fn count(&self, where_map: Map<String, Value>, ctx: &OpContext) -> OrmResult<i64> {
        let properties = self.model.properties();
        let mut where_map = where_map;
        self.guard_read(&properties, &mut where_map, ctx).await?;
        let where_expr = parse_where(&properties, &where_map)?;
        let statement = self.model.table().count(&where_expr);
        let rows = self.db.store.select(statement).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    // ---- write path ----

    /// Create one instance from a set-map. The pipeline runs transforms,
    /// then hashing, then default fill, then `before_create`.
    pub async fn create(
        &self,
        set_map: Map<String, Value>,
        ctx: &OpContext,
    ) -> OrmResult<ModelInstance> {
        let properties = self.model.properties();
        let mut set_map = set_map;

        if !ctx.is_system() {
            match self
                .model
                .access()
                .can_create(ctx, &set_map)
                .await?
            {
                Access::Allow => {}
                Access::Deny => return Err(ctx.denial("create")),
                Access::Scope(scope) => merge_scope(&mut set_map, scope),
            }
            if let Some(ownership) = properties.ownership() {
                let actor_id = ctx
                    .actor_id()
                    .ok_or_else(|| ctx.denial("create"))?;
                set_map.insert(ownership.name().to_string(), actor_id);
            }
            self.check_settable(&properties, &set_map, false)?;
        }

        self.run_set_pipeline(&properties, &mut set_map, true).await?;
        self.check_required(&properties, &set_map)?;

        let hooks = self.model.hooks();
        hooks.before_create(&mut set_map).await?;

        let row = self.columnize(&properties, &set_map)?;
        let statement = self.model.table().insert(&properties, &row)?;
        let created = self.db.store.insert(statement).await?;

        let mut instance = ModelInstance::from_row(self.model.name(), created);
        instance.mark_partial();
        hooks.after_create(&instance).await?;
        Ok(instance)
    }

    /// Create several instances sequentially (no bulk insert); the first
    /// failure aborts the remainder.
    pub async fn create_many(
        &self,
        set_maps: Vec<Map<String, Value>>,
        ctx: &OpContext,
    ) -> OrmResult<Vec<ModelInstance>> {
        let mut out = Vec::with_capacity(set_maps.len());
        for set_map in set_maps {
            out.push(self.create(set_map, ctx).await?);
        }
        Ok(out)
    }

    /// Update rows matching the where-map; returns the affected rows as
    /// partial instances.
    pub async fn update(
        &self,
        where_map: Map<String, Value>,
        set_map: Map<String, Value>,
        options: QueryOptions,
        ctx: &OpContext,
    ) -> OrmResult<Vec<ModelInstance>> {
        let properties = self.model.properties();
        let mut where_map = where_map;
        let mut set_map = set_map;

        if !ctx.is_system() {
            match self
                .model
                .access()
                .can_update(ctx, &where_map, &set_map)
                .await?
            {
                Access::Allow => {}
                Access::Deny => return Err(ctx.denial("update")),
                Access::Scope(scope) => merge_scope(&mut where_map, scope),
            }
            self.scope_by_ownership(&properties, &mut where_map, ctx, "update")?;
            self.check_settable(&properties, &set_map, true)?;
        }

        self.run_set_pipeline(&properties, &mut set_map, false).await?;

        let hooks = self.model.hooks();
        hooks.before_update(&where_map, &mut set_map).await?;

        let where_expr = parse_where(&properties, &where_map)?;
        let row = self.columnize(&properties, &set_map)?;
        let statement = self
            .model
            .table()
            .update(&properties, &where_expr, &row, &options)?;
        let rows = self.db.store.update(statement).await?;

        let instances: Vec<ModelInstance> = rows
            .into_iter()
            .map(|row| {
                let mut instance = ModelInstance::from_row(self.model.name(), row);
                instance.mark_partial();
                instance
            })
            .collect();
        hooks.after_update(&instances).await?;
        Ok(instances)
    }

    /// Update at most one row.
    pub async fn update_one(
        &self,
        where_map: Map<String, Value>,
        set_map: Map<String, Value>,
        ctx: &OpContext,
    ) -> OrmResult<Option<ModelInstance>> {
        let options = QueryOptions::default().limit(1);
        Ok(self
            .update(where_map, set_map, options, ctx)
            .await?
            .into_iter()
            .next())
    }

    /// Remove rows matching the where-map. An empty where-map is a
    /// `BadRequest`; unconditional deletion goes through `remove_all`.
    pub async fn remove(
        &self,
        where_map: Map<String, Value>,
        options: QueryOptions,
        ctx: &OpContext,
    ) -> OrmResult<Vec<ModelInstance>> {
        if where_map.is_empty() {
            return Err(OrmError::BadRequest(
                "remove requires a non-empty where-map; use remove_all to delete everything"
                    .to_string(),
            ));
        }
        self.remove_where(where_map, options, ctx).await
    }

    /// Remove at most one row.
    pub async fn remove_one(
        &self,
        where_map: Map<String, Value>,
        ctx: &OpContext,
    ) -> OrmResult<Option<ModelInstance>> {
        if where_map.is_empty() {
            return Err(OrmError::BadRequest(
                "remove requires a non-empty where-map; use remove_all to delete everything"
                    .to_string(),
            ));
        }
        let options = QueryOptions::default().limit(1);
        Ok(self
            .remove_where(where_map, options, ctx)
            .await?
            .into_iter()
            .next())
    }

    /// The only unconditional deletion path.
    pub async fn remove_all(&self, ctx: &OpContext) -> OrmResult<Vec<ModelInstance>> {
        self.remove_where(Map::new(), QueryOptions::default(), ctx)
            .await
    }

    async fn remove_where(
        &self,
        where_map: Map<String, Value>,
        options: QueryOptions,
        ctx: &OpContext,
    ) -> OrmResult<Vec<ModelInstance>> {
        let properties = self.model.properties();
        let mut where_map = where_map;

        if !ctx.is_system() {
            match self.model.access().can_delete(ctx, &where_map).await? {
                Access::Allow => {}
                Access::Deny => return Err(ctx.denial("remove")),
                Access::Scope(scope) => merge_scope(&mut where_map, scope),
            }
            self.scope_by_ownership(&properties, &mut where_map, ctx, "remove")?;
        }

        let hooks = self.model.hooks();
        hooks.before_remove(&where_map).await?;

        let where_expr = parse_where(&properties, &where_map)?;
        let statement = self.model.table().delete(&properties, &where_expr, &options)?;
        let rows = self.db.store.remove(statement).await?;

        let instances: Vec<ModelInstance> = rows
            .into_iter()
            .map(|row| {
                let mut instance = ModelInstance::from_row(self.model.name(), row);
                instance.mark_partial();
                instance
            })
            .collect();
        hooks.after_remove(&instances).await?;
        Ok(instances)
    }

    /// Find by the where-map; on a miss, create from where-map merged
    /// with set-map (set-map wins on collision).
    ///
    /// Not atomic: a concurrent call can create duplicates. Callers
    /// needing atomicity must add a uniqueness constraint.
    pub async fn find_or_create(
        &self,
        where_map: Map<String, Value>,
        set_map: Map<String, Value>,
        ctx: &OpContext,
    ) -> OrmResult<ModelInstance> {
        if let Some(found) = self
            .find_one(where_map.clone(), QueryOptions::default(), ctx)
            .await?
        {
            return Ok(found);
        }
        let mut merged = where_map;
        for (key, value) in set_map {
            merged.insert(key, value);
        }
        self.create(merged, ctx).await
    }

    /// Update by the where-map; on a miss, create. Same non-atomic
    /// caveat as `find_or_create`.
    pub async fn update_or_create(
        &self,
        where_map: Map<String, Value>,
        set_map: Map<String, Value>,
        ctx: &OpContext,
    ) -> OrmResult<ModelInstance> {
        if let Some(updated) = self
            .update_one(where_map.clone(), set_map.clone(), ctx)
            .await?
        {
            return Ok(updated);
        }
        let mut merged = where_map;
        for (key, value) in set_map {
            merged.insert(key, value);
        }
        self.create(merged, ctx).await
    }

    /// Raw escape hatch; instances built from its rows are partial.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> OrmResult<u64> {
        self.db
            .store
            .execute(Statement::new(sql.to_string(), params))
            .await
    }

    // ---- schema path ----

    /// Create the physical relation (idempotent) after checking every
    /// association target resolves. Authenticator models also get their
    /// reset-token companion set up.
    pub async fn setup(&self) -> OrmResult<()> {
        for statement in self.plan_setup()? {
            self.db.store.create(statement).await?;
        }
        Ok(())
    }

    /// Compile the DDL for `setup` without running it; defines the
    /// reset-token companion as a side effect when needed.
    pub(crate) fn plan_setup(&self) -> OrmResult<Vec<Statement>> {
        let properties = self.model.properties();
        for property in properties.associations() {
            let target = property.associated_model().unwrap_or_default();
            self.db.registry.require(target)?;
        }
        let mut statements = vec![self.model.table().create(&properties, &self.db.registry)?];

        if properties.authenticator().is_some() {
            let companion = self.reset_token_model_name();
            if !self.db.registry.contains(&companion) {
                self.db.registry.define(
                    &companion,
                    vec![
                        Property::new(
                            "token",
                            PropertyKind::Text,
                            vec![Modifier::Required, Modifier::Unique],
                        )?,
                        Property::new(
                            self.model.name(),
                            PropertyKind::Uuid,
                            vec![
                                Modifier::Required,
                                Modifier::BelongsTo(self.model.name().to_string()),
                            ],
                        )?,
                    ],
                )?;
            }
            let companion = self.handle_for(&companion)?;
            let companion_props = companion.model.properties();
            statements.push(
                companion
                    .model
                    .table()
                    .create(&companion_props, &self.db.registry)?,
            );
        }
        Ok(statements)
    }

    /// Compile an insert for migration task lists; same pipeline as
    /// `create`, minus access checks and hooks.
    pub(crate) async fn plan_create(
        &self,
        mut set_map: Map<String, Value>,
    ) -> OrmResult<Statement> {
        let properties = self.model.properties();
        self.run_set_pipeline(&properties, &mut set_map, true).await?;
        self.check_required(&properties, &set_map)?;
        let row = self.columnize(&properties, &set_map)?;
        self.model.table().insert(&properties, &row)
    }

    /// Compile an update for migration task lists.
    pub(crate) async fn plan_update(
        &self,
        where_map: &Map<String, Value>,
        mut set_map: Map<String, Value>,
        options: &QueryOptions,
    ) -> OrmResult<Statement> {
        let properties = self.model.properties();
        self.run_set_pipeline(&properties, &mut set_map, false).await?;
        let where_expr = parse_where(&properties, where_map)?;
        let row = self.columnize(&properties, &set_map)?;
        self.model
            .table()
            .update(&properties, &where_expr, &row, options)
    }

    /// Compile a delete for migration task lists.
    pub(crate) fn plan_remove(
        &self,
        where_map: &Map<String, Value>,
        options: &QueryOptions,
    ) -> OrmResult<Statement> {
        let properties = self.model.properties();
        let where_expr = parse_where(&properties, where_map)?;
        self.model.table().delete(&properties, &where_expr, options)
    }

    /// Drop the relation despite dependent foreign keys and forget the
    /// model.
    pub async fn force_destroy(&self) -> OrmResult<()> {
        let statement = self.model.table().drop(true);
        Datastore::drop(self.db.store.as_ref(), statement).await?;
        self.db.registry.remove(self.model.name())
    }

    // ---- authentication path ----

    /// Verify credentials against the authenticating property and the
    /// stored hash. Only valid on the model declaring an `Authenticate`
    /// property.
    pub async fn authorize(&self, credentials: &Map<String, Value>) -> OrmResult<ModelInstance> {
        let properties = self.model.properties();
        let auth = properties.authenticator().ok_or_else(|| {
            OrmError::BadRequest(format!(
                "model '{}' has no authenticating property",
                self.model.name()
            ))
        })?;
        let hashed = properties.hashed().ok_or_else(|| {
            OrmError::BadRequest(format!(
                "model '{}' has no hashed secret property",
                self.model.name()
            ))
        })?;

        let login = credentials.get(auth.name()).cloned().ok_or_else(|| {
            OrmError::BadRequest(format!("credentials are missing '{}'", auth.name()))
        })?;
        let secret = credentials
            .get(hashed.name())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OrmError::BadRequest(format!("credentials are missing '{}'", hashed.name()))
            })?;

        let mut where_map = Map::new();
        where_map.insert(auth.name().to_string(), login);
        let mut options = QueryOptions::default().auto_fetch_depth(0);
        options.include_private = true;
        let instance = self
            .find_one(where_map, options, &OpContext::system())
            .await?
            .ok_or_else(|| OrmError::Unauthenticated("invalid credentials".to_string()))?;

        let stored = instance
            .get(hashed.name())
            .and_then(Value::as_str)
            .ok_or_else(|| OrmError::Unauthenticated("invalid credentials".to_string()))?;
        let valid = bcrypt::verify(secret, stored)
            .map_err(|e| OrmError::Execution(format!("hash verification failed: {}", e)))?;
        if !valid {
            return Err(OrmError::Unauthenticated("invalid credentials".to_string()));
        }
        Ok(instance)
    }

    /// Start the one-time reset flow: look the account up by its
    /// authenticating property and mint a single-use token.
    pub async fn forgot_password(&self, login: Value) -> OrmResult<String> {
        let properties = self.model.properties();
        let auth = properties.authenticator().ok_or_else(|| {
            OrmError::BadRequest(format!(
                "model '{}' has no authenticating property",
                self.model.name()
            ))
        })?;
        let mut where_map = Map::new();
        where_map.insert(auth.name().to_string(), login);
        let account = self
            .get_one(where_map, QueryOptions::default().auto_fetch_depth(0), &OpContext::system())
            .await?;

        let token = Uuid::new_v4().to_string();
        let companion = self.handle_for(&self.reset_token_model_name())?;
        let mut set_map = Map::new();
        set_map.insert("token".to_string(), Value::String(token.clone()));
        set_map.insert(
            self.model.name().to_string(),
            account.id().unwrap_or(Value::Null),
        );
        companion.create(set_map, &OpContext::system()).await?;
        Ok(token)
    }

    /// Complete the reset flow: consume the token and store the new
    /// secret through the regular hash pipeline.
    pub async fn reset_password(
        &self,
        token: &str,
        secret: Value,
        confirm_secret: Value,
    ) -> OrmResult<ModelInstance> {
        if secret != confirm_secret {
            return Err(OrmError::BadRequest(
                "password confirmation does not match".to_string(),
            ));
        }
        let properties = self.model.properties();
        let hashed = properties.hashed().ok_or_else(|| {
            OrmError::BadRequest(format!(
                "model '{}' has no hashed secret property",
                self.model.name()
            ))
        })?;

        let companion = self.handle_for(&self.reset_token_model_name())?;
        let mut where_map = Map::new();
        where_map.insert("token".to_string(), Value::String(token.to_string()));
        let record = companion
            .get_one(
                where_map.clone(),
                QueryOptions::default().auto_fetch_depth(0),
                &OpContext::system(),
            )
            .await?;

        let account_id = record
            .get(&format!("{}_id", self.model.name()))
            .cloned()
            .ok_or_else(|| OrmError::Execution("reset token has no account".to_string()))?;

        let mut account_where = Map::new();
        account_where.insert("id".to_string(), account_id);
        let mut set_map = Map::new();
        set_map.insert(hashed.name().to_string(), secret);
        let updated = self
            .update_one(account_where, set_map, &OpContext::system())
            .await?
            .ok_or_else(|| OrmError::NotFound(format!("{} not found", self.model.name())))?;

        // tokens are single-use
        companion
            .remove(where_map, QueryOptions::default(), &OpContext::system())
            .await?;
        Ok(updated)
    }

    fn reset_token_model_name(&self) -> String {
        format!("{}_reset_token", self.model.name())
    }

    // ---- association resolution ----

    /// Resolve an association on demand, regardless of its auto-fetch
    /// flag. Works on partial instances too.
    pub async fn related(&self, instance: &ModelInstance, name: &str) -> OrmResult<Related> {
        let properties = self.model.properties();
        let property = properties.require(name)?;
        let association = property
            .association()
            .ok_or_else(|| {
                OrmError::Schema(format!("property '{}' is not an association", name))
            })?
            .clone();
        let target = self.handle_for(&association.model)?;
        let ctx = OpContext::system();

        match association.kind {
            AssociationKind::BelongsTo => {
                let fk = instance
                    .get(&format!("{}_id", name))
                    .cloned()
                    .unwrap_or(Value::Null);
                if fk.is_null() {
                    return Ok(Related::One(None));
                }
                let mut where_map = Map::new();
                where_map.insert("id".to_string(), fk);
                let found = target
                    .find_one(where_map, QueryOptions::default(), &ctx)
                    .await?;
                Ok(Related::One(found.map(Box::new)))
            }
            AssociationKind::HasOne | AssociationKind::HasMany => {
                let inverse = target
                    .model
                    .properties()
                    .associations()
                    .find(|p| {
                        p.association()
                            .map(|a| {
                                a.kind == AssociationKind::BelongsTo
                                    && a.model == self.model.name()
                            })
                            .unwrap_or(false)
                    })
                    .map(|p| p.name().to_string())
                    .ok_or_else(|| {
                        OrmError::Schema(format!(
                            "model '{}' has no belongs-to property targeting '{}'",
                            association.model,
                            self.model.name()
                        ))
                    })?;
                let id = instance.id().ok_or_else(|| {
                    OrmError::BadRequest("instance has no id to resolve against".to_string())
                })?;
                let mut where_map = Map::new();
                where_map.insert(inverse, id);
                if association.kind == AssociationKind::HasOne {
                    let found = target
                        .find_one(where_map, QueryOptions::default(), &ctx)
                        .await?;
                    Ok(Related::One(found.map(Box::new)))
                } else {
                    let found = target.find(where_map, QueryOptions::default(), &ctx).await?;
                    Ok(Related::Many(found))
                }
            }
            AssociationKind::ManyToMany => {
                let through_name = association.through.clone().ok_or_else(|| {
                    OrmError::Schema(format!(
                        "many-to-many property '{}' has no through model",
                        name
                    ))
                })?;
                let through = self.handle_for(&through_name)?;
                let through_props = through.model.properties();
                let near = belongs_to_property(&through_props, self.model.name(), &through_name)?;
                let far =
                    belongs_to_property(&through_props, &association.model, &through_name)?;

                let id = instance.id().ok_or_else(|| {
                    OrmError::BadRequest("instance has no id to resolve against".to_string())
                })?;
                let mut junction_where = Map::new();
                junction_where.insert(near, id);
                let rows = through
                    .find(junction_where, QueryOptions::default().auto_fetch_depth(0), &ctx)
                    .await?;
                let far_column = format!("{}_id", far);
                let ids: Vec<Value> = rows
                    .iter()
                    .filter_map(|row| row.get(&far_column).cloned())
                    .filter(|v| !v.is_null())
                    .collect();
                if ids.is_empty() {
                    return Ok(Related::Many(Vec::new()));
                }
                let mut where_map = Map::new();
                let mut operator = Map::new();
                operator.insert("$in".to_string(), Value::Array(ids));
                where_map.insert("id".to_string(), Value::Object(operator));
                let found = target.find(where_map, QueryOptions::default(), &ctx).await?;
                Ok(Related::Many(found))
            }
        }
    }

    /// Persist an instance: insert when new, update the dirty fields
    /// otherwise.
    pub async fn save(
        &self,
        instance: &mut ModelInstance,
        ctx: &OpContext,
    ) -> OrmResult<()> {
        if instance.is_new() {
            let saved = self.create(instance.dirty_map(), ctx).await?;
            for (key, value) in saved.values() {
                instance.set(key.clone(), value.clone());
            }
            instance.mark_saved();
            return Ok(());
        }
        if !instance.is_dirty() {
            return Ok(());
        }
        let id = instance.id().ok_or_else(|| {
            OrmError::BadRequest("cannot save an instance without an id".to_string())
        })?;
        let mut where_map = Map::new();
        where_map.insert("id".to_string(), id);
        self.update_one(where_map, instance.dirty_map(), ctx).await?;
        instance.mark_saved();
        Ok(())
    }

    // ---- pipeline internals ----

    async fn guard_read(
        &self,
        properties: &PropertySet,
        where_map: &mut Map<String, Value>,
        ctx: &OpContext,
    ) -> OrmResult<()> {
        if ctx.is_system() {
            return Ok(());
        }
        match self.model.access().can_read(ctx, where_map).await? {
            Access::Allow => {}
            Access::Deny => return Err(ctx.denial("read")),
            Access::Scope(scope) => merge_scope(where_map, scope),
        }
        self.scope_by_ownership(properties, where_map, ctx, "read")
    }

    fn scope_by_ownership(
        &self,
        properties: &PropertySet,
        where_map: &mut Map<String, Value>,
        ctx: &OpContext,
        action: &str,
    ) -> OrmResult<()> {
        if let Some(ownership) = properties.ownership() {
            let actor_id = ctx.actor_id().ok_or_else(|| ctx.denial(action))?;
            where_map.insert(ownership.name().to_string(), actor_id);
        }
        Ok(())
    }

    fn check_settable(
        &self,
        properties: &PropertySet,
        set_map: &Map<String, Value>,
        updating: bool,
    ) -> OrmResult<()> {
        for key in set_map.keys() {
            if key.starts_with('$') {
                return Err(OrmError::BadRequest(format!(
                    "operators are not allowed in set-maps: '{}'",
                    key
                )));
            }
            let property = properties.require(key)?;
            let allowed = if updating {
                property.can_update()
            } else {
                property.can_set()
            };
            if !allowed && !property.options().ownership {
                return Err(OrmError::BadRequest(format!(
                    "property '{}' cannot be {}",
                    key,
                    if updating { "updated" } else { "set" }
                )));
            }
        }
        Ok(())
    }

    /// Transforms, then hash-on-set, then default fill, in that order.
    /// Defaults fill only unset fields; on update they additionally
    /// require the property's change-companion to be present in the map.
    async fn run_set_pipeline(
        &self,
        properties: &PropertySet,
        set_map: &mut Map<String, Value>,
        creating: bool,
    ) -> OrmResult<()> {
        for property in properties.iter() {
            if let Some(transform) = &property.options().transform {
                if let Some(value) = set_map.get(property.name()).cloned() {
                    let snapshot = set_map.clone();
                    let transformed = transform.transform(value, &snapshot).await?;
                    set_map.insert(property.name().to_string(), transformed);
                }
            }
        }
        for property in properties.iter() {
            if property.options().hash {
                if let Some(value) = set_map.get(property.name()) {
                    let plain = value.as_str().ok_or_else(|| {
                        OrmError::BadRequest(format!(
                            "property '{}' must be a string to be hashed",
                            property.name()
                        ))
                    })?;
                    let hashed = bcrypt::hash(plain, bcrypt::DEFAULT_COST)
                        .map_err(|e| OrmError::Execution(format!("hashing failed: {}", e)))?;
                    set_map.insert(property.name().to_string(), Value::String(hashed));
                }
            }
        }
        for property in properties.iter() {
            let Some(default) = &property.options().default else {
                continue;
            };
            if set_map.contains_key(property.name()) {
                continue;
            }
            let applies = creating
                || property
                    .options()
                    .change_companion
                    .as_ref()
                    .map(|companion| set_map.contains_key(companion))
                    .unwrap_or(false);
            if applies {
                set_map.insert(property.name().to_string(), default.produce());
            }
        }
        Ok(())
    }

    fn check_required(
        &self,
        properties: &PropertySet,
        set_map: &Map<String, Value>,
    ) -> OrmResult<()> {
        for property in properties.iter() {
            if !property.options().required || property.options().optional {
                continue;
            }
            if property.column_name().is_none() {
                continue;
            }
            let missing = set_map
                .get(property.name())
                .map(Value::is_null)
                .unwrap_or(true);
            if missing {
                return Err(OrmError::BadRequest(format!(
                    "property '{}' is required",
                    property.name()
                )));
            }
        }
        Ok(())
    }

    /// Resolve property names to physical columns; to-one association
    /// values collapse to their id.
    fn columnize(
        &self,
        properties: &PropertySet,
        set_map: &Map<String, Value>,
    ) -> OrmResult<Map<String, Value>> {
        let mut row = Map::new();
        for (key, value) in set_map {
            let property = properties.require(key)?;
            let Some(column) = property.column_name() else {
                return Err(OrmError::BadRequest(format!(
                    "property '{}' owns no column and cannot be written directly",
                    key
                )));
            };
            let value = if property.is_association() {
                association_operand(value)?
            } else {
                value.clone()
            };
            row.insert(column, value);
        }
        Ok(row)
    }

    fn fetch_list(
        &self,
        properties: &PropertySet,
        options: &QueryOptions,
    ) -> OrmResult<Vec<String>> {
        let mut fetch: Vec<String> = Vec::new();
        for name in &options.associations {
            let property = properties.require(name)?;
            if !property.is_association() {
                return Err(OrmError::BadRequest(format!(
                    "property '{}' is not an association",
                    name
                )));
            }
            fetch.push(name.clone());
        }
        if options.auto_fetch_depth > 0 {
            for property in properties.associations() {
                if property.options().auto_fetch && !fetch.contains(&property.name().to_string()) {
                    fetch.push(property.name().to_string());
                }
            }
        }
        Ok(fetch)
    }

    /// Recursively resolve auto-fetch associations of already-fetched
    /// children, bounded by the remaining depth.
    fn resolve_nested<'a>(
        &'a self,
        instance: &'a mut ModelInstance,
        fetched: &'a [String],
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = OrmResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if depth == 0 {
                return Ok(());
            }
            let properties = self.model.properties();
            for name in fetched {
                let Some(property) = properties.get(name) else {
                    continue;
                };
                let Some(target_name) = property.associated_model() else {
                    continue;
                };
                let target = self.handle_for(target_name)?;
                let target_props = target.model.properties();
                let nested: Vec<String> = target_props
                    .associations()
                    .filter(|p| p.options().auto_fetch)
                    .map(|p| p.name().to_string())
                    .collect();
                if nested.is_empty() {
                    continue;
                }
                let Some(related) = instance.related_mut().get_mut(name) else {
                    continue;
                };
                match related {
                    Related::One(Some(child)) => {
                        target.refetch_with_depth(child, depth).await?;
                    }
                    Related::Many(children) => {
                        for child in children.iter_mut() {
                            target.refetch_with_depth(child, depth).await?;
                        }
                    }
                    Related::One(None) => {}
                }
            }
            Ok(())
        })
    }

    async fn refetch_with_depth(
        &self,
        child: &mut ModelInstance,
        depth: usize,
    ) -> OrmResult<()> {
        let Some(id) = child.id() else {
            return Ok(());
        };
        let mut where_map = Map::new();
        where_map.insert("id".to_string(), id);
        let options = QueryOptions::default().auto_fetch_depth(depth);
        if let Some(resolved) = self
            .find_one(where_map, options, &OpContext::system())
            .await?
        {
            *child = resolved;
        }
        Ok(())
    }
}

fn belongs_to_property(
    properties: &PropertySet,
    target: &str,
    holder: &str,
) -> OrmResult<String> {
    properties
        .associations()
        .find(|p| {
            p.association()
                .map(|a| a.kind == AssociationKind::BelongsTo && a.model == target)
                .unwrap_or(false)
        })
        .map(|p| p.name().to_string())
        .ok_or_else(|| {
            OrmError::Schema(format!(
                "model '{}' has no belongs-to property targeting '{}'",
                holder, target
            ))
        })
}
