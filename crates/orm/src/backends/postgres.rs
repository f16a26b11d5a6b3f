//! PostgreSQL datastore
//!
//! Implements the datastore capability set over a sqlx connection pool.
//! Parameters arrive as JSON values and are bound by type; rows come
//! back as column-name to JSON-value maps so the core stays
//! driver-agnostic.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Pool, Postgres, Row as SqlxRow, TypeInfo};

use super::{Datastore, DatastoreTransaction};
use crate::error::{OrmError, OrmResult};
use crate::instance::Row;
use crate::table::Statement;

/// Datastore backed by a PostgreSQL pool.
pub struct PostgresDatastore {
    pool: Pool<Postgres>,
}

impl PostgresDatastore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Connect a fresh pool.
    pub async fn connect(database_url: &str) -> OrmResult<Self> {
        if !database_url.starts_with("postgresql://") && !database_url.starts_with("postgres://") {
            return Err(OrmError::Execution(
                "invalid PostgreSQL URL scheme".to_string(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| OrmError::Execution(format!("failed to connect: {}", e)))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

/// Bind a JSON parameter onto a query by value kind.
fn bind_value<'q>(query: PgQuery<'q>, value: &'q Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        // arrays and objects travel as JSONB
        other => query.bind(other.clone()),
    }
}

/// Decode a row column into a JSON value, by declared type first and
/// string fallback second.
fn decode_column(row: &PgRow, index: usize) -> Value {
    let column = &row.columns()[index];
    match column.type_info().name() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT2" | "INT4" | "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)
            .ok()
            .flatten()
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" | "TIMESTAMP" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .ok()
            .flatten()
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn row_to_map(row: &PgRow) -> Row {
    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), decode_column(row, index));
    }
    map
}

async fn fetch_all(pool: &Pool<Postgres>, statement: &Statement) -> OrmResult<Vec<Row>> {
    let mut query = sqlx::query(&statement.sql);
    for param in &statement.params {
        query = bind_value(query, param);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(row_to_map).collect())
}

#[async_trait]
impl Datastore for PostgresDatastore {
    async fn select(&self, statement: Statement) -> OrmResult<Vec<Row>> {
        fetch_all(&self.pool, &statement).await
    }

    async fn insert(&self, statement: Statement) -> OrmResult<Row> {
        let mut rows = fetch_all(&self.pool, &statement).await?;
        rows.pop()
            .ok_or_else(|| OrmError::Execution("insert returned no row".to_string()))
    }

    async fn update(&self, statement: Statement) -> OrmResult<Vec<Row>> {
        fetch_all(&self.pool, &statement).await
    }

    async fn remove(&self, statement: Statement) -> OrmResult<Vec<Row>> {
        fetch_all(&self.pool, &statement).await
    }

    async fn execute(&self, statement: Statement) -> OrmResult<u64> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = bind_value(query, param);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn create(&self, statement: Statement) -> OrmResult<()> {
        self.execute(statement).await.map(|_| ())
    }

    async fn alter(&self, statements: Vec<Statement>) -> OrmResult<()> {
        for statement in statements {
            self.execute(statement).await?;
        }
        Ok(())
    }

    async fn drop(&self, statement: Statement) -> OrmResult<()> {
        self.execute(statement).await.map(|_| ())
    }

    async fn exists(&self, statement: Statement) -> OrmResult<bool> {
        let rows = fetch_all(&self.pool, &statement).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("exists"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn begin(&self) -> OrmResult<Box<dyn DatastoreTransaction>> {
        let transaction = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction {
            transaction: Some(transaction),
        }))
    }
}

/// An open sqlx transaction.
pub struct PostgresTransaction {
    transaction: Option<sqlx::Transaction<'static, Postgres>>,
}

#[async_trait]
impl DatastoreTransaction for PostgresTransaction {
    async fn execute(&mut self, statement: Statement) -> OrmResult<u64> {
        let transaction = self
            .transaction
            .as_mut()
            .ok_or_else(|| OrmError::Execution("transaction already closed".to_string()))?;
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = bind_value(query, param);
        }
        let result = query.execute(&mut **transaction).await?;
        Ok(result.rows_affected())
    }

    async fn commit(mut self: Box<Self>) -> OrmResult<()> {
        if let Some(transaction) = self.transaction.take() {
            transaction.commit().await?;
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> OrmResult<()> {
        if let Some(transaction) = self.transaction.take() {
            transaction.rollback().await?;
        }
        Ok(())
    }
}
