//! Datastore abstraction
//!
//! The core consumes a capability-set against named relations: select,
//! insert, update, remove, execute, plus schema operations and
//! transactions. Everything arrives as a compiled parameterized
//! statement; drivers bind the values and never splice them.

pub mod postgres;

use async_trait::async_trait;

use crate::error::OrmResult;
use crate::instance::Row;
use crate::table::Statement;

pub use postgres::PostgresDatastore;

/// Storage-driver capability set.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Run a select, returning rows as column-name to value maps.
    async fn select(&self, statement: Statement) -> OrmResult<Vec<Row>>;

    /// Run an insert with RETURNING, yielding the created row.
    async fn insert(&self, statement: Statement) -> OrmResult<Row>;

    /// Run an update with RETURNING, yielding the affected rows.
    async fn update(&self, statement: Statement) -> OrmResult<Vec<Row>>;

    /// Run a delete with RETURNING, yielding the removed rows.
    async fn remove(&self, statement: Statement) -> OrmResult<Vec<Row>>;

    /// Run an arbitrary statement, returning the affected-row count.
    async fn execute(&self, statement: Statement) -> OrmResult<u64>;

    /// Schema create; the compiled DDL is idempotent.
    async fn create(&self, statement: Statement) -> OrmResult<()>;

    /// Schema alter; statements run in order.
    async fn alter(&self, statements: Vec<Statement>) -> OrmResult<()>;

    /// Schema drop.
    async fn drop(&self, statement: Statement) -> OrmResult<()>;

    /// Relation-existence probe.
    async fn exists(&self, statement: Statement) -> OrmResult<bool>;

    /// Begin a transaction; migration task lists run inside exactly one.
    async fn begin(&self) -> OrmResult<Box<dyn DatastoreTransaction>>;
}

/// An open datastore transaction.
#[async_trait]
pub trait DatastoreTransaction: Send {
    /// Run a statement inside the transaction.
    async fn execute(&mut self, statement: Statement) -> OrmResult<u64>;

    async fn commit(self: Box<Self>) -> OrmResult<()>;

    async fn rollback(self: Box<Self>) -> OrmResult<()>;
}
