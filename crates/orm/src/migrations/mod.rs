//! Schema migrations
//!
//! A migration script records its intent against a `MigrationRecorder`
//! rather than touching the live schema. The runner replays the recorded
//! task list: schema tasks evolve the in-memory registry eagerly, data
//! tasks compile against the registry as it stood at that point, and the
//! whole list executes inside a single datastore transaction.

pub mod recorder;
pub mod runner;

pub use recorder::{MigrationOp, MigrationRecorder, RecordingModel};
pub use runner::Migrator;

use crate::error::OrmResult;

/// One schema revision. `up` records the forward task list, `down` the
/// inverse. Versions are positive and strictly ordered.
pub trait MigrationScript: Send + Sync {
    fn version(&self) -> i64;

    fn up(&self, recorder: &mut MigrationRecorder) -> OrmResult<()>;

    fn down(&self, recorder: &mut MigrationRecorder) -> OrmResult<()>;
}
