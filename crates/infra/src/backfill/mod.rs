//! Progressive backfill: resumable, chunked ingestion of large resources.
//!
//! Each batch tick advances an active backfill by one chunk of at most
//! `chunk_size` items. The cursor is persisted after every chunk, so a
//! backfill survives crashes, restarts and skipped ticks, and chunks of one
//! resource are always processed in cursor order.

pub mod machine;
pub mod state;
pub mod store;

pub use machine::{BackfillConfig, BackfillMachine, ChunkOutcome};
pub use state::{BackfillState, BackfillStatus};
pub use store::{BackfillStore, InMemoryBackfillStore, PostgresBackfillStore};
