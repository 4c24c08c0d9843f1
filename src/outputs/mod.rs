//! Output for peers.
//!
//! Architecture
//! ------------
//!
//! Output is based around the core trait of [`OutputWriter`]. Each
//! peer gets its own writer, built by an [`OutputBuilder`] from that
//! peer's index. Writes are append-only: writing the same key twice
//! keeps both records, and there is no ordering between different
//! peers' writes.
//!
//! Nothing written is rolled back if the task fails afterwards.

use crate::errors::BspResult;
use crate::registry::{PeerCount, PeerIndex};

pub mod collect_output;
pub mod sqlite_output;
pub mod std_output;
pub mod text_output;

pub use self::collect_output::CollectOutput;
pub use self::sqlite_output::SqliteOutput;
pub use self::std_output::StdOutput;
pub use self::text_output::TextFileOutput;

/// Defines how final results of a peer are written.
pub trait OutputWriter<K, V> {
    /// Write a single result.
    fn write(&mut self, key: K, value: V) -> BspResult<()>;

    /// Make everything written so far durable.
    ///
    /// Called once when the peer finishes.
    fn flush(&mut self) -> BspResult<()> {
        Ok(())
    }
}

/// Creates the writer for each peer.
pub trait OutputBuilder<K, V>: Send + Sync {
    fn build(&self, index: PeerIndex, count: PeerCount) -> BspResult<Box<dyn OutputWriter<K, V>>>;
}
