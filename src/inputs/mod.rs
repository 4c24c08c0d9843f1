//! Input for peers.
//!
//! Architecture
//! ------------
//!
//! Input is based around the core trait of [`RecordReader`]: a pull
//! interface returning the next key/value pair of this peer's
//! partition, or `None` once the partition is exhausted. Peers never
//! see a raw reader; [`crate::context::BspContext`] wraps it in an
//! [`InputCursor`] which guarantees the sequence stays exhausted.
//!
//! Which records a peer gets is decided before the task starts by an
//! [`InputBuilder`], which is called once per peer with that peer's
//! index and the peer count. E.g. [`TextFileInput`] spreads a list of
//! files over peers and [`PartitionedInput`] hands each peer an
//! explicit partition.
//!
//! Errors from the underlying storage are fatal. There is no retry
//! here.

use crate::errors::BspResult;
use crate::registry::{PeerCount, PeerIndex};

pub mod partitioned_input;
pub mod text_input;

pub use self::partitioned_input::{PartitionedInput, VecReader};
pub use self::text_input::{KeyValueTextReader, TextFileInput};

/// Defines how a single partition of input is read.
pub trait RecordReader<K, V> {
    /// Return the next record of this partition.
    ///
    /// `Ok(None)` means the partition is exhausted.
    fn next(&mut self) -> BspResult<Option<(K, V)>>;
}

/// Creates the reader for each peer.
pub trait InputBuilder<K, V>: Send + Sync {
    fn build(&self, index: PeerIndex, count: PeerCount) -> BspResult<Box<dyn RecordReader<K, V>>>;
}

/// Forward-only cursor over a peer's partition.
///
/// Once the reader has reported the end, the cursor keeps returning
/// `None` without calling the reader again.
pub struct InputCursor<K, V> {
    reader: Box<dyn RecordReader<K, V>>,
    exhausted: bool,
    consumed: u64,
}

impl<K, V> InputCursor<K, V> {
    pub fn new(reader: Box<dyn RecordReader<K, V>>) -> Self {
        Self {
            reader,
            exhausted: false,
            consumed: 0,
        }
    }

    /// A cursor over nothing.
    pub fn empty() -> Self
    where
        K: 'static,
        V: 'static,
    {
        Self::new(Box::new(VecReader::new(Vec::new())))
    }

    pub fn next(&mut self) -> BspResult<Option<(K, V)>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.reader.next()? {
            Some(record) => {
                self.consumed += 1;
                Ok(Some(record))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of records handed out so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

/// Keep every `count`th item starting at `index`.
pub(crate) fn distribute<T>(
    it: impl IntoIterator<Item = T>,
    index: PeerIndex,
    count: PeerCount,
) -> impl Iterator<Item = T> {
    assert!(index.0 < count.0);
    it.into_iter()
        .enumerate()
        .filter(move |(i, _x)| i % count.0 == index.0)
        .map(|(_i, x)| x)
}
