use std::fmt::Display;
use std::io::Write;

use crate::errors::BspResult;
use crate::registry::{PeerCount, PeerIndex};

use super::{OutputBuilder, OutputWriter};

/// Print results to standard out as `key<TAB>value` lines.
#[derive(Debug, Clone, Default)]
pub struct StdOutput {}

impl StdOutput {
    pub fn new() -> Self {
        Self {}
    }
}

/// Print output of one peer.
struct StdOutputWriter {}

impl<K: Display, V: Display> OutputWriter<K, V> for StdOutputWriter {
    fn write(&mut self, key: K, value: V) -> BspResult<()> {
        // Lock so lines of different peers don't interleave.
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{key}\t{value}")?;
        Ok(())
    }

    fn flush(&mut self) -> BspResult<()> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

impl<K: Display, V: Display> OutputBuilder<K, V> for StdOutput {
    fn build(
        &self,
        _index: PeerIndex,
        _count: PeerCount,
    ) -> BspResult<Box<dyn OutputWriter<K, V>>> {
        Ok(Box::new(StdOutputWriter {}))
    }
}
