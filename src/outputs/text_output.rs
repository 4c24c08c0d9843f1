use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{BspResult, Reraise};
use crate::registry::{PeerCount, PeerIndex};

use super::{OutputBuilder, OutputWriter};

/// Write `key<TAB>value` lines into one file per peer.
///
/// Files are named like `"part-00003"` after the peer index and are
/// created in an existing directory. Use a distinct directory per
/// task, existing part files are truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextFileOutput {
    pub dir: PathBuf,
}

impl TextFileOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn part_file(&self, index: PeerIndex) -> PathBuf {
        part_file(&self.dir, index)
    }
}

fn part_file(dir: &Path, index: PeerIndex) -> PathBuf {
    dir.join(format!("part-{:05}", index.0))
}

struct TextFileWriter {
    out: BufWriter<File>,
}

impl<K: Display, V: Display> OutputWriter<K, V> for TextFileWriter {
    fn write(&mut self, key: K, value: V) -> BspResult<()> {
        writeln!(self.out, "{key}\t{value}")?;
        Ok(())
    }

    fn flush(&mut self) -> BspResult<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

impl<K: Display, V: Display> OutputBuilder<K, V> for TextFileOutput {
    fn build(&self, index: PeerIndex, _count: PeerCount) -> BspResult<Box<dyn OutputWriter<K, V>>> {
        let path = self.part_file(index);
        let file = File::create(&path)
            .reraise(&format!("error creating output file {}", path.display()))?;
        tracing::debug!(peer = %index, path = %path.display(), "Opened text output");
        Ok(Box::new(TextFileWriter {
            out: BufWriter::new(file),
        }))
    }
}
