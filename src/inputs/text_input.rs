use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{BspResult, Reraise};
use crate::registry::{PeerCount, PeerIndex};

use super::{distribute, InputBuilder, RecordReader};

/// Read `key<TAB>value` lines.
///
/// Everything before the first tab is the key, the rest of the line
/// is the value. A line without a tab is all key and has an empty
/// value. Line endings (`\n` or `\r\n`) are not part of the value.
pub struct KeyValueTextReader<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> KeyValueTextReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

impl<R: BufRead> RecordReader<String, String> for KeyValueTextReader<R> {
    fn next(&mut self) -> BspResult<Option<(String, String)>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let line = self
            .line
            .strip_suffix('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .unwrap_or(&self.line);
        let record = match line.split_once('\t') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (line.to_string(), String::new()),
        };
        Ok(Some(record))
    }
}

/// Read text files one after the other.
///
/// Files are opened lazily, when the previous one is exhausted.
struct FileChainReader {
    paths: VecDeque<PathBuf>,
    current: Option<KeyValueTextReader<BufReader<File>>>,
}

impl RecordReader<String, String> for FileChainReader {
    fn next(&mut self) -> BspResult<Option<(String, String)>> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                if let Some(record) = reader.next()? {
                    return Ok(Some(record));
                }
                self.current = None;
            }
            match self.paths.pop_front() {
                Some(path) => {
                    tracing::debug!(path = %path.display(), "Opening input file");
                    let file = File::open(&path)
                        .reraise(&format!("error opening input file {}", path.display()))?;
                    self.current = Some(KeyValueTextReader::new(BufReader::new(file)));
                }
                None => return Ok(None),
            }
        }
    }
}

/// Read `key<TAB>value` text files, spread over peers.
///
/// File `i` is read by peer `i % N`. With fewer files than peers,
/// some peers read nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextFileInput {
    pub paths: Vec<PathBuf>,
}

impl TextFileInput {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl InputBuilder<String, String> for TextFileInput {
    fn build(
        &self,
        index: PeerIndex,
        count: PeerCount,
    ) -> BspResult<Box<dyn RecordReader<String, String>>> {
        let paths: VecDeque<_> = distribute(self.paths.iter().cloned(), index, count).collect();
        tracing::debug!(peer = %index, files = paths.len(), "Built text file input");
        Ok(Box::new(FileChainReader {
            paths,
            current: None,
        }))
    }
}
