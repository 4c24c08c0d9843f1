use std::sync::{Arc, Mutex};

use crate::errors::{BspError, BspResult};
use crate::registry::{PeerCount, PeerIndex};

use super::{OutputBuilder, OutputWriter};

/// Collect every peer's results into one shared vector.
///
/// Clones share the same vector, so keep a clone around to read the
/// results after the task finished.
#[derive(Debug)]
pub struct CollectOutput<K, V> {
    items: Arc<Mutex<Vec<(PeerIndex, K, V)>>>,
}

impl<K, V> Clone for CollectOutput<K, V> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<K, V> Default for CollectOutput<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CollectOutput<K, V> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Everything written so far, tagged with the writing peer.
    ///
    /// Still readable after a peer panicked while holding the lock.
    pub fn items(&self) -> Vec<(PeerIndex, K, V)>
    where
        K: Clone,
        V: Clone,
    {
        match self.items.lock() {
            Ok(items) => items.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

struct CollectWriter<K, V> {
    peer: PeerIndex,
    items: Arc<Mutex<Vec<(PeerIndex, K, V)>>>,
}

impl<K, V> OutputWriter<K, V> for CollectWriter<K, V> {
    fn write(&mut self, key: K, value: V) -> BspResult<()> {
        self.items
            .lock()
            .map_err(|_| BspError::PeerPanicked("collect output lock poisoned".into()))?
            .push((self.peer, key, value));
        Ok(())
    }
}

impl<K, V> OutputBuilder<K, V> for CollectOutput<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    fn build(&self, index: PeerIndex, _count: PeerCount) -> BspResult<Box<dyn OutputWriter<K, V>>> {
        Ok(Box::new(CollectWriter {
            peer: index,
            items: self.items.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_keys_are_kept() {
        let output = CollectOutput::new();
        let mut first = output.build(PeerIndex(0), PeerCount(2)).unwrap();
        let mut second = output.build(PeerIndex(1), PeerCount(2)).unwrap();
        first.write("Sum".to_string(), 1.0).unwrap();
        second.write("Sum".to_string(), 2.0).unwrap();

        assert_eq!(
            output.items(),
            vec![
                (PeerIndex(0), "Sum".to_string(), 1.0),
                (PeerIndex(1), "Sum".to_string(), 2.0),
            ]
        );
    }

    #[test]
    fn items_survive_a_poisoned_lock() {
        let output = CollectOutput::new();
        let mut writer = output.build(PeerIndex(0), PeerCount(1)).unwrap();
        writer.write("Sum".to_string(), 1.0).unwrap();

        let items = output.items.clone();
        let res = std::thread::spawn(move || {
            let _guard = items.lock().unwrap();
            panic!("peer died holding the lock");
        })
        .join();
        assert!(res.is_err());
        assert!(output.items.is_poisoned());

        assert_eq!(output.items(), vec![(PeerIndex(0), "Sum".to_string(), 1.0)]);
    }
}
