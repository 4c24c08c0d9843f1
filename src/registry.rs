//! Peer identity and addressing.
//!
//! Every task has a single [`PeerTable`] which maps ordinals
//! `0..N` to [`PeerAddress`]es. It is built once before any peer
//! starts and never changes, so every peer resolves the same ordinal
//! to the same address without talking to anyone.
//!
//! Each peer sees the table through its own [`PeerRegistry`], which
//! additionally knows which entry is "me".

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{BspError, BspResult};

/// Ordinal of a peer within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerIndex(pub usize);

impl Display for PeerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Number of peers in a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCount(pub usize);

impl PeerCount {
    /// Iterate through all peer indices in this task.
    pub fn iter(&self) -> impl Iterator<Item = PeerIndex> {
        (0..self.0).map(PeerIndex)
    }
}

/// Stable, resolvable address of a peer.
///
/// Addresses are totally ordered by their ordinal, so sorting by
/// address and sorting by index is the same thing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    index: PeerIndex,
    name: Arc<str>,
}

impl PeerAddress {
    pub fn index(&self) -> PeerIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// The task-wide ordinal to address table.
#[derive(Debug)]
pub struct PeerTable {
    addresses: Vec<PeerAddress>,
    by_name: HashMap<Arc<str>, PeerIndex>,
}

impl PeerTable {
    /// Build a table from explicit names. Ordinal `i` gets `names[i]`.
    pub fn new<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> BspResult<Self> {
        let mut addresses = Vec::new();
        let mut by_name = HashMap::new();
        for (i, name) in names.into_iter().enumerate() {
            let name: Arc<str> = Arc::from(name.as_ref());
            if by_name.insert(name.clone(), PeerIndex(i)).is_some() {
                return Err(BspError::Config(format!("duplicate peer name {name:?}")));
            }
            addresses.push(PeerAddress {
                index: PeerIndex(i),
                name,
            });
        }
        if addresses.is_empty() {
            return Err(BspError::Config("a task needs at least one peer".into()));
        }
        Ok(Self { addresses, by_name })
    }

    /// Table for `count` peers living in this process.
    pub fn local(count: usize) -> BspResult<Self> {
        Self::new((0..count).map(|i| format!("local#{i}")))
    }

    /// Table for a cluster of processes each running the same number
    /// of peer threads.
    ///
    /// Matches how timely numbers workers: `process * threads + thread`.
    pub fn cluster(process_addresses: &[String], threads_per_process: usize) -> BspResult<Self> {
        if threads_per_process == 0 {
            return Err(BspError::Config(
                "need at least one peer per process".into(),
            ));
        }
        Self::new(process_addresses.iter().flat_map(|proc_addr| {
            (0..threads_per_process).map(move |thread| format!("{proc_addr}#{thread}"))
        }))
    }

    pub fn peer_count(&self) -> PeerCount {
        PeerCount(self.addresses.len())
    }

    pub fn address_of(&self, index: PeerIndex) -> BspResult<&PeerAddress> {
        self.addresses
            .get(index.0)
            .ok_or(BspError::PeerOutOfRange {
                index: index.0,
                count: self.addresses.len(),
            })
    }

    pub fn resolve(&self, name: &str) -> BspResult<&PeerAddress> {
        self.by_name
            .get(name)
            .map(|index| &self.addresses[index.0])
            .ok_or_else(|| BspError::UnknownPeer(name.to_string()))
    }

    /// Is this exact address part of the table?
    ///
    /// An address from another task with the same ordinal but a
    /// different name does not count.
    pub fn contains(&self, addr: &PeerAddress) -> bool {
        self.addresses.get(addr.index.0) == Some(addr)
    }

    pub fn addresses(&self) -> &[PeerAddress] {
        &self.addresses
    }
}

/// One peer's view of the [`PeerTable`].
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    table: Arc<PeerTable>,
    me: PeerIndex,
}

impl PeerRegistry {
    pub fn new(table: Arc<PeerTable>, me: PeerIndex) -> BspResult<Self> {
        table.address_of(me)?;
        Ok(Self { table, me })
    }

    pub fn address_of(&self, index: PeerIndex) -> BspResult<&PeerAddress> {
        self.table.address_of(index)
    }

    pub fn self_address(&self) -> &PeerAddress {
        &self.table.addresses[self.me.0]
    }

    pub fn self_index(&self) -> PeerIndex {
        self.me
    }

    pub fn peer_count(&self) -> PeerCount {
        self.table.peer_count()
    }

    pub fn all_addresses(&self) -> &[PeerAddress] {
        self.table.addresses()
    }

    pub fn resolve(&self, name: &str) -> BspResult<&PeerAddress> {
        self.table.resolve(name)
    }

    pub fn contains(&self, addr: &PeerAddress) -> bool {
        self.table.contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_view_resolves_the_same_address() {
        let table = Arc::new(PeerTable::local(5).unwrap());
        let views: Vec<_> = (0..5)
            .map(|i| PeerRegistry::new(table.clone(), PeerIndex(i)).unwrap())
            .collect();

        let middle = PeerIndex(5 / 2);
        let expected = views[0].address_of(middle).unwrap().clone();
        for view in &views {
            assert_eq!(view.address_of(middle).unwrap(), &expected);
        }
        assert_eq!(expected.name(), "local#2");
    }

    #[test]
    fn out_of_range_is_an_error() {
        let table = PeerTable::local(2).unwrap();
        let err = table.address_of(PeerIndex(2)).unwrap_err();
        assert!(matches!(
            err,
            BspError::PeerOutOfRange { index: 2, count: 2 }
        ));
        assert!(PeerRegistry::new(Arc::new(table), PeerIndex(9)).is_err());
    }

    #[test]
    fn cluster_numbering_matches_timely() {
        let procs = vec!["a:2101".to_string(), "b:2102".to_string()];
        let table = PeerTable::cluster(&procs, 2).unwrap();
        let names: Vec<_> = table.addresses().iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["a:2101#0", "a:2101#1", "b:2102#0", "b:2102#1"]);
        assert_eq!(table.resolve("b:2102#0").unwrap().index(), PeerIndex(2));
    }

    #[test]
    fn duplicate_and_foreign_names_rejected() {
        assert!(matches!(
            PeerTable::new(["x", "x"]),
            Err(BspError::Config(_))
        ));

        let ours = PeerTable::new(["x", "y"]).unwrap();
        let theirs = PeerTable::new(["z", "w"]).unwrap();
        let foreign = theirs.address_of(PeerIndex(0)).unwrap();
        assert!(!ours.contains(foreign));
        assert!(ours.contains(ours.address_of(PeerIndex(1)).unwrap()));
        assert!(matches!(ours.resolve("z"), Err(BspError::UnknownPeer(_))));
    }

    #[test]
    fn addresses_order_by_ordinal() {
        let table = PeerTable::local(12).unwrap();
        let mut shuffled: Vec<_> = table.addresses().iter().rev().cloned().collect();
        shuffled.sort();
        let indices: Vec<_> = shuffled.iter().map(|a| a.index().0).collect();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());
    }
}
