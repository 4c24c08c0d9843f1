//! Reference programs.
//!
//! Both follow the same shape: every peer computes something locally,
//! sends it to a master peer, crosses a single barrier, and the
//! master aggregates what it received during cleanup.
//!
//! Which peer is the master is decided by each program, not by the
//! runtime. An election is any pure function of the peer count, so
//! every peer picks the same master without talking to anyone.

use crate::context::{BspContext, BspProgram};
use crate::errors::{BspError, BspResult};
use crate::registry::{PeerAddress, PeerCount, PeerIndex};

pub mod pi;
pub mod sum;

pub use pi::PiEstimatorBsp;
pub use sum::SumBsp;

/// Deterministically pick one peer of a task.
pub type Election = fn(PeerCount) -> PeerIndex;

/// The peer in the middle, `floor(N / 2)`.
pub fn elect_middle(count: PeerCount) -> PeerIndex {
    PeerIndex(count.0 / 2)
}

/// The first peer.
pub fn elect_first(_count: PeerCount) -> PeerIndex {
    PeerIndex(0)
}

/// The master peer of a program, known once `setup` ran the
/// election.
#[derive(Debug, Clone)]
pub struct Master {
    election: Election,
    address: Option<PeerAddress>,
}

impl Master {
    pub fn new(election: Election) -> Self {
        Self {
            election,
            address: None,
        }
    }

    /// Run the election for this task.
    pub fn elect<P>(&mut self, ctx: &BspContext<'_, P>) -> BspResult<&PeerAddress>
    where
        P: BspProgram + ?Sized,
    {
        let index = (self.election)(ctx.peer_count());
        let address = ctx.peer_name(index.0)?.clone();
        tracing::debug!(master = %address, "Elected master");
        Ok(self.address.insert(address))
    }

    /// The elected master.
    pub fn address(&self) -> BspResult<&PeerAddress> {
        self.address.as_ref().ok_or_else(|| BspError::InvalidPhase {
            operation: "master lookup",
            phase: "Unelected".to_string(),
        })
    }

    pub fn is(&self, peer: &PeerAddress) -> bool {
        self.address.as_ref() == Some(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middle_is_floor_half() {
        let masters: Vec<_> = (1..=6).map(|n| elect_middle(PeerCount(n)).0).collect();
        assert_eq!(masters, vec![0, 1, 1, 2, 2, 3]);
    }

    #[test]
    fn elections_stay_in_range() {
        for n in 1..64 {
            assert!(elect_middle(PeerCount(n)).0 < n);
            assert!(elect_first(PeerCount(n)).0 < n);
        }
    }

    #[test]
    fn master_is_unknown_until_elected() {
        let master = Master::new(elect_middle);
        assert!(matches!(
            master.address(),
            Err(BspError::InvalidPhase { .. })
        ));
    }
}
