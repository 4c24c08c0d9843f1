//! In-process barrier for peers running as threads.
//!
//! All shared state lives behind one mutex. Arrivals count down
//! towards the peer count; the last peer to arrive partitions every
//! pending batch, installs the deliveries, bumps the generation and
//! wakes everybody. Waiters only wait for the generation to change,
//! so a spurious wakeup can never release a peer early.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::errors::{BspError, BspResult};
use crate::message::{partition_by_target, Envelope};
use crate::registry::{PeerCount, PeerIndex};

use super::Transport;

struct BarrierState<M> {
    /// Superstep of the barrier currently filling up.
    superstep: u64,
    /// Bumped every time a barrier releases.
    generation: u64,
    arrived: usize,
    departed: usize,
    /// Outgoing batches of the peers that already arrived.
    pending: Vec<Vec<Envelope<M>>>,
    /// Delivery per target of the last released barrier. Each peer
    /// takes its own entry after waking.
    deliveries: Vec<Vec<Envelope<M>>>,
}

struct Shared<M> {
    count: PeerCount,
    state: Mutex<BarrierState<M>>,
    released: Condvar,
}

impl<M> Shared<M> {
    fn lock(&self) -> BspResult<MutexGuard<'_, BarrierState<M>>> {
        self.state
            .lock()
            .map_err(|_| BspError::PeerPanicked("barrier lock poisoned".into()))
    }
}

/// Barrier shared by a fixed set of in-process peers.
pub struct LocalCoordinator<M> {
    shared: Arc<Shared<M>>,
}

impl<M> LocalCoordinator<M> {
    pub fn new(count: PeerCount) -> Self {
        let state = BarrierState {
            superstep: 0,
            generation: 0,
            arrived: 0,
            departed: 0,
            pending: Vec::with_capacity(count.0),
            deliveries: count.iter().map(|_| Vec::new()).collect(),
        };
        Self {
            shared: Arc::new(Shared {
                count,
                state: Mutex::new(state),
                released: Condvar::new(),
            }),
        }
    }

    /// Connection for one peer.
    ///
    /// Hand out exactly one endpoint per peer index.
    pub fn endpoint(&self, index: PeerIndex) -> BspResult<LocalEndpoint<M>> {
        if index.0 >= self.shared.count.0 {
            return Err(BspError::PeerOutOfRange {
                index: index.0,
                count: self.shared.count.0,
            });
        }
        Ok(LocalEndpoint {
            shared: self.shared.clone(),
            me: index,
            left: false,
        })
    }

    /// One endpoint for every peer, in index order.
    pub fn endpoints(&self) -> Vec<LocalEndpoint<M>> {
        self.shared
            .count
            .iter()
            .map(|me| LocalEndpoint {
                shared: self.shared.clone(),
                me,
                left: false,
            })
            .collect()
    }
}

/// A single peer's handle on a [`LocalCoordinator`].
///
/// Dropping an endpoint counts as leaving.
pub struct LocalEndpoint<M> {
    shared: Arc<Shared<M>>,
    me: PeerIndex,
    left: bool,
}

impl<M> LocalEndpoint<M> {
    pub fn index(&self) -> PeerIndex {
        self.me
    }

    fn departed_err(&self, state: &BarrierState<M>) -> BspError {
        BspError::PeerDeparted {
            waiting: self.me,
            superstep: state.superstep,
            departed: state.departed,
        }
    }
}

impl<M> Transport<M> for LocalEndpoint<M> {
    fn exchange(
        &mut self,
        superstep: u64,
        outgoing: Vec<Envelope<M>>,
    ) -> BspResult<Vec<Envelope<M>>> {
        let count = self.shared.count;
        let mut state = self.shared.lock()?;

        // Someone finished for good, this barrier can never fill.
        if state.departed > 0 {
            return Err(self.departed_err(&state));
        }
        if superstep != state.superstep {
            return Err(BspError::BarrierMismatch {
                peer: self.me,
                got: superstep,
                expected: state.superstep,
            });
        }

        state.pending.push(outgoing);
        state.arrived += 1;
        tracing::trace!(
            peer = %self.me,
            superstep,
            arrived = state.arrived,
            "Arrived at barrier"
        );

        if state.arrived == count.0 {
            let batches = std::mem::take(&mut state.pending);
            state.deliveries = partition_by_target(batches, count);
            state.arrived = 0;
            state.superstep += 1;
            state.generation += 1;
            tracing::debug!(peer = %self.me, superstep, "Barrier released");
            self.shared.released.notify_all();
        } else {
            let generation = state.generation;
            state = self
                .shared
                .released
                .wait_while(state, |state| {
                    state.generation == generation && state.departed == 0
                })
                .map_err(|_| BspError::PeerPanicked("barrier lock poisoned".into()))?;
            if state.generation == generation {
                return Err(self.departed_err(&state));
            }
        }

        Ok(std::mem::take(&mut state.deliveries[self.me.0]))
    }

    fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        // Still mark the departure if the lock is poisoned, waiters
        // are woken either way.
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.departed += 1;
        tracing::trace!(peer = %self.me, departed = state.departed, "Left barrier");
        self.shared.released.notify_all();
    }
}

impl<M> Drop for LocalEndpoint<M> {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::message::Outbox;

    fn spawn_sync(
        mut endpoint: LocalEndpoint<f64>,
        sends: Vec<(usize, f64)>,
        done: mpsc::Sender<(PeerIndex, BspResult<Vec<Envelope<f64>>>)>,
    ) -> thread::JoinHandle<LocalEndpoint<f64>> {
        thread::spawn(move || {
            let mut outbox = Outbox::new(endpoint.index());
            for (target, value) in sends {
                outbox.push(PeerIndex(target), value);
            }
            let res = endpoint.exchange(0, outbox.take());
            done.send((endpoint.index(), res)).unwrap();
            endpoint
        })
    }

    #[test]
    fn all_peers_sending_to_one_target() {
        for n in 1..=6 {
            let coordinator = LocalCoordinator::new(PeerCount(n));
            let (tx, rx) = mpsc::channel();
            let target = n / 2;
            let handles: Vec<_> = coordinator
                .endpoints()
                .into_iter()
                .map(|ep| {
                    let value = ep.index().0 as f64 + 0.5;
                    spawn_sync(ep, vec![(target, value)], tx.clone())
                })
                .collect();

            let mut results: Vec<_> = (0..n).map(|_| rx.recv().unwrap()).collect();
            results.sort_by_key(|(index, _)| *index);
            for (index, res) in results {
                let delivery = res.unwrap();
                if index.0 == target {
                    assert_eq!(delivery.len(), n);
                    let sum: f64 = delivery.iter().map(|env| env.payload).sum();
                    let expected: f64 = (0..n).map(|i| i as f64 + 0.5).sum();
                    assert_eq!(sum, expected);
                } else {
                    assert!(delivery.is_empty(), "phantom messages on peer {index}");
                }
            }
            for handle in handles {
                handle.join().unwrap();
            }
        }
    }

    #[test]
    fn barrier_waits_for_the_last_peer() {
        let coordinator = LocalCoordinator::new(PeerCount(3));
        let mut endpoints = coordinator.endpoints().into_iter();
        let (tx, rx) = mpsc::channel();

        let first = spawn_sync(endpoints.next().unwrap(), vec![], tx.clone());
        let second = spawn_sync(endpoints.next().unwrap(), vec![], tx.clone());
        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "peer released before everyone arrived"
        );

        let third = spawn_sync(endpoints.next().unwrap(), vec![], tx);
        for _ in 0..3 {
            let (_index, res) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(res.unwrap().is_empty());
        }
        for handle in [first, second, third] {
            handle.join().unwrap();
        }
    }

    #[test]
    fn early_departure_releases_waiters_with_error() {
        let coordinator = LocalCoordinator::new(PeerCount(2));
        let mut endpoints = coordinator.endpoints().into_iter();
        let (tx, rx) = mpsc::channel();

        let waiter = spawn_sync(endpoints.next().unwrap(), vec![(1, 1.0)], tx);
        drop(endpoints.next().unwrap());

        let (_index, res) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            res,
            Err(BspError::PeerDeparted { departed: 1, .. })
        ));
        waiter.join().unwrap();
    }

    #[test]
    fn mismatched_superstep_is_rejected() {
        let coordinator = LocalCoordinator::<f64>::new(PeerCount(1));
        let mut endpoint = coordinator.endpoint(PeerIndex(0)).unwrap();
        assert!(endpoint.exchange(0, Vec::new()).unwrap().is_empty());
        assert!(matches!(
            endpoint.exchange(5, Vec::new()),
            Err(BspError::BarrierMismatch {
                got: 5,
                expected: 1,
                ..
            })
        ));
        assert!(coordinator.endpoint(PeerIndex(1)).is_err());
    }
}
