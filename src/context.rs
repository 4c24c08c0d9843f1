//! The per-peer facade user programs talk to.
//!
//! A [`BspProgram`] never sees the registry, the input, the output or
//! the coordinator directly. Everything goes through its
//! [`BspContext`], which also enforces the peer life cycle:
//!
//! ```text
//! Created -> Setup -> Compute(0) -> Compute(1) -> ... -> Cleanup -> Finished
//!                          \____ sync() ____/
//! ```
//!
//! Sent messages go into a private outbox and are only handed to the
//! coordinator on [`BspContext::sync`]. The mailbox is only ever
//! replaced by the result of a barrier, so messages sent during
//! superstep `k` become readable exactly when superstep `k + 1`
//! starts.

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::coordinator::Transport;
use crate::errors::{BspError, BspResult, Reraise};
use crate::inputs::InputCursor;
use crate::message::{Mailbox, Message, Outbox};
use crate::metrics::PeerMetrics;
use crate::outputs::OutputWriter;
use crate::registry::{PeerAddress, PeerCount, PeerIndex, PeerRegistry};
use crate::with_timer;

/// A program every peer of a task runs.
///
/// All peers run the same program concurrently. The only way peers
/// learn anything about each other is through messages, which are
/// exchanged at [`BspContext::sync`].
pub trait BspProgram {
    type InKey: 'static;
    type InValue: 'static;
    type OutKey: 'static;
    type OutValue: 'static;
    type Message: Message;

    /// Called once before [`BspProgram::bsp`]. The peer table is
    /// already resolved, so this is the place to pick well-known
    /// peers like a master.
    fn setup(&mut self, _ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        Ok(())
    }

    /// The computation. Can read input, send messages and call
    /// [`BspContext::sync`] any number of times.
    fn bsp(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()>;

    /// Called once after [`BspProgram::bsp`] returns. Messages
    /// delivered by the last barrier are still readable here.
    fn cleanup(&mut self, _ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        Ok(())
    }
}

/// Where a peer is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Created,
    Setup,
    Compute { superstep: u64 },
    Cleanup,
    Finished,
}

impl Display for PeerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerPhase::Created => f.write_str("Created"),
            PeerPhase::Setup => f.write_str("Setup"),
            PeerPhase::Compute { superstep } => write!(f, "Compute({superstep})"),
            PeerPhase::Cleanup => f.write_str("Cleanup"),
            PeerPhase::Finished => f.write_str("Finished"),
        }
    }
}

/// Peer-local bookkeeping, reported when the peer finishes.
#[derive(Debug, Clone, Default)]
pub(crate) struct PeerStats {
    pub(crate) supersteps: u64,
    pub(crate) records_read: u64,
    pub(crate) messages_sent: u64,
    pub(crate) messages_received: u64,
    pub(crate) counters: BTreeMap<String, u64>,
}

/// Everything a peer can do.
pub struct BspContext<'a, P: BspProgram + ?Sized> {
    registry: PeerRegistry,
    phase: PeerPhase,
    superstep: u64,
    input: InputCursor<P::InKey, P::InValue>,
    output: Box<dyn OutputWriter<P::OutKey, P::OutValue> + 'a>,
    transport: Box<dyn Transport<P::Message> + 'a>,
    outbox: Outbox<P::Message>,
    mailbox: Mailbox<P::Message>,
    stats: PeerStats,
    metrics: PeerMetrics,
}

impl<'a, P: BspProgram + ?Sized> BspContext<'a, P> {
    pub fn new(
        registry: PeerRegistry,
        input: InputCursor<P::InKey, P::InValue>,
        output: Box<dyn OutputWriter<P::OutKey, P::OutValue> + 'a>,
        transport: Box<dyn Transport<P::Message> + 'a>,
    ) -> Self {
        let me = registry.self_index();
        let metrics = PeerMetrics::new(registry.self_address());
        Self {
            registry,
            phase: PeerPhase::Created,
            superstep: 0,
            input,
            output,
            transport,
            outbox: Outbox::new(me),
            mailbox: Mailbox::new(),
            stats: PeerStats::default(),
            metrics,
        }
    }

    fn check_phase(&self, operation: &'static str, allowed: bool) -> BspResult<()> {
        if allowed {
            Ok(())
        } else {
            Err(BspError::InvalidPhase {
                operation,
                phase: self.phase.to_string(),
            })
        }
    }

    /// Queue a message for `target`. It will be readable by `target`
    /// after the next barrier.
    ///
    /// Fails if `target` is not a peer of this task, or if there is
    /// no next barrier because the peer is cleaning up.
    pub fn send_message(&mut self, target: &PeerAddress, msg: P::Message) -> BspResult<()> {
        self.check_phase(
            "send_message",
            matches!(self.phase, PeerPhase::Setup | PeerPhase::Compute { .. }),
        )?;
        if !self.registry.contains(target) {
            return Err(BspError::UnknownPeer(target.name().to_string()));
        }
        tracing::trace!(to = %target, superstep = self.superstep, "Send message");
        self.outbox.push(target.index(), msg);
        Ok(())
    }

    /// Like [`BspContext::send_message`] but addressed by peer name.
    pub fn send_message_to(&mut self, name: &str, msg: P::Message) -> BspResult<()> {
        let target = self.registry.resolve(name)?.clone();
        self.send_message(&target, msg)
    }

    /// Block until every peer reached this barrier, then start the
    /// next superstep with the mailbox holding exactly the messages
    /// sent to this peer during the one that just ended.
    pub fn sync(&mut self) -> BspResult<()> {
        let superstep = match self.phase {
            PeerPhase::Compute { superstep } => superstep,
            _ => return self.check_phase("sync", false),
        };

        let sent = self.outbox.len() as u64;
        let outgoing = self.outbox.take();
        let delivery = with_timer!(
            self.metrics.sync_duration,
            self.metrics.labels,
            self.transport.exchange(superstep, outgoing)
        )
        .reraise(&format!("error in barrier for superstep {superstep}"))?;

        let received = delivery.len() as u64;
        let dropped = self.mailbox.replace(delivery);
        if dropped > 0 {
            tracing::debug!(superstep, dropped, "Dropped unread messages");
        }

        self.stats.messages_sent += sent;
        self.stats.messages_received += received;
        self.stats.supersteps += 1;
        self.metrics.messages_sent.add(sent, &self.metrics.labels);
        self.metrics.messages_delivered.add(received, &self.metrics.labels);
        self.metrics.supersteps.add(1, &self.metrics.labels);

        self.superstep = superstep + 1;
        self.phase = PeerPhase::Compute {
            superstep: self.superstep,
        };
        tracing::debug!(superstep = self.superstep, sent, received, "Superstep started");
        Ok(())
    }

    /// Number of messages still readable in the mailbox.
    pub fn num_current_messages(&self) -> usize {
        self.mailbox.len()
    }

    /// Pop the next message of the mailbox.
    ///
    /// Reading more messages than [`BspContext::num_current_messages`]
    /// reported is a bug in the program and fails.
    pub fn current_message(&mut self) -> BspResult<P::Message> {
        self.mailbox.pop().ok_or_else(|| BspError::MailboxUnderrun {
            peer: self.registry.self_address().clone(),
        })
    }

    /// Pop every remaining message of the mailbox.
    pub fn drain_messages(&mut self) -> impl Iterator<Item = P::Message> + '_ + use<'_, 'a, P> {
        std::iter::from_fn(move || self.mailbox.pop())
    }

    /// Drop all unread messages.
    pub fn clear_messages(&mut self) {
        self.mailbox.clear();
    }

    pub fn peer_name(&self, index: usize) -> BspResult<&PeerAddress> {
        self.registry.address_of(PeerIndex(index))
    }

    pub fn own_peer_name(&self) -> &PeerAddress {
        self.registry.self_address()
    }

    pub fn peer_index(&self) -> PeerIndex {
        self.registry.self_index()
    }

    pub fn num_peers(&self) -> usize {
        self.registry.peer_count().0
    }

    pub fn peer_count(&self) -> PeerCount {
        self.registry.peer_count()
    }

    pub fn all_peer_names(&self) -> &[PeerAddress] {
        self.registry.all_addresses()
    }

    pub fn resolve_peer(&self, name: &str) -> BspResult<&PeerAddress> {
        self.registry.resolve(name)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// The current superstep. Starts at 0 and goes up by one on every
    /// [`BspContext::sync`].
    pub fn superstep(&self) -> u64 {
        self.superstep
    }

    pub fn phase(&self) -> PeerPhase {
        self.phase
    }

    /// Next record of this peer's input partition, `None` once it is
    /// exhausted.
    pub fn read_next(&mut self) -> BspResult<Option<(P::InKey, P::InValue)>> {
        self.check_phase("read_next", self.phase != PeerPhase::Finished)?;
        self.input.next()
    }

    /// Append a result to this peer's output.
    pub fn write(&mut self, key: P::OutKey, value: P::OutValue) -> BspResult<()> {
        self.check_phase(
            "write",
            !matches!(self.phase, PeerPhase::Created | PeerPhase::Finished),
        )?;
        self.output.write(key, value)
    }

    /// Add to a named peer-local counter, reported when the peer
    /// finishes.
    pub fn increment_counter(&mut self, name: &str, amount: u64) {
        *self.stats.counters.entry(name.to_string()).or_default() += amount;
    }

    pub(crate) fn enter(&mut self, phase: PeerPhase) {
        tracing::trace!(from = %self.phase, to = %phase, "Phase change");
        self.phase = phase;
    }

    /// Flush output and leave the barrier for good.
    pub(crate) fn finish(&mut self) -> BspResult<PeerStats> {
        self.transport.leave();
        self.output.flush().reraise("error flushing output")?;
        self.enter(PeerPhase::Finished);
        self.stats.records_read = self.input.consumed();
        Ok(self.stats.clone())
    }
}
