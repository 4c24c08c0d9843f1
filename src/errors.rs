//! Error types shared by every part of the runtime.
//!
//! Everything fallible returns [`BspResult`]. There are no retries
//! anywhere in this crate: every error is fatal to the peer that hits
//! it, which in turn fails the whole task run.
//!
//! Use [`Reraise::reraise`] when propagating an error across a layer
//! so the final message carries both the location where it was
//! re-raised and a short description of what was being attempted.

use std::panic::Location;

use crate::registry::{PeerAddress, PeerIndex};

/// Result type used in the crate.
pub type BspResult<T> = Result<T, BspError>;

#[derive(Debug, thiserror::Error)]
pub enum BspError {
    /// A peer ordinal outside `0..N`.
    #[error("peer index {index} out of range for {count} peers")]
    PeerOutOfRange { index: usize, count: usize },

    /// A destination that is not part of this task.
    #[error("unknown peer {0:?}")]
    UnknownPeer(String),

    /// `current_message` was called on an empty mailbox.
    #[error("mailbox of peer {peer} is empty")]
    MailboxUnderrun { peer: PeerAddress },

    /// An operation was called in a phase that does not allow it.
    #[error("{operation} is not allowed while peer is in phase {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: String,
    },

    /// A peer arrived at a barrier for a different superstep than the
    /// rest of the task.
    #[error("peer {peer} arrived at barrier for superstep {got} but the task is at {expected}")]
    BarrierMismatch {
        peer: PeerIndex,
        got: u64,
        expected: u64,
    },

    /// Some peer finished its task while others were still waiting at
    /// a barrier.
    #[error("peer {waiting} waits at superstep {superstep} but {departed} peer(s) already finished")]
    PeerDeparted {
        waiting: PeerIndex,
        superstep: u64,
        departed: usize,
    },

    /// A peer thread panicked.
    #[error("peer thread panicked: {0}")]
    PeerPanicked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unable to parse {input:?}: {reason}")]
    Parse { input: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Errors from the timely communication layer, which only reports
    /// strings.
    #[error("communication error: {0}")]
    Communication(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Another error, wrapped with where and why it was re-raised.
    #[error("{context}\nCaused by => {source}")]
    Context {
        context: String,
        #[source]
        source: Box<BspError>,
    },
}

impl BspError {
    /// Strip any [`BspError::Context`] layers.
    pub fn root_cause(&self) -> &BspError {
        match self {
            BspError::Context { source, .. } => source.root_cause(),
            err => err,
        }
    }
}

/// Add context to anything that can be converted into a
/// [`BspResult`].
pub trait Reraise<T> {
    /// Only this needs to be implemented.
    fn into_bsp_result(self) -> BspResult<T>;

    /// Make the existing error part of the chain and add a message
    /// prefixed with the caller's location.
    ///
    /// Example:
    ///     writer.flush().reraise("error flushing output")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> BspResult<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_bsp_result().map_err(|err| BspError::Context {
            context: prepend_caller(caller, msg),
            source: Box::new(err),
        })
    }
}

impl<T> Reraise<T> for BspResult<T> {
    fn into_bsp_result(self) -> BspResult<T> {
        self
    }
}

impl<T> Reraise<T> for std::io::Result<T> {
    fn into_bsp_result(self) -> BspResult<T> {
        self.map_err(BspError::from)
    }
}

impl<T> Reraise<T> for rusqlite::Result<T> {
    fn into_bsp_result(self) -> BspResult<T> {
        self.map_err(BspError::from)
    }
}

impl<T> Reraise<T> for Result<T, String> {
    fn into_bsp_result(self) -> BspResult<T> {
        self.map_err(BspError::Communication)
    }
}

impl<T> Reraise<T> for Result<T, opentelemetry::trace::TraceError> {
    fn into_bsp_result(self) -> BspResult<T> {
        self.map_err(|err| BspError::Telemetry(err.to_string()))
    }
}

/// Build a configuration error with location tracking.
#[track_caller]
pub(crate) fn tracked_err(msg: &str) -> BspError {
    let caller = Location::caller();
    BspError::Config(prepend_caller(caller, msg))
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Turn a panic payload into something printable.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(err) = payload.downcast_ref::<BspError>() {
        err.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else {
        "unknown error".to_string()
    }
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}
