//! Running a task.
//!
//! A task is a [`Job`] executed by `N` peers. [`execute`] is the root
//! of all the action: it builds the [`PeerTable`], starts one peer per
//! thread (or per timely worker), hands each peer its input partition,
//! its output writer and its connection to the barrier, and runs a
//! [`TaskRunner`] on it.
//!
//! Where peers live is decided by the [`ExecutionConfig`]:
//!
//! - [`ExecutionConfig::Local`] runs every peer as a thread of this
//!   process meeting at a [`LocalCoordinator`].
//!
//! - [`ExecutionConfig::Timely`] runs peers as timely workers, either
//!   all in this process or as one process of a cluster. Each process
//!   of a cluster has to be started separately with the same
//!   addresses and its own process id.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use timely::communication::Allocate;
use timely::worker::Worker;

use crate::context::{BspContext, BspProgram};
use crate::coordinator::{ClusterTransport, LocalCoordinator, Transport};
use crate::errors::{panic_message, prepend_tname, tracked_err, BspError, BspResult, Reraise};
use crate::inputs::{InputBuilder, InputCursor};
use crate::outputs::OutputBuilder;
use crate::registry::{PeerCount, PeerIndex, PeerRegistry, PeerTable};
use crate::runner::{TaskReport, TaskRunner};

/// Everything peers need to run a program.
pub struct Job<P: BspProgram> {
    program: Arc<dyn Fn(PeerIndex) -> P + Send + Sync>,
    input: Arc<dyn InputBuilder<P::InKey, P::InValue>>,
    output: Arc<dyn OutputBuilder<P::OutKey, P::OutValue>>,
}

impl<P: BspProgram> Clone for Job<P> {
    fn clone(&self) -> Self {
        Self {
            program: self.program.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
        }
    }
}

impl<P: BspProgram> Job<P> {
    /// `program` is called once per peer, on that peer's thread.
    pub fn new(
        program: impl Fn(PeerIndex) -> P + Send + Sync + 'static,
        input: impl InputBuilder<P::InKey, P::InValue> + 'static,
        output: impl OutputBuilder<P::OutKey, P::OutValue> + 'static,
    ) -> Self {
        Self {
            program: Arc::new(program),
            input: Arc::new(input),
            output: Arc::new(output),
        }
    }

    /// Run a single peer to completion over the given transport.
    fn run_peer<'t>(
        &self,
        registry: PeerRegistry,
        transport: Box<dyn Transport<P::Message> + 't>,
    ) -> BspResult<TaskReport> {
        let index = registry.self_index();
        let count = registry.peer_count();
        let reader = self
            .input
            .build(index, count)
            .reraise("error building input")?;
        let writer = self
            .output
            .build(index, count)
            .reraise("error building output")?;
        let program = (self.program)(index);

        let ctx = BspContext::new(registry, InputCursor::new(reader), writer, transport);
        TaskRunner::new(program, ctx).run()
    }
}

/// Where the peers of a task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionConfig {
    /// `peers` threads in this process.
    Local { peers: usize },
    /// Timely workers. With no `addresses` all workers are in this
    /// process, otherwise this is process `process_id` of a cluster
    /// with one `host:port` per process.
    Timely {
        workers_per_process: usize,
        process_id: usize,
        addresses: Vec<String>,
    },
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::Local { peers: 1 }
    }
}

fn env_var(var: &str) -> BspResult<Option<String>> {
    match std::env::var(var) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(tracked_err(&format!("unable to read {var}: {err}"))),
    }
}

fn env_usize(var: &str) -> BspResult<Option<usize>> {
    env_var(var)?
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|err| tracked_err(&format!("{var}={value:?} is not a number: {err}")))
        })
        .transpose()
}

/// Comma separated list; unset means empty.
fn env_list(var: &str) -> BspResult<Vec<String>> {
    let list = env_var(var)?
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    Ok(list)
}

impl ExecutionConfig {
    /// Read the config from the environment.
    ///
    /// `BULKSYNC_ADDRESSES` (comma separated `host:port` list) or
    /// `BULKSYNC_PROC_ID` select timely execution, together with
    /// `BULKSYNC_WORKERS_PER_PROC`. Otherwise peers are local threads
    /// and `BULKSYNC_PEERS` is their number. Everything defaults to 1
    /// peer in process 0.
    pub fn from_env() -> BspResult<Self> {
        let addresses = env_list("BULKSYNC_ADDRESSES")?;
        let process_id = env_usize("BULKSYNC_PROC_ID")?;

        if !addresses.is_empty() || process_id.is_some() {
            Ok(Self::Timely {
                workers_per_process: env_usize("BULKSYNC_WORKERS_PER_PROC")?.unwrap_or(1),
                process_id: process_id.unwrap_or(0),
                addresses,
            })
        } else {
            Ok(Self::Local {
                peers: env_usize("BULKSYNC_PEERS")?.unwrap_or(1),
            })
        }
    }

    /// Build the peer table for the whole task, including peers in
    /// other processes.
    pub fn peer_table(&self) -> BspResult<PeerTable> {
        match self {
            Self::Local { peers } => PeerTable::local(*peers),
            Self::Timely {
                workers_per_process,
                addresses,
                ..
            } => {
                if addresses.is_empty() {
                    PeerTable::local(*workers_per_process)
                } else {
                    PeerTable::cluster(addresses, *workers_per_process)
                }
            }
        }
    }
}

/// Turn a panic inside a peer into an error of that peer.
fn catch_peer_panic(f: impl FnOnce() -> BspResult<TaskReport>) -> BspResult<TaskReport> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let msg = prepend_tname(panic_message(&*payload));
        tracing::error!("{}", msg.trim_end());
        Err(BspError::PeerPanicked(msg))
    })
}

/// Pick the error to report for a failed run.
///
/// Peers released from a barrier because another peer stopped only
/// report a consequence, so prefer the error of the peer that
/// actually failed.
fn first_failure(mut errors: Vec<BspError>) -> Option<BspError> {
    let primary = errors
        .iter()
        .position(|err| !matches!(err.root_cause(), BspError::PeerDeparted { .. }));
    match primary {
        Some(i) => Some(errors.swap_remove(i)),
        None => errors.into_iter().next(),
    }
}

/// Collect per-peer results, in peer order.
fn gather(mut results: Vec<(PeerIndex, BspResult<TaskReport>)>) -> BspResult<Vec<TaskReport>> {
    results.sort_by_key(|(index, _)| *index);

    let mut reports = Vec::new();
    let mut errors = Vec::new();
    for (index, res) in results {
        match res {
            Ok(report) => reports.push(report),
            Err(err) => {
                tracing::debug!(peer = %index, "Peer failed: {err}");
                errors.push(err);
            }
        }
    }
    match first_failure(errors) {
        Some(err) => Err(err),
        None => Ok(reports),
    }
}

fn execute_local<P: BspProgram + 'static>(
    table: Arc<PeerTable>,
    job: Job<P>,
) -> BspResult<Vec<TaskReport>> {
    let count = table.peer_count();
    tracing::info!("Running {} peers on local threads", count.0);
    let coordinator = LocalCoordinator::<P::Message>::new(count);

    // Everything that can fail is done before the first peer starts,
    // so no peer is left waiting for one that never comes.
    let mut peers = Vec::new();
    for index in count.iter() {
        peers.push((
            PeerRegistry::new(table.clone(), index)?,
            coordinator.endpoint(index)?,
        ));
    }

    let results = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for (registry, endpoint) in peers {
            let index = registry.self_index();
            let job = job.clone();
            let handle = std::thread::Builder::new()
                .name(format!("bsp-peer-{index}"))
                .spawn_scoped(scope, move || {
                    catch_peer_panic(|| job.run_peer(registry, Box::new(endpoint)))
                })
                .reraise("error spawning peer thread")?;
            handles.push((index, handle));
        }

        let results: Vec<_> = handles
            .into_iter()
            .map(|(index, handle)| {
                let res = handle.join().unwrap_or_else(|payload| {
                    Err(BspError::PeerPanicked(panic_message(&*payload)))
                });
                (index, res)
            })
            .collect();
        BspResult::Ok(results)
    })?;

    gather(results)
}

/// What a timely worker does during its lifetime.
fn worker_main<A: Allocate, P: BspProgram + 'static>(
    worker: &mut Worker<A>,
    table: Arc<PeerTable>,
    job: &Job<P>,
) -> BspResult<TaskReport> {
    let index = PeerIndex(worker.index());
    if PeerCount(worker.peers()) != table.peer_count() {
        return Err(tracked_err(&format!(
            "timely has {} workers but the peer table has {} peers",
            worker.peers(),
            table.peer_count().0
        )));
    }
    let registry = PeerRegistry::new(table, index)?;
    let transport = ClusterTransport::<A, P::Message>::new(worker);
    job.run_peer(registry, Box::new(transport))
}

fn execute_timely<P: BspProgram + 'static>(
    table: Arc<PeerTable>,
    workers_per_process: usize,
    process_id: usize,
    addresses: Vec<String>,
    job: Job<P>,
) -> BspResult<Vec<TaskReport>> {
    tracing::info!(
        "Running {} workers on process {} of {}",
        workers_per_process,
        process_id,
        addresses.len().max(1)
    );

    let (builders, other) = if addresses.is_empty() {
        timely::CommunicationConfig::Process(workers_per_process)
    } else {
        if process_id >= addresses.len() {
            return Err(tracked_err(&format!(
                "process id {process_id} out of range for {} addresses",
                addresses.len()
            )));
        }
        timely::CommunicationConfig::Cluster {
            threads: workers_per_process,
            process: process_id,
            addresses,
            report: false,
            log_fn: Box::new(|_| None),
        }
    }
    .try_build()
    .reraise("error building timely communication pipeline")?;

    let guards = timely::execute::execute_from::<_, (PeerIndex, BspResult<TaskReport>), _>(
        builders,
        other,
        timely::WorkerConfig::default(),
        move |worker| {
            let index = PeerIndex(worker.index());
            let res = catch_peer_panic(|| worker_main(worker, table.clone(), &job));
            (index, res)
        },
    )
    .reraise("error during execution")?;

    let results = guards
        .join()
        .into_iter()
        .map(|res| res.map_err(BspError::PeerPanicked))
        .collect::<BspResult<Vec<_>>>()?;
    gather(results)
}

/// Run a job to completion.
///
/// Blocks until every peer of this process finished. Returns their
/// reports ordered by peer index. If any peer fails, the whole run
/// fails; output already written by other peers stays written.
pub fn execute<P: BspProgram + 'static>(
    config: ExecutionConfig,
    job: Job<P>,
) -> BspResult<Vec<TaskReport>> {
    let table = Arc::new(config.peer_table()?);
    match config {
        ExecutionConfig::Local { .. } => execute_local(table, job),
        ExecutionConfig::Timely {
            workers_per_process,
            process_id,
            addresses,
        } => execute_timely(table, workers_per_process, process_id, addresses, job),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BspError;
    use crate::inputs::PartitionedInput;
    use crate::outputs::CollectOutput;

    /// Every peer sends its index to every other peer, for `rounds`
    /// supersteps.
    struct AllToAll {
        rounds: u64,
        panic_on: Option<PeerIndex>,
    }

    impl BspProgram for AllToAll {
        type InKey = String;
        type InValue = String;
        type OutKey = PeerIndex;
        type OutValue = Vec<usize>;
        type Message = usize;

        fn bsp(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
            let me = ctx.peer_index();
            if self.panic_on == Some(me) {
                panic!("peer {me} gives up");
            }
            for _ in 0..self.rounds {
                for peer in ctx.all_peer_names().to_vec() {
                    ctx.send_message(&peer, me.0)?;
                }
                ctx.sync()?;
                let got: Vec<_> = ctx.drain_messages().collect();
                ctx.write(me, got)?;
            }
            Ok(())
        }
    }

    fn job(
        rounds: u64,
        panic_on: Option<PeerIndex>,
        output: &CollectOutput<PeerIndex, Vec<usize>>,
    ) -> Job<AllToAll> {
        Job::new(
            move |_index| AllToAll { rounds, panic_on },
            PartitionedInput::<String, String>::new(Vec::new()),
            output.clone(),
        )
    }

    #[test]
    fn local_peers_see_everyone_in_order() {
        let output = CollectOutput::new();
        let reports = execute(ExecutionConfig::Local { peers: 4 }, job(2, None, &output)).unwrap();

        let indices: Vec<_> = reports.iter().map(|r| r.peer.index().0).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(reports.iter().all(|r| r.supersteps == 2));
        assert!(reports.iter().all(|r| r.messages_sent == 8));
        let items = output.items();
        assert_eq!(items.len(), 8);
        for (_peer, _key, got) in items {
            assert_eq!(got, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn timely_process_peers_see_everyone_in_order() {
        let output = CollectOutput::new();
        let config = ExecutionConfig::Timely {
            workers_per_process: 3,
            process_id: 0,
            addresses: Vec::new(),
        };
        let reports = execute(config, job(2, None, &output)).unwrap();

        let names: Vec<_> = reports.iter().map(|r| r.peer.name().to_string()).collect();
        assert_eq!(names, vec!["local#0", "local#1", "local#2"]);
        for (_peer, _key, got) in output.items() {
            assert_eq!(got, vec![0, 1, 2]);
        }
    }

    #[test]
    fn panicking_peer_fails_the_run() {
        let output = CollectOutput::new();
        let err = execute(
            ExecutionConfig::Local { peers: 3 },
            job(1, Some(PeerIndex(1)), &output),
        )
        .unwrap_err();
        match err {
            BspError::PeerPanicked(msg) => {
                assert!(msg.contains("<bsp-peer-1>"));
                assert!(msg.contains("peer 1 gives up"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn zero_peers_is_a_config_error() {
        let output = CollectOutput::new();
        let err = execute(ExecutionConfig::Local { peers: 0 }, job(1, None, &output)).unwrap_err();
        assert!(matches!(err, BspError::Config(_)));
    }

    #[test]
    fn config_from_json() {
        let config: ExecutionConfig = serde_json::from_str(
            r#"{"type": "timely", "workers_per_process": 2, "process_id": 1,
                "addresses": ["localhost:2101", "localhost:2102"]}"#,
        )
        .unwrap();
        let table = config.peer_table().unwrap();
        assert_eq!(table.peer_count(), PeerCount(4));
        assert_eq!(
            table.address_of(PeerIndex(2)).unwrap().name(),
            "localhost:2102#0"
        );
    }

    #[test]
    fn primary_failure_beats_departures() {
        let departed = BspError::PeerDeparted {
            waiting: PeerIndex(0),
            superstep: 0,
            departed: 1,
        };
        let parse = BspError::Parse {
            input: "x".into(),
            reason: "bad".into(),
        };
        let err = first_failure(vec![departed, parse]).unwrap();
        assert!(matches!(err, BspError::Parse { .. }));
    }

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("BULKSYNC_TEST_LIST", " host-a:2101, ,host-b:2101 ");
        assert_eq!(
            env_list("BULKSYNC_TEST_LIST").unwrap(),
            vec!["host-a:2101".to_string(), "host-b:2101".to_string()]
        );
        assert!(env_list("BULKSYNC_TEST_LIST_UNSET").unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_env_list_is_an_error() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        std::env::set_var(
            "BULKSYNC_TEST_BAD_LIST",
            OsStr::from_bytes(b"host-a:2101,\xff"),
        );
        assert!(env_list("BULKSYNC_TEST_BAD_LIST").is_err());
        assert!(env_usize("BULKSYNC_TEST_BAD_LIST").is_err());
    }
}
