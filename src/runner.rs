//! Life cycle of a single peer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::context::{BspContext, BspProgram, PeerPhase};
use crate::errors::{BspResult, Reraise};
use crate::registry::PeerAddress;

/// What a peer did, returned once it finished.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub peer: PeerAddress,
    /// Barriers crossed.
    pub supersteps: u64,
    pub records_read: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// User counters, see [`BspContext::increment_counter`].
    pub counters: BTreeMap<String, u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Drives one peer through setup, computation and cleanup.
pub struct TaskRunner<'a, P: BspProgram> {
    program: P,
    ctx: BspContext<'a, P>,
}

impl<'a, P: BspProgram> TaskRunner<'a, P> {
    pub fn new(program: P, ctx: BspContext<'a, P>) -> Self {
        Self { program, ctx }
    }

    /// Run the peer to completion.
    ///
    /// Any error aborts the peer; output already written stays
    /// written. The barrier is left either way so peers still waiting
    /// for this one find out instead of hanging.
    #[instrument(name = "peer", skip_all, fields(peer = %self.ctx.own_peer_name()))]
    pub fn run(mut self) -> BspResult<TaskReport> {
        let started_at = Utc::now();
        tracing::info!("Peer {} of {} starting up", self.ctx.peer_index(), self.ctx.num_peers());

        let res = self.run_phases();
        if let Err(err) = &res {
            tracing::error!("Peer failed: {err}");
        }
        let stats = self.ctx.finish();
        res?;
        let stats = stats?;

        let report = TaskReport {
            peer: self.ctx.own_peer_name().clone(),
            supersteps: stats.supersteps,
            records_read: stats.records_read,
            messages_sent: stats.messages_sent,
            messages_received: stats.messages_received,
            counters: stats.counters,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            supersteps = report.supersteps,
            records_read = report.records_read,
            "Peer finished"
        );
        Ok(report)
    }

    fn run_phases(&mut self) -> BspResult<()> {
        let Self { program, ctx } = self;

        ctx.enter(PeerPhase::Setup);
        tracing::debug_span!("setup")
            .in_scope(|| program.setup(ctx))
            .reraise("error in setup")?;

        ctx.enter(PeerPhase::Compute { superstep: 0 });
        tracing::debug_span!("bsp")
            .in_scope(|| program.bsp(ctx))
            .reraise("error in bsp")?;

        ctx.enter(PeerPhase::Cleanup);
        tracing::debug_span!("cleanup")
            .in_scope(|| program.cleanup(ctx))
            .reraise("error in cleanup")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::coordinator::LocalCoordinator;
    use crate::errors::BspError;
    use crate::inputs::InputCursor;
    use crate::outputs::{CollectOutput, OutputBuilder};
    use crate::registry::{PeerCount, PeerIndex, PeerRegistry, PeerTable};

    /// Records the phase every hook runs in.
    #[derive(Default)]
    struct PhaseProbe {
        seen: Vec<PeerPhase>,
        fail_in_bsp: bool,
    }

    impl BspProgram for PhaseProbe {
        type InKey = String;
        type InValue = String;
        type OutKey = String;
        type OutValue = u64;
        type Message = u64;

        fn setup(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
            self.seen.push(ctx.phase());
            Ok(())
        }

        fn bsp(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
            self.seen.push(ctx.phase());
            ctx.write("before".to_string(), 1)?;
            if self.fail_in_bsp {
                return Err(BspError::Parse {
                    input: "x".into(),
                    reason: "bad".into(),
                });
            }
            ctx.sync()?;
            self.seen.push(ctx.phase());
            Ok(())
        }

        fn cleanup(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
            self.seen.push(ctx.phase());
            ctx.increment_counter("cleanups", 1);
            Ok(())
        }
    }

    fn context(output: &CollectOutput<String, u64>) -> BspContext<'static, PhaseProbe> {
        let table = Arc::new(PeerTable::local(1).unwrap());
        let coordinator = LocalCoordinator::new(PeerCount(1));
        BspContext::new(
            PeerRegistry::new(table, PeerIndex(0)).unwrap(),
            InputCursor::empty(),
            output.build(PeerIndex(0), PeerCount(1)).unwrap(),
            Box::new(coordinator.endpoint(PeerIndex(0)).unwrap()),
        )
    }

    #[test]
    fn hooks_run_in_order() {
        let output = CollectOutput::new();
        let runner = TaskRunner::new(PhaseProbe::default(), context(&output));
        let report = runner.run().unwrap();

        assert_eq!(report.supersteps, 1);
        assert_eq!(report.counters.get("cleanups"), Some(&1));
        assert_eq!(report.peer.name(), "local#0");
        assert!(report.started_at <= report.finished_at);
    }

    #[test]
    fn phases_seen_by_hooks() {
        let output = CollectOutput::new();
        let mut runner = TaskRunner::new(PhaseProbe::default(), context(&output));
        runner.run_phases().unwrap();
        assert_eq!(
            runner.program.seen,
            vec![
                PeerPhase::Setup,
                PeerPhase::Compute { superstep: 0 },
                PeerPhase::Compute { superstep: 1 },
                PeerPhase::Cleanup,
            ]
        );
    }

    #[test]
    fn failure_keeps_partial_output() {
        let output = CollectOutput::new();
        let program = PhaseProbe {
            fail_in_bsp: true,
            ..Default::default()
        };
        let err = TaskRunner::new(program, context(&output)).run().unwrap_err();
        assert!(matches!(err.root_cause(), BspError::Parse { .. }));
        assert_eq!(output.items().len(), 1);
    }
}
