//! Monte Carlo estimation of pi.
//!
//! Every peer throws darts at the square `[-1, 1]²` in a number of
//! independent batches. The share of darts landing in the unit circle
//! approximates `pi / 4`. Each batch's estimate goes to the master,
//! which writes the mean of all of them.

use serde::{Deserialize, Serialize};

use crate::context::{BspContext, BspProgram};
use crate::errors::{BspError, BspResult};
use crate::registry::PeerIndex;

use super::{elect_middle, Election, Master};

/// Output key of the single result record.
pub const PI_KEY: &str = "Pi";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PiConfig {
    /// Estimates computed by each peer.
    pub batches: usize,
    /// Darts thrown per estimate.
    pub iterations: u64,
    pub seed: u64,
}

impl Default for PiConfig {
    fn default() -> Self {
        Self {
            batches: 4,
            iterations: 100_000,
            seed: 1,
        }
    }
}

impl PiConfig {
    fn batch_seed(&self, peer: PeerIndex, batch: usize) -> u64 {
        // Spread (peer, batch) over the seed space so no two batches
        // of a task share a stream.
        self.seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((peer.0 as u64) << 32)
            .wrapping_add(batch as u64)
    }
}

/// One estimate of pi from `iterations` darts.
pub fn estimate(rng: &fastrand::Rng, iterations: u64) -> f64 {
    let mut hits = 0u64;
    for _ in 0..iterations {
        let x = 2.0 * rng.f64() - 1.0;
        let y = 2.0 * rng.f64() - 1.0;
        if x * x + y * y <= 1.0 {
            hits += 1;
        }
    }
    4.0 * hits as f64 / iterations as f64
}

pub struct PiEstimatorBsp {
    config: PiConfig,
    master: Master,
}

impl PiEstimatorBsp {
    /// Estimate with the master in the middle of the peer table.
    pub fn new(config: PiConfig) -> Self {
        Self::with_election(config, elect_middle)
    }

    pub fn with_election(config: PiConfig, election: Election) -> Self {
        Self {
            config,
            master: Master::new(election),
        }
    }
}

impl BspProgram for PiEstimatorBsp {
    type InKey = String;
    type InValue = String;
    type OutKey = String;
    type OutValue = f64;
    type Message = f64;

    fn setup(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        if self.config.iterations == 0 {
            return Err(BspError::Config("pi needs at least one iteration".into()));
        }
        self.master.elect(ctx)?;
        Ok(())
    }

    fn bsp(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        let master = self.master.address()?.clone();
        let me = ctx.peer_index();
        for batch in 0..self.config.batches {
            let rng = fastrand::Rng::with_seed(self.config.batch_seed(me, batch));
            let pi = estimate(&rng, self.config.iterations);
            tracing::debug!(batch, pi, "Batch done");
            ctx.send_message(&master, pi)?;
        }
        ctx.increment_counter("darts", self.config.batches as u64 * self.config.iterations);
        ctx.sync()
    }

    fn cleanup(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        if !self.master.is(ctx.own_peer_name()) {
            return Ok(());
        }
        let count = ctx.num_current_messages();
        if count == 0 {
            tracing::warn!("No estimates received, nothing to write");
            return Ok(());
        }
        let total: f64 = ctx.drain_messages().sum();
        let pi = total / count as f64;
        tracing::info!(
            pi,
            darts = count as u64 * self.config.iterations,
            "Estimated value of pi"
        );
        ctx.write(PI_KEY.to_string(), pi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{execute, ExecutionConfig, Job};
    use crate::inputs::PartitionedInput;
    use crate::outputs::CollectOutput;

    #[test]
    fn estimate_is_close() {
        let rng = fastrand::Rng::with_seed(7);
        let pi = estimate(&rng, 200_000);
        assert!((pi - std::f64::consts::PI).abs() < 0.05, "got {pi}");
    }

    #[test]
    fn same_seed_same_estimate() {
        let config = PiConfig::default();
        let a = estimate(
            &fastrand::Rng::with_seed(config.batch_seed(PeerIndex(1), 2)),
            1000,
        );
        let b = estimate(
            &fastrand::Rng::with_seed(config.batch_seed(PeerIndex(1), 2)),
            1000,
        );
        assert_eq!(a, b);
        assert_ne!(
            config.batch_seed(PeerIndex(0), 1),
            config.batch_seed(PeerIndex(1), 1)
        );
    }

    #[test]
    fn master_writes_mean() {
        let output = CollectOutput::new();
        let config = PiConfig {
            batches: 2,
            iterations: 20_000,
            seed: 3,
        };
        let job = Job::new(
            move |_index| PiEstimatorBsp::new(config),
            PartitionedInput::<String, String>::new(Vec::new()),
            output.clone(),
        );
        let reports = execute(ExecutionConfig::Local { peers: 4 }, job).unwrap();
        assert!(reports.iter().all(|r| r.counters.get("darts") == Some(&40_000)));

        let items = output.items();
        assert_eq!(items.len(), 1);
        let (peer, key, pi) = &items[0];
        assert_eq!(*peer, PeerIndex(2));
        assert_eq!(key, "Pi");
        assert!((pi - std::f64::consts::PI).abs() < 0.1, "got {pi}");
    }

    #[test]
    fn election_is_pluggable() {
        let output = CollectOutput::new();
        let config = PiConfig {
            batches: 1,
            iterations: 1_000,
            seed: 5,
        };
        let job = Job::new(
            move |_index| PiEstimatorBsp::with_election(config, crate::programs::elect_first),
            PartitionedInput::<String, String>::new(Vec::new()),
            output.clone(),
        );
        execute(ExecutionConfig::Local { peers: 3 }, job).unwrap();

        let peers: Vec<_> = output.items().into_iter().map(|(peer, _, _)| peer).collect();
        assert_eq!(peers, vec![PeerIndex(0)]);
    }
}
