//! Distributed sum.
//!
//! Input values are decimal numbers as text. Every peer adds up its
//! own partition and sends the partial sum to the master, which
//! writes `("Sum", total)` once the barrier delivered all of them.

use crate::context::{BspContext, BspProgram};
use crate::errors::{BspError, BspResult};

use super::{elect_middle, Election, Master};

/// Output key of the single result record.
pub const SUM_KEY: &str = "Sum";

pub struct SumBsp {
    master: Master,
}

impl Default for SumBsp {
    fn default() -> Self {
        Self::new()
    }
}

impl SumBsp {
    /// Sum with the master in the middle of the peer table.
    pub fn new() -> Self {
        Self::with_election(elect_middle)
    }

    pub fn with_election(election: Election) -> Self {
        Self {
            master: Master::new(election),
        }
    }
}

/// Parse a textual input value.
pub fn parse_value(value: &str) -> BspResult<f64> {
    value.trim().parse().map_err(|err| BspError::Parse {
        input: value.to_string(),
        reason: format!("{err}"),
    })
}

impl BspProgram for SumBsp {
    type InKey = String;
    type InValue = String;
    type OutKey = String;
    type OutValue = f64;
    type Message = f64;

    fn setup(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        self.master.elect(ctx)?;
        Ok(())
    }

    fn bsp(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        let mut partial = 0.0;
        while let Some((key, value)) = ctx.read_next()? {
            tracing::trace!(%key, %value, "Read record");
            partial += parse_value(&value)?;
        }

        let master = self.master.address()?.clone();
        tracing::debug!(%master, partial, "Sending partial sum to master");
        ctx.send_message(&master, partial)?;
        ctx.sync()
    }

    fn cleanup(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        if !self.master.is(ctx.own_peer_name()) {
            return Ok(());
        }
        let count = ctx.num_current_messages();
        tracing::info!("Master fetches {count} partial sums");
        let mut sum = 0.0;
        for _ in 0..count {
            sum += ctx.current_message()?;
        }
        tracing::info!(sum, "Writing result");
        ctx.write(SUM_KEY.to_string(), sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{execute, ExecutionConfig, Job};
    use crate::inputs::PartitionedInput;
    use crate::outputs::CollectOutput;
    use crate::programs::elect_first;
    use crate::registry::PeerIndex;

    fn run(
        partitions: Vec<Vec<&str>>,
        peers: usize,
        election: Election,
    ) -> BspResult<Vec<(PeerIndex, String, f64)>> {
        let output = CollectOutput::new();
        let job = Job::new(
            move |_index| SumBsp::with_election(election),
            PartitionedInput::from_values(partitions),
            output.clone(),
        );
        execute(ExecutionConfig::Local { peers }, job)?;
        Ok(output.items())
    }

    #[test]
    fn parses_decimals() {
        assert_eq!(parse_value("5.0").unwrap(), 5.0);
        assert_eq!(parse_value(" 7 ").unwrap(), 7.0);
        assert_eq!(parse_value("-1.5e1").unwrap(), -15.0);
        assert!(matches!(parse_value(""), Err(BspError::Parse { .. })));
        assert!(matches!(parse_value("five"), Err(BspError::Parse { .. })));
    }

    #[test]
    fn three_peers_one_result_on_middle_peer() {
        let items = run(vec![vec!["5.0", "7.0"], vec!["3.0"], vec![]], 3, elect_middle).unwrap();
        assert_eq!(items, vec![(PeerIndex(1), "Sum".to_string(), 15.0)]);
    }

    #[test]
    fn single_peer_is_its_own_master() {
        let items = run(vec![vec!["1.5", "2.5"]], 1, elect_middle).unwrap();
        assert_eq!(items, vec![(PeerIndex(0), "Sum".to_string(), 4.0)]);
    }

    #[test]
    fn election_is_pluggable() {
        let items = run(vec![vec!["1"], vec!["2"], vec!["3"], vec!["4"]], 4, elect_first).unwrap();
        assert_eq!(items, vec![(PeerIndex(0), "Sum".to_string(), 10.0)]);
    }

    #[test]
    fn bad_value_fails_the_run() {
        let err = run(vec![vec!["1.0"], vec!["oops"]], 2, elect_middle).unwrap_err();
        assert!(matches!(err.root_cause(), BspError::Parse { .. }));
    }
}
