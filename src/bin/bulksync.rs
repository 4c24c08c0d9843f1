//! Run the reference programs.
//!
//! ```text
//! bulksync --peers 3 sum part-0.txt part-1.txt part-2.txt
//! BULKSYNC_PROC_ID=0 BULKSYNC_ADDRESSES=host-a:2101,host-b:2101 bulksync pi
//! ```

use std::path::PathBuf;

use bulksync::context::BspProgram;
use bulksync::execution::{execute, ExecutionConfig, Job};
use bulksync::inputs::{InputBuilder, PartitionedInput, TextFileInput};
use bulksync::metrics::initialize_metrics;
use bulksync::outputs::{SqliteOutput, StdOutput, TextFileOutput};
use bulksync::programs::pi::PiConfig;
use bulksync::programs::{PiEstimatorBsp, SumBsp};
use bulksync::tracing::{BulksyncTracer, OtlpTracingConfig};
use bulksync::webserver::start_server_runtime_from_env;
use bulksync::{BspError, BspResult, PeerIndex, TaskReport};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bulksync")]
#[command(about = "Run a BSP task")]
struct Cli {
    /// Level of bulksync's own logs; defaults to the BULKSYNC_LOG
    /// filter, or "error"
    #[arg(long)]
    log_level: Option<String>,

    /// Send spans to this OTLP collector
    #[arg(long)]
    otlp_url: Option<String>,

    /// Execution config as JSON, eg. '{"type": "local", "peers": 4}';
    /// defaults to the BULKSYNC_* env vars
    #[arg(long)]
    execution: Option<String>,

    /// Run this many peers as local threads
    #[arg(short, long, conflicts_with = "execution")]
    peers: Option<usize>,

    /// Write the peer reports of this process as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    #[command(flatten)]
    output: OutputArgs,

    #[command(subcommand)]
    command: Command,
}

/// Where results go; standard out if nothing is given.
#[derive(Args, Debug)]
struct OutputArgs {
    /// Write `part-NNNNN` text files into this directory
    #[arg(long, conflicts_with = "sqlite_dir")]
    text_dir: Option<PathBuf>,

    /// Write one SQLite DB per peer into this directory
    #[arg(long)]
    sqlite_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sum `key<TAB>value` text files, spread over peers
    Sum {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Estimate pi by throwing darts
    Pi {
        /// Estimates per peer
        #[arg(long, default_value_t = 4)]
        batches: usize,
        /// Darts per estimate
        #[arg(long, default_value_t = 100_000)]
        iterations: u64,
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

impl Cli {
    fn execution_config(&self) -> BspResult<ExecutionConfig> {
        if let Some(peers) = self.peers {
            Ok(ExecutionConfig::Local { peers })
        } else if let Some(json) = &self.execution {
            Ok(serde_json::from_str(json)?)
        } else {
            ExecutionConfig::from_env()
        }
    }
}

fn run<P>(
    config: ExecutionConfig,
    program: impl Fn(PeerIndex) -> P + Send + Sync + 'static,
    input: impl InputBuilder<String, String> + 'static,
    output: &OutputArgs,
) -> BspResult<Vec<TaskReport>>
where
    P: BspProgram<InKey = String, InValue = String, OutKey = String, OutValue = f64> + 'static,
{
    match (&output.text_dir, &output.sqlite_dir) {
        (Some(dir), _) => execute(config, Job::new(program, input, TextFileOutput::new(dir))),
        (None, Some(dir)) => execute(config, Job::new(program, input, SqliteOutput::new(dir))),
        (None, None) => execute(config, Job::new(program, input, StdOutput::new())),
    }
}

fn main() -> Result<(), BspError> {
    let cli = Cli::parse();

    let service_name = match cli.command {
        Command::Sum { .. } => "bulksync-sum",
        Command::Pi { .. } => "bulksync-pi",
    };
    let otlp = cli
        .otlp_url
        .as_ref()
        .map(|url| OtlpTracingConfig::new(service_name).with_url(url));
    let tracer = BulksyncTracer::new()?;
    let _guard = tracer.setup(otlp, cli.log_level.as_deref())?;
    initialize_metrics()?;
    let _server_rt = start_server_runtime_from_env()?;

    let config = cli.execution_config()?;
    tracing::info!(?config, "Starting task");

    let reports = match &cli.command {
        Command::Sum { inputs } => run(
            config,
            |_index| SumBsp::new(),
            TextFileInput::new(inputs.clone()),
            &cli.output,
        )?,
        Command::Pi {
            batches,
            iterations,
            seed,
        } => {
            let pi = PiConfig {
                batches: *batches,
                iterations: *iterations,
                seed: *seed,
            };
            run(
                config,
                move |_index| PiEstimatorBsp::new(pi),
                PartitionedInput::<String, String>::new(Vec::new()),
                &cli.output,
            )?
        }
    };

    for report in &reports {
        tracing::info!(
            peer = %report.peer,
            supersteps = report.supersteps,
            sent = report.messages_sent,
            received = report.messages_received,
            "Peer report"
        );
    }
    if let Some(path) = &cli.report {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &reports)?;
    }
    Ok(())
}
