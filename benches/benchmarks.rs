use criterion::{criterion_group, criterion_main, Bencher, BenchmarkId, Criterion};

use bulksync::execution::{execute, ExecutionConfig, Job};
use bulksync::inputs::PartitionedInput;
use bulksync::outputs::CollectOutput;
use bulksync::programs::SumBsp;
use bulksync::{BspContext, BspProgram, BspResult};

/// Every peer sends one message to every peer, for a number of
/// supersteps.
struct AllToAll {
    supersteps: u64,
}

impl BspProgram for AllToAll {
    type InKey = String;
    type InValue = String;
    type OutKey = String;
    type OutValue = f64;
    type Message = f64;

    fn bsp(&mut self, ctx: &mut BspContext<'_, Self>) -> BspResult<()> {
        let peers = ctx.all_peer_names().to_vec();
        for _ in 0..self.supersteps {
            for peer in &peers {
                ctx.send_message(peer, 1.0)?;
            }
            ctx.sync()?;
            ctx.clear_messages();
        }
        Ok(())
    }
}

fn bench_supersteps(b: &mut Bencher, config: &ExecutionConfig) {
    b.iter(|| {
        let job = Job::new(
            |_index| AllToAll { supersteps: 100 },
            PartitionedInput::<String, String>::new(Vec::new()),
            CollectOutput::new(),
        );
        execute(config.clone(), job).unwrap()
    });
}

fn bench_sum(b: &mut Bencher, peers: usize) {
    let partitions: Vec<Vec<String>> = (0..peers)
        .map(|i| (0..10_000).map(|j| format!("{}.5", i + j)).collect())
        .collect();
    let input = PartitionedInput::from_values(partitions);
    b.iter(|| {
        let job = Job::new(|_index| SumBsp::new(), input.clone(), CollectOutput::new());
        execute(ExecutionConfig::Local { peers }, job).unwrap()
    });
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier");
    for peers in [2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("threads", peers),
            &ExecutionConfig::Local { peers },
            bench_supersteps,
        );
        group.bench_with_input(
            BenchmarkId::new("timely", peers),
            &ExecutionConfig::Timely {
                workers_per_process: peers,
                process_id: 0,
                addresses: Vec::new(),
            },
            bench_supersteps,
        );
    }
    group.finish();

    let mut group = c.benchmark_group("sum");
    for peers in [1, 4] {
        group.bench_function(BenchmarkId::new("threads", peers), |b| bench_sum(b, peers));
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
