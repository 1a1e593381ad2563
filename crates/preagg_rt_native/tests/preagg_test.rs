use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use preagg_core::chunk::{ChunkedRowSource, RowChunk, RowSource};
use preagg_core::config::PreAggConfig;
use preagg_core::datum::{Datum, PartialRow};
use preagg_core::device::Device;
use preagg_core::dispatch::{PreAggHandle, PreAggStream};
use preagg_core::explain::ExplainConfig;
use preagg_core::kernels::ReductionKernels;
use preagg_core::kernels::aggregate::{AggregateKind, GroupKey, GroupedAggregateKernels};
use preagg_core::mode::ReductionMode;
use preagg_core::output::{PreAggOutput, merge_partial_rows};
use preagg_core::plan::PlanEstimates;
use preagg_error::Result;
use preagg_rt_native::{DeviceOptions, NativeExecutor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn options(memory_bytes: usize) -> DeviceOptions {
    DeviceOptions {
        num_streams: 4,
        parallelism_width: 16,
        memory_bytes,
    }
}

fn count_sum_kernels() -> Arc<GroupedAggregateKernels> {
    Arc::new(GroupedAggregateKernels::new(
        [GroupKey::int(0)],
        [AggregateKind::Count(None), AggregateKind::Sum(1)],
    ))
}

/// Rows of (key, value) with `key = i % groups`, `value = i`.
fn int_rows(n: i64, groups: i64) -> Vec<Vec<Datum>> {
    (0..n)
        .map(|i| vec![Datum::Int64(i % groups), Datum::Int64(i)])
        .collect()
}

/// Expected (count, sum) per key.
fn expected(rows: &[Vec<Datum>]) -> BTreeMap<i64, (i64, i64)> {
    let mut out = BTreeMap::new();
    for row in rows {
        let key = row[0].try_as_i64().unwrap();
        let val = row[1].try_as_i64().unwrap();
        let ent = out.entry(key).or_insert((0, 0));
        ent.0 += 1;
        ent.1 += val;
    }
    out
}

#[derive(Debug, Default)]
struct Collected {
    groups: Vec<PartialRow>,
    fallback: Vec<RowChunk>,
    batches: usize,
}

fn collect(stream: &mut PreAggStream, kernels: &dyn ReductionKernels) -> Result<Collected> {
    let mut drained = Vec::new();
    let mut collected = Collected::default();
    while let Some(output) = stream.next_output()? {
        match output {
            PreAggOutput::Groups(batch) => {
                collected.batches += 1;
                drained.extend(batch.rows);
            }
            PreAggOutput::Fallback(chunk) => collected.fallback.push(chunk),
        }
    }
    collected.groups = merge_partial_rows(kernels, drained)?;
    Ok(collected)
}

fn as_count_sum(groups: &[PartialRow]) -> BTreeMap<i64, (i64, i64)> {
    groups
        .iter()
        .map(|row| {
            (
                row[0].try_as_i64().unwrap(),
                (row[1].try_as_i64().unwrap(), row[2].try_as_i64().unwrap()),
            )
        })
        .collect()
}

#[test]
fn grouped_modes_produce_same_result() {
    logutil::init_test();
    let rows = int_rows(10_000, 3);
    let want = expected(&rows);
    let k = count_sum_kernels();

    for mode in [ReductionMode::Local, ReductionMode::Global, ReductionMode::Final] {
        let config = PreAggConfig {
            force_reduction_mode: Some(mode),
            ..Default::default()
        };
        let exec = NativeExecutor::try_new_with_options(options(1 << 30), config).unwrap();
        let source = ChunkedRowSource::from_rows(rows.clone(), 2500);
        let mut stream = exec
            .execute(k.clone(), PlanEstimates::default(), Box::new(source))
            .unwrap();

        let got = collect(&mut stream, k.as_ref()).unwrap();
        assert_eq!(want, as_count_sum(&got.groups), "mode: {mode:?}");
        assert!(got.fallback.is_empty());

        let stats = stream.statistics();
        assert_eq!(4, stats.tasks.total());
        assert_eq!(stats.buffers_created, stats.buffers_drained);
        assert_eq!(mode.as_str(), stats.tasks.policy(ReductionMode::Undecided));
        assert_eq!(0, exec.device().memory().used(), "mode: {mode:?}");
    }
}

#[test]
fn overflow_replaces_buffer_without_losing_groups() {
    logutil::init_test();
    let config = PreAggConfig {
        transfer_chunk_bytes: 1,
        buffer_slack_rows: 0,
        ..Default::default()
    };
    let plan = PlanEstimates {
        rows: 5000.0,
        groups: 4.0,
        chunks: 10,
        extra_bytes_per_group: 0,
    };
    let rows = int_rows(5000, 50);
    let want = expected(&rows);
    let k = count_sum_kernels();

    let exec = NativeExecutor::try_new_with_options(options(1 << 30), config).unwrap();
    let source = ChunkedRowSource::from_rows(rows, 500);
    let mut stream = exec.execute(k.clone(), plan, Box::new(source)).unwrap();

    let got = collect(&mut stream, k.as_ref()).unwrap();
    assert_eq!(want, as_count_sum(&got.groups));

    let stats = stream.statistics();
    assert!(stats.overflow_retries > 0, "stats: {stats:?}");
    assert!(stats.buffers_created > 1, "stats: {stats:?}");
    assert!(stats.max_buffer_nrooms >= 50, "stats: {stats:?}");
    assert_eq!(stats.buffers_created as usize, stats.buffer_nrooms.len());
    assert!(
        stats.buffer_nrooms.windows(2).all(|w| w[0] <= w[1]),
        "nrooms: {:?}",
        stats.buffer_nrooms
    );
    assert!(stats.buffer_nrooms[0] < stats.max_buffer_nrooms);
    assert_eq!(stats.buffers_created, stats.buffers_drained);
    assert_eq!(stats.buffers_created as usize, got.batches);
    assert_eq!(0, exec.device().memory().used());
}

#[test]
fn text_keys_overflow_extra_area() {
    logutil::init_test();
    let config = PreAggConfig {
        transfer_chunk_bytes: 1,
        buffer_slack_rows: 0,
        ..Default::default()
    };
    let plan = PlanEstimates {
        rows: 2000.0,
        groups: 10.0,
        chunks: 4,
        extra_bytes_per_group: 0,
    };
    let k = Arc::new(GroupedAggregateKernels::new(
        [GroupKey::text(0)],
        [AggregateKind::Count(None), AggregateKind::MaxText(1)],
    ));
    let rows: Vec<_> = (0..2000)
        .map(|i| {
            vec![
                Datum::text(format!("key_{}", i % 40)),
                Datum::text(format!("val_{i:05}")),
            ]
        })
        .collect();

    let exec = NativeExecutor::try_new_with_options(options(1 << 30), config).unwrap();
    let source = ChunkedRowSource::from_rows(rows, 500);
    let mut stream = exec.execute(k.clone(), plan, Box::new(source)).unwrap();

    let got = collect(&mut stream, k.as_ref()).unwrap();
    assert_eq!(40, got.groups.len());
    for row in &got.groups {
        assert_eq!(Some(50), row[1].try_as_i64());
        let key: usize = row[0].try_as_str().unwrap()["key_".len()..].parse().unwrap();
        assert_eq!(Some(format!("val_{:05}", 1960 + key).as_str()), row[2].try_as_str());
    }

    let stats = stream.statistics();
    assert_eq!(stats.buffers_drained, stats.fixup_kernel_launches);
    assert!(stats.overflow_retries > 0);
    assert_eq!(0, exec.device().memory().used());
}

#[test]
fn incompatible_chunk_falls_back() {
    logutil::init_test();
    let mut rows = int_rows(300, 5);
    rows[150][1] = Datum::text("not a number");
    let k = count_sum_kernels();

    let exec = NativeExecutor::try_new_with_options(options(1 << 30), PreAggConfig::default())
        .unwrap();
    let source = ChunkedRowSource::from_rows(rows.clone(), 100);
    let mut stream = exec
        .execute(k.clone(), PlanEstimates::default(), Box::new(source))
        .unwrap();

    let got = collect(&mut stream, k.as_ref()).unwrap();
    assert_eq!(1, got.fallback.len());
    assert_eq!(rows[100..200], got.fallback[0].rows[..]);

    let mut device_rows = rows[..100].to_vec();
    device_rows.extend_from_slice(&rows[200..]);
    assert_eq!(expected(&device_rows), as_count_sum(&got.groups));
    assert_eq!(100, stream.statistics().fallback_rows);
}

#[test]
fn underestimated_block_chunk_regrows() {
    logutil::init_test();
    let rows = int_rows(400, 7);
    let want = expected(&rows);
    let k = count_sum_kernels();

    // Each chunk claims a single block of 10 rows but holds 100.
    let chunks: Vec<_> = rows
        .chunks(100)
        .map(|rows| RowChunk::new_block(1, 10, rows.to_vec()))
        .collect();

    let exec = NativeExecutor::try_new_with_options(options(1 << 30), PreAggConfig::default())
        .unwrap();
    let mut stream = exec
        .execute(
            k.clone(),
            PlanEstimates::default(),
            Box::new(ChunkedRowSource::new(chunks)),
        )
        .unwrap();

    let got = collect(&mut stream, k.as_ref()).unwrap();
    assert_eq!(want, as_count_sum(&got.groups));

    let stats = stream.statistics();
    assert_eq!(4, stats.regrow_retries);
    assert_eq!(4, stats.tasks.total());
    assert_eq!(0, exec.device().memory().used());
}

#[test]
fn nogroup_aggregate() {
    logutil::init_test();
    let k = Arc::new(GroupedAggregateKernels::new(
        [],
        [AggregateKind::Count(None), AggregateKind::Sum(0)],
    ));
    let rows: Vec<_> = (0..1000).map(|i| vec![Datum::Int64(i)]).collect();

    let exec = NativeExecutor::try_new_with_options(options(1 << 30), PreAggConfig::default())
        .unwrap();
    let mut stream = exec
        .execute(
            k.clone(),
            PlanEstimates::default(),
            Box::new(ChunkedRowSource::from_rows(rows, 128)),
        )
        .unwrap();

    let got = collect(&mut stream, k.as_ref()).unwrap();
    assert_eq!(
        vec![vec![Datum::Int64(1000), Datum::Int64(499_500)]],
        got.groups
    );
    assert_eq!("NoGroup", stream.statistics().tasks.policy(ReductionMode::Undecided));
}

#[test]
fn transient_out_of_memory_recovers() {
    logutil::init_test();
    let rows = int_rows(2000, 11);
    let want = expected(&rows);
    let k = count_sum_kernels();

    let exec = NativeExecutor::try_new_with_options(options(1 << 30), PreAggConfig::default())
        .unwrap();
    exec.device().memory().inject_failures(5);

    let mut stream = exec
        .execute(
            k.clone(),
            PlanEstimates::default(),
            Box::new(ChunkedRowSource::from_rows(rows, 250)),
        )
        .unwrap();

    let got = collect(&mut stream, k.as_ref()).unwrap();
    assert_eq!(want, as_count_sum(&got.groups));
    assert_eq!(0, exec.device().memory().used());
}

#[test]
fn fatal_kernel_error_aborts() {
    logutil::init_test();
    // Key column doesn't exist.
    let k = Arc::new(GroupedAggregateKernels::new(
        [GroupKey::int(5)],
        [AggregateKind::Count(None)],
    ));

    let exec = NativeExecutor::try_new_with_options(options(1 << 30), PreAggConfig::default())
        .unwrap();
    let mut stream = exec
        .execute(
            k,
            PlanEstimates::default(),
            Box::new(ChunkedRowSource::from_rows(int_rows(1000, 3), 100)),
        )
        .unwrap();

    let err = loop {
        match stream.next_output() {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("expected error"),
            Err(err) => break err,
        }
    };
    assert!(err.get_msg().contains("column"), "err: {err}");
    assert!(stream.next_output().unwrap().is_none());

    let stats = stream.statistics();
    assert_eq!(0, stats.buffers_drained);
    assert_eq!(stats.buffers_created, stats.buffers_discarded);
    assert_eq!(0, exec.device().memory().used());
}

/// Source that cancels the execution once a number of chunks have been
/// pulled.
#[derive(Debug)]
struct CancellingSource {
    inner: ChunkedRowSource,
    cancel_after: usize,
    pulled: usize,
    handle: Arc<Mutex<Option<PreAggHandle>>>,
}

impl RowSource for CancellingSource {
    fn next_chunk(&mut self) -> Result<Option<RowChunk>> {
        self.pulled += 1;
        if self.pulled == self.cancel_after {
            if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                handle.cancel();
            }
        }
        self.inner.next_chunk()
    }

    fn rescan(&mut self) -> Result<()> {
        self.pulled = 0;
        self.inner.rescan()
    }
}

#[test]
fn cancel_mid_execution() {
    logutil::init_test();
    let k = count_sum_kernels();
    let config = PreAggConfig {
        max_inflight_tasks: 2,
        ..Default::default()
    };
    let exec = NativeExecutor::try_new_with_options(options(1 << 30), config).unwrap();

    let slot = Arc::new(Mutex::new(None));
    let source = CancellingSource {
        inner: ChunkedRowSource::from_rows(int_rows(50_000, 100), 100),
        cancel_after: 10,
        pulled: 0,
        handle: slot.clone(),
    };
    let mut stream = exec
        .execute(k, PlanEstimates::default(), Box::new(source))
        .unwrap();
    let handle = stream.handle();
    *slot.lock().unwrap() = Some(handle.clone());

    let err = stream.next_output().unwrap_err();
    assert_eq!("Query canceled", err.get_msg());

    let stats = handle.statistics();
    assert!(stats.tasks.total() < 500, "stats: {stats:?}");
    assert_eq!(1, stats.buffers_created);
    assert_eq!(0, stats.buffers_drained);
    assert_eq!(1, stats.buffers_discarded);
    assert_eq!(0, exec.device().memory().used());
}

#[test]
fn dropped_stream_releases_device_memory() {
    logutil::init_test();
    let k = count_sum_kernels();
    let exec = NativeExecutor::try_new_with_options(options(1 << 30), PreAggConfig::default())
        .unwrap();

    // First chunk falls back, giving us an output while other tasks are
    // still running.
    let mut rows = int_rows(10_000, 10);
    rows[0][1] = Datum::text("fallback");
    let mut stream = exec
        .execute(
            k,
            PlanEstimates::default(),
            Box::new(ChunkedRowSource::from_rows(rows, 100)),
        )
        .unwrap();
    let handle = stream.handle();

    let output = stream.next_output().unwrap().unwrap();
    assert!(matches!(output, PreAggOutput::Fallback(_)));
    drop(stream);

    let stats = handle.statistics();
    assert_eq!(
        stats.buffers_created,
        stats.buffers_drained + stats.buffers_discarded
    );
    assert_eq!(0, exec.device().memory().used());
}

#[test]
fn rescan_runs_again() {
    logutil::init_test();
    let rows = int_rows(1000, 4);
    let want = expected(&rows);
    let k = count_sum_kernels();

    let exec = NativeExecutor::try_new_with_options(options(1 << 30), PreAggConfig::default())
        .unwrap();
    let mut stream = exec
        .execute(
            k.clone(),
            PlanEstimates::default(),
            Box::new(ChunkedRowSource::from_rows(rows, 100)),
        )
        .unwrap();
    let first = collect(&mut stream, k.as_ref()).unwrap();
    assert_eq!(want, as_count_sum(&first.groups));

    let source = stream.into_source().unwrap();
    let mut stream = exec
        .execute(k.clone(), PlanEstimates::default(), source)
        .unwrap();
    let second = collect(&mut stream, k.as_ref()).unwrap();
    assert_eq!(want, as_count_sum(&second.groups));
}

#[test]
fn explain_reports_policy() {
    logutil::init_test();
    let k = count_sum_kernels();
    let config = PreAggConfig {
        force_reduction_mode: Some(ReductionMode::Global),
        ..Default::default()
    };
    let exec = NativeExecutor::try_new_with_options(options(1 << 30), config).unwrap();
    let mut stream = exec
        .execute(
            k.clone(),
            PlanEstimates::default(),
            Box::new(ChunkedRowSource::from_rows(int_rows(1000, 4), 100)),
        )
        .unwrap();
    collect(&mut stream, k.as_ref()).unwrap();

    let ent = stream.explain_entry(ExplainConfig::default());
    let display = ent.to_string();
    assert!(display.starts_with("GpuPreAgg ("), "explain: {display}");
    assert!(display.contains("reduction = Global"), "explain: {display}");
    assert!(display.contains("tasks = 10"), "explain: {display}");
}

#[test]
fn random_inputs_match_host_aggregation() {
    logutil::init_test();
    let k = count_sum_kernels();

    for seed in 0..8 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let num_rows: usize = rng.random_range(1..5000);
        let num_groups: i64 = rng.random_range(1..500);
        let rows: Vec<_> = (0..num_rows)
            .map(|_| {
                vec![
                    Datum::Int64(rng.random_range(0..num_groups)),
                    Datum::Int64(rng.random_range(-100..100)),
                ]
            })
            .collect();
        let want = expected(&rows);

        let config = PreAggConfig {
            transfer_chunk_bytes: 1,
            buffer_slack_rows: rng.random_range(0..20),
            max_inflight_tasks: rng.random_range(1..8),
            ..Default::default()
        };
        let plan = PlanEstimates {
            rows: num_rows as f64,
            groups: f64::from(rng.random_range(1..50u32)),
            chunks: 10,
            extra_bytes_per_group: 0,
        };
        let exec = NativeExecutor::try_new_with_options(options(1 << 30), config).unwrap();
        let rows_per_chunk: usize = rng.random_range(1..1000);
        let mut stream = exec
            .execute(
                k.clone(),
                plan,
                Box::new(ChunkedRowSource::from_rows(rows, rows_per_chunk)),
            )
            .unwrap();

        let got = collect(&mut stream, k.as_ref()).unwrap();
        assert_eq!(want, as_count_sum(&got.groups), "seed: {seed}");

        let stats = stream.statistics();
        assert_eq!(stats.buffers_created, stats.buffers_drained, "seed: {seed}");
        assert!(
            stats.buffer_nrooms.windows(2).all(|w| w[0] <= w[1]),
            "seed: {seed}, nrooms: {:?}",
            stats.buffer_nrooms
        );
        assert_eq!(0, exec.device().memory().used(), "seed: {seed}");
    }
}
