use std::cmp::Ordering;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use clap::Parser;
use logutil::LogFormat;
use preagg_core::chunk::{ChunkedRowSource, RowChunk};
use preagg_core::config::PreAggConfig;
use preagg_core::datum::{Datum, PartialRow};
use preagg_core::explain::ExplainConfig;
use preagg_core::kernels::aggregate::{AggregateKind, GroupKey, GroupedAggregateKernels};
use preagg_core::output::{PreAggOutput, merge_partial_rows};
use preagg_core::plan::PlanEstimates;
use preagg_error::{DbError, Result, ResultExt};
use preagg_rt_native::{DeviceOptions, NativeExecutor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

#[derive(Parser)]
#[clap(name = "preagg")]
struct Arguments {
    /// Number of input rows to generate.
    #[clap(long, default_value_t = 100_000)]
    rows: usize,
    /// Number of distinct group keys in the generated input.
    #[clap(long, default_value_t = 100)]
    groups: i64,
    /// Rows per input chunk.
    #[clap(long, default_value_t = 10_000)]
    chunk_rows: usize,
    /// Use text group keys instead of integers.
    #[clap(long)]
    text_keys: bool,
    /// Seed for the data generator.
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// Number of groups the planner expects. Defaults to `groups`.
    ///
    /// Setting this low forces final buffer overflows.
    #[clap(long)]
    plan_groups: Option<f64>,

    /// Number of device streams. Defaults to the number of cpus.
    #[clap(long)]
    threads: Option<usize>,
    /// Threads cooperating in one device block.
    #[clap(long, default_value_t = 32)]
    width: usize,
    /// Device memory in bytes.
    #[clap(long, default_value_t = 1 << 30)]
    memory: usize,

    /// Set an execution setting, e.g. `--set max_inflight_tasks=4`.
    #[clap(long = "set", value_name = "NAME=VALUE")]
    settings: Vec<String>,
    /// Print available settings then exit.
    #[clap(long)]
    list_settings: bool,

    /// Default log level, overridden by RUST_LOG.
    #[clap(long, default_value_t = tracing::Level::WARN)]
    log_level: tracing::Level,
    /// Log output format (human, json).
    #[clap(long, default_value = "human", value_parser = parse_log_format)]
    log_format: LogFormat,

    /// Print results as json.
    #[clap(long)]
    json: bool,
    /// Maximum number of groups to print.
    #[clap(long)]
    limit: Option<usize>,
    /// Include verbose execution details.
    #[clap(long)]
    verbose: bool,
}

fn parse_log_format(s: &str) -> std::result::Result<LogFormat, String> {
    LogFormat::from_name(s).ok_or_else(|| format!("unknown log format: {s}"))
}

/// Runs a grouped aggregate over generated data on the native device.
fn main() {
    let args = Arguments::parse();
    logutil::configure_global_logger(args.log_level, args.log_format, io::stderr);

    if let Err(err) = inner(args) {
        println!("ERROR: {err}");
        std::process::exit(1);
    }
}

#[derive(Debug)]
struct RunResult {
    input_rows: usize,
    groups: Vec<PartialRow>,
    fallback_rows: usize,
}

fn inner(args: Arguments) -> Result<()> {
    let mut stdout = BufWriter::new(io::stdout());

    if args.list_settings {
        for (name, description) in PreAggConfig::describe_settings() {
            writeln!(stdout, "{name}: {description}")?;
        }
        stdout.flush()?;
        return Ok(());
    }

    let mut config = PreAggConfig::default();
    for assignment in &args.settings {
        config.apply_assignment(assignment)?;
    }

    if args.chunk_rows == 0 {
        return Err(DbError::new("'chunk-rows' must be greater than zero"));
    }
    if args.groups <= 0 {
        return Err(DbError::new("'groups' must be greater than zero"));
    }

    let mut options = DeviceOptions {
        parallelism_width: args.width,
        memory_bytes: args.memory,
        ..Default::default()
    };
    if let Some(threads) = args.threads {
        options.num_streams = threads;
    }
    let executor = NativeExecutor::try_new_with_options(options, config)?;

    let key = if args.text_keys {
        GroupKey::text(0)
    } else {
        GroupKey::int(0)
    };
    let kernels = Arc::new(GroupedAggregateKernels::new(
        [key],
        [
            AggregateKind::Count(None),
            AggregateKind::Sum(1),
            AggregateKind::Min(1),
            AggregateKind::Max(1),
        ],
    ));

    let chunks = generate_chunks(&args);
    let plan = PlanEstimates {
        rows: args.rows as f64,
        groups: args.plan_groups.unwrap_or(args.groups as f64),
        chunks: chunks.len(),
        extra_bytes_per_group: if args.text_keys { 16 } else { 0 },
    };

    info!(rows = args.rows, chunks = chunks.len(), "starting pre-aggregation");
    let mut stream = executor.execute(
        kernels.clone(),
        plan,
        Box::new(ChunkedRowSource::new(chunks)),
    )?;

    let mut drained = Vec::new();
    let mut fallback_rows = 0;
    while let Some(output) = stream.next_output()? {
        match output {
            PreAggOutput::Groups(batch) => drained.extend(batch.rows),
            PreAggOutput::Fallback(chunk) => fallback_rows += chunk.num_rows(),
        }
    }

    let mut groups = merge_partial_rows(kernels.as_ref(), drained)?;
    groups.sort_by(|a, b| compare_keys(&a[0], &b[0]));

    let result = RunResult {
        input_rows: args.rows,
        groups,
        fallback_rows,
    };
    let explain = stream.explain_entry(ExplainConfig {
        verbose: args.verbose,
    });

    if args.json {
        let limit = args.limit.unwrap_or(result.groups.len());
        let groups: Vec<Vec<String>> = result
            .groups
            .iter()
            .take(limit)
            .map(|row| row.iter().map(|d| d.to_string()).collect())
            .collect();
        let value = serde_json::json!({
            "input_rows": result.input_rows,
            "num_groups": result.groups.len(),
            "groups": groups,
            "fallback_rows": result.fallback_rows,
            "statistics": stream.statistics(),
            "explain": explain,
        });
        let s = serde_json::to_string_pretty(&value).context("Failed to serialize output")?;
        writeln!(stdout, "{s}")?;
    } else {
        writeln!(
            stdout,
            "input rows: {}, groups: {}",
            result.input_rows,
            result.groups.len()
        )?;
        writeln!(stdout, "key\tcount\tsum\tmin\tmax")?;
        let limit = args.limit.unwrap_or(result.groups.len());
        for row in result.groups.iter().take(limit) {
            let line: Vec<_> = row.iter().map(|d| d.to_string()).collect();
            writeln!(stdout, "{}", line.join("\t"))?;
        }
        if limit < result.groups.len() {
            writeln!(stdout, "... {} more", result.groups.len() - limit)?;
        }
        if result.fallback_rows > 0 {
            writeln!(stdout, "fallback rows: {}", result.fallback_rows)?;
        }
        writeln!(stdout, "{explain}")?;
    }

    stdout.flush()?;
    Ok(())
}

fn generate_chunks(args: &Arguments) -> Vec<RowChunk> {
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let mut chunks = Vec::with_capacity(args.rows.div_ceil(args.chunk_rows));
    let mut remaining = args.rows;

    while remaining > 0 {
        let n = remaining.min(args.chunk_rows);
        let rows = (0..n)
            .map(|_| {
                let key = rng.random_range(0..args.groups);
                let key = if args.text_keys {
                    Datum::text(format!("group_{key:06}"))
                } else {
                    Datum::Int64(key)
                };
                vec![key, Datum::Int64(rng.random_range(-1000..1000))]
            })
            .collect();
        chunks.push(RowChunk::new(rows));
        remaining -= n;
    }

    chunks
}

fn compare_keys(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Int64(a), Datum::Int64(b)) => a.cmp(b),
        (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
        // Nulls last.
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Null, _) => Ordering::Greater,
        (_, Datum::Null) => Ordering::Less,
        _ => a.to_string().cmp(&b.to_string()),
    }
}
