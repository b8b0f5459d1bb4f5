//! CLI for the vecmatch embedding and re-ranking pipeline.

// CLI binaries need to print user-facing output
#![allow(
    clippy::print_stdout,
    reason = "CLI binary needs stdout for user output"
)]

use clap::Parser as _;
use eyre::WrapErr as _;
use vecmatch_task::TaskHandle as _;

mod inspect;

const MODEL_REPO: &str = "mixedbread-ai/mxbai-embed-large-v1";

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    match args.command {
        Command::Embed(worker) => embed(&worker)?,
        Command::Rerank(rerank) => run_rerank(&rerank)?,
        Command::LineIndex { input, output } => {
            let output = output.unwrap_or_else(|| vecmatch_queue::index_path_for(&input));
            inspect::line_index(&input, &output)?;
        }
        Command::ShowLine {
            lines,
            index,
            line,
            map,
        } => inspect::show_line(&lines, &index, line, map.as_deref())?,
        Command::ShowQueue { prefix, row } => inspect::show_queue(&prefix, row)?,
        Command::CreateTasks(plan) => create_tasks(&plan)?,
        Command::Tasks { task_dir } => {
            let queue = vecmatch_task::TaskQueue::open(&task_dir, "operator")?;
            for id in queue.task_ids()? {
                println!("{id}\t{}", queue.status_of(&id)?);
            }
        }
        Command::ResumeTask { task_dir, id } => {
            let queue = vecmatch_task::TaskQueue::open(&task_dir, "operator")?;
            let previous = queue.mark_resuming(&id)?;
            println!("{id}: {previous} -> resuming");
        }
        Command::InterruptTask {
            task_dir,
            id,
            cancel,
        } => {
            let queue = vecmatch_task::TaskQueue::open(&task_dir, "operator")?;
            let status = if cancel {
                vecmatch_task::TaskStatus::Canceled
            } else {
                vecmatch_task::TaskStatus::Paused
            };
            queue.interrupt(&id, status)?;
            println!("{id}: {status} requested");
        }
        Command::RequeueOrphans {
            task_dir,
            max_silence,
        } => {
            let queue = vecmatch_task::TaskQueue::open(&task_dir, "operator")?;
            for id in queue.requeue_orphans(std::time::Duration::from_secs(max_silence))? {
                println!("{id}");
            }
        }
    }

    Ok(())
}

#[derive(clap::Parser)]
#[command(name = "vecmatch")]
#[command(about = "Embed line stores and re-rank approximate neighbor candidates")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run an embedding worker against a task directory
    Embed(WorkerArgs),

    /// Recompute exact distances for a candidate queue and write a match report
    Rerank(RerankArgs),

    /// Build the offset index of a newline-delimited line store
    LineIndex {
        /// Line store to scan
        input: std::path::PathBuf,

        /// Where to write the index (defaults to `<input>.index`)
        #[arg(short, long)]
        output: Option<std::path::PathBuf>,
    },

    /// Print one record of a line store
    ShowLine {
        /// Line store
        lines: std::path::PathBuf,

        /// Offset index of the line store
        index: std::path::PathBuf,

        /// Record number (a vector id when --map is given)
        line: u64,

        /// Id map translating vector ids to line numbers (u64 per entry)
        #[arg(long)]
        map: Option<std::path::PathBuf>,
    },

    /// Print the candidates of one queue row
    ShowQueue {
        /// Queue prefix (before `.queues` / `.index`)
        prefix: std::path::PathBuf,

        row: u64,
    },

    /// Split a line store into pending embedding tasks
    CreateTasks(PlanArgs),

    /// List tasks and their status
    Tasks {
        #[arg(long, env = "VECMATCH_TASK_DIR")]
        task_dir: std::path::PathBuf,
    },

    /// Put a failed or paused task back in line, keeping its checkpoint
    ResumeTask {
        #[arg(long, env = "VECMATCH_TASK_DIR")]
        task_dir: std::path::PathBuf,

        id: String,
    },

    /// Ask the worker running a task to pause (or cancel) it
    InterruptTask {
        #[arg(long, env = "VECMATCH_TASK_DIR")]
        task_dir: std::path::PathBuf,

        id: String,

        /// Cancel instead of pausing
        #[arg(long)]
        cancel: bool,
    },

    /// Requeue running tasks whose worker stopped sending heartbeats
    RequeueOrphans {
        #[arg(long, env = "VECMATCH_TASK_DIR")]
        task_dir: std::path::PathBuf,

        /// Seconds without a heartbeat before a task counts as orphaned
        #[arg(long, default_value = "600")]
        max_silence: u64,
    },
}

#[derive(clap::Args)]
struct WorkerArgs {
    /// Directory holding the task documents
    #[arg(long, env = "VECMATCH_TASK_DIR")]
    task_dir: std::path::PathBuf,

    /// Directory whose subdirectories are the buckets tasks refer to
    #[arg(long, env = "VECMATCH_STORE_ROOT")]
    store_root: std::path::PathBuf,

    /// Name this worker claims tasks under
    #[arg(long, env = "VECMATCH_IDENTITY", default_value = "worker")]
    identity: String,

    /// Embedding backend: candle or onnx
    #[arg(long, env = "VECMATCH_BACKEND", default_value = "candle")]
    backend: vecmatch_embed::BackendKind,

    /// HuggingFace repository id of the model
    #[arg(long, default_value = MODEL_REPO)]
    model: String,

    /// Load the model from a local directory instead of the hub
    #[arg(long)]
    model_dir: Option<std::path::PathBuf>,

    #[arg(long, default_value = "512")]
    max_seq_length: usize,

    /// Run the ONNX backend on CUDA
    #[arg(long)]
    gpu: bool,

    /// Lines per embedding call
    #[arg(long, env = "VECMATCH_CHUNK_SIZE", default_value = "100")]
    chunk_size: usize,

    /// Buffered vector bytes per upload part
    #[arg(long, default_value = "8388608")]
    segment_size: usize,

    /// Exit once no task is waiting instead of polling
    #[arg(long)]
    once: bool,

    /// Seconds between polls of an empty task directory
    #[arg(long, default_value = "10")]
    poll_interval: u64,
}

#[derive(clap::Args)]
struct RerankArgs {
    /// Candidate queue prefix (before `.queues` / `.index`)
    #[arg(short, long)]
    queue: std::path::PathBuf,

    /// Report file
    #[arg(short, long, required_unless_present = "summary_only")]
    output: Option<std::path::PathBuf>,

    /// Directory of `{n}.vecs` shard files
    #[arg(long)]
    shards: std::path::PathBuf,

    /// Vector dimension
    #[arg(long, default_value = "1024")]
    dimension: usize,

    /// Vectors per shard file
    #[arg(long, conflicts_with = "shard_capacity")]
    records_per_shard: Option<u64>,

    /// Bytes per shard file
    #[arg(long, required_unless_present = "records_per_shard")]
    shard_capacity: Option<u64>,

    /// Keep candidates at most this far from their row
    #[arg(long)]
    threshold: Option<f32>,

    #[arg(long, value_enum, default_value = "binary")]
    format: ReportFormat,

    /// Count matches without writing a report
    #[arg(long)]
    summary_only: bool,

    /// Line store with `file_id`/`row_id` per vector, for csv reports
    #[arg(long, required_if_eq("format", "csv"))]
    lines: Option<std::path::PathBuf>,

    /// Offset index of --lines (defaults to `<lines>.index`)
    #[arg(long)]
    lines_index: Option<std::path::PathBuf>,

    /// Vector id of the first queue row
    #[arg(long, default_value = "0")]
    row_base: u64,

    /// Candidate pairs evaluated per accelerator batch
    #[arg(long, default_value = "16384")]
    batch_pairs: usize,

    /// Read shards one after another
    #[arg(long)]
    sequential_loads: bool,

    /// Evaluate distances on the CPU even if an accelerator is available
    #[arg(long)]
    cpu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ReportFormat {
    /// One line per kept pair with both rows' external ids
    #[value(alias = "full")]
    Csv,
    /// Kept candidates in the candidate queue format
    #[value(alias = "compact")]
    Binary,
}

#[derive(clap::Args)]
struct PlanArgs {
    #[arg(long, env = "VECMATCH_TASK_DIR")]
    task_dir: std::path::PathBuf,

    #[arg(long, env = "VECMATCH_STORE_ROOT")]
    store_root: std::path::PathBuf,

    /// Bucket holding the line store
    #[arg(long)]
    bucket: String,

    /// Key of the line store
    #[arg(long)]
    strings_key: String,

    /// Key of the line store's offset index
    #[arg(long)]
    index_key: String,

    /// Prefix the per-task vector objects are written under
    #[arg(long)]
    output_key: String,

    /// Handlebars template turning a JSON record into text
    #[arg(long)]
    template: String,

    #[arg(long, default_value = "100000")]
    lines_per_task: u64,

    /// Prefix of the task ids
    #[arg(long, default_value = "embed")]
    name: String,
}

fn embed(args: &WorkerArgs) -> eyre::Result<()> {
    let queue = vecmatch_task::TaskQueue::open(&args.task_dir, &args.identity)?;
    let backend = vecmatch_embed::Backend::load(&vecmatch_embed::BackendConfig {
        kind: args.backend,
        model: match &args.model_dir {
            Some(dir) => vecmatch_embed::ModelSource::Dir(dir.clone()),
            None => vecmatch_embed::ModelSource::Hub(args.model.clone()),
        },
        max_seq_length: args.max_seq_length,
        gpu: args.gpu,
    })?;
    let mut producer = vecmatch_producer::EmbeddingProducer::new(
        backend,
        vecmatch_producer::ProducerConfig {
            chunk_size: args.chunk_size,
            segment_size: args.segment_size,
        },
    )?;

    tracing::info!(identity = %args.identity, dir = %args.task_dir.display(), "worker started");
    loop {
        let Some(mut task) = queue.next_task()? else {
            if args.once {
                break;
            }
            std::thread::sleep(std::time::Duration::from_secs(args.poll_interval));
            continue;
        };

        let Some(store) = task_store(&args.store_root, &mut task)? else {
            continue;
        };
        let outcome = producer.process_task(&store, &mut task)?;
        println!("{}: {outcome:?}", task.id());
    }

    Ok(())
}

/// Object store of a claimed task's bucket.
///
/// A task whose parameters or bucket cannot be used is failed, which releases
/// its claim, and `None` is returned.
fn task_store<T: vecmatch_task::TaskHandle + ?Sized>(
    store_root: &std::path::Path,
    task: &mut T,
) -> eyre::Result<Option<vecmatch_store::LocalObjectStore>> {
    let opened = task.init().and_then(|init| {
        vecmatch_store::LocalObjectStore::open(store_root.join(&init.bucket_name))
    });
    match opened {
        Ok(store) => Ok(Some(store)),
        Err(err) => {
            tracing::error!(task = task.id(), error = %err, "unusable task");
            task.fail(&format!("{err:?}"))?;
            Ok(None)
        }
    }
}

fn run_rerank(args: &RerankArgs) -> eyre::Result<()> {
    let layout = match args.records_per_shard {
        Some(records) => vecmatch_shard::ShardLayout::new(records, args.dimension)?,
        None => {
            let capacity = args
                .shard_capacity
                .ok_or_else(|| eyre::eyre!("either --records-per-shard or --shard-capacity is required"))?;
            vecmatch_shard::ShardLayout::from_capacity(capacity, args.dimension)?
        }
    };
    let queue = vecmatch_queue::CandidateQueue::open(&args.queue)?;
    let accelerator = if args.cpu {
        vecmatch_similarity::Accelerator::cpu()
    } else {
        vecmatch_similarity::Accelerator::new()?
    };
    let engine = vecmatch_rerank::RerankEngine::new(
        &queue,
        vecmatch_shard::VectorLoader::new(&args.shards, layout),
        accelerator,
        vecmatch_rerank::RerankConfig {
            threshold: args.threshold.unwrap_or(f32::INFINITY),
            batch_pairs: args.batch_pairs,
            row_base: args.row_base,
            parallel_loads: !args.sequential_loads,
        },
    )?;

    let summary = if args.summary_only {
        engine.run(&mut vecmatch_rerank::SummaryOnly)?
    } else {
        let output = args
            .output
            .as_deref()
            .ok_or_else(|| eyre::eyre!("--output is required unless --summary-only is set"))?;
        match args.format {
            ReportFormat::Binary => {
                let mut report = vecmatch_rerank::BinaryReport::create(output)?;
                engine.run(&mut report)?
            }
            ReportFormat::Csv => {
                let lines = args
                    .lines
                    .as_deref()
                    .ok_or_else(|| eyre::eyre!("csv reports need --lines"))?;
                let lines_index = args
                    .lines_index
                    .clone()
                    .unwrap_or_else(|| vecmatch_queue::index_path_for(lines));
                let lookup = vecmatch_rerank::ExternalIdLookup::open(lines, &lines_index)?;
                let mut report = vecmatch_rerank::CsvReport::create(output, lookup)?;
                engine.run(&mut report)?
            }
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).wrap_err("failed to serialize summary")?
    );
    Ok(())
}

fn create_tasks(args: &PlanArgs) -> eyre::Result<()> {
    if args.lines_per_task == 0 {
        eyre::bail!("--lines-per-task must be at least 1");
    }
    // Fail before any task exists if the template cannot be used.
    vecmatch_embed::RowTemplate::compile(&args.template)?;

    let store = vecmatch_store::LocalObjectStore::open(args.store_root.join(&args.bucket))?;
    let line_count = vecmatch_offsets::OffsetIndex::load(&store, &args.index_key)
        .wrap_err("failed to read the line count from the index")?
        .record_count();
    let queue = vecmatch_task::TaskQueue::open(&args.task_dir, "operator")?;

    let ranges = vecmatch_chunk::plan_line_ranges(line_count, args.lines_per_task);
    for (task_index, range) in ranges.iter().enumerate() {
        let id = format!("{}-{task_index:06}", args.name);
        let init = vecmatch_task::EmbedTaskInit {
            bucket_name: args.bucket.clone(),
            strings_key: args.strings_key.clone(),
            newline_index: args.index_key.clone(),
            output_key: vecmatch_chunk::task_output_key(&args.output_key, task_index),
            start_line: range.start_line,
            end_line: range.end_line,
            template: args.template.clone(),
        };
        queue
            .create(&id, &init)
            .wrap_err_with(|| format!("failed to create task {id}"))?;
        println!("{id}\t{}..={}\t{}", range.start_line, range.end_line, init.output_key);
    }
    tracing::info!(tasks = ranges.len(), line_count, "tasks created");

    Ok(())
}
