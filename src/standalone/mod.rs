use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

pub mod engine;
pub mod logging;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Log more (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job on this machine
    Submit {
        /// Input file, directory, or glob pattern
        #[arg(short, long)]
        input: String,

        /// Name of the workload
        #[arg(short, long, default_value = "invert")]
        workload: String,

        /// Output directory. Replaced if it already exists.
        #[arg(short, long)]
        output: String,

        /// Number of reduce buckets (output part files)
        #[arg(short, long, default_value_t = 1)]
        reducers: u32,

        /// Files mapped (and buckets reduced) concurrently.
        /// Defaults to the available parallelism.
        #[arg(short, long)]
        map_threads: Option<usize>,

        /// Spill map output to parquet files under this directory instead of
        /// keeping it in memory
        #[arg(long)]
        spill_dir: Option<PathBuf>,

        /// Auxiliary arguments to pass to the MapReduce application.
        #[clap(value_parser, last = true)]
        args: Vec<String>,
    },
    /// Print a finished job's output in key order, merging all part files
    Cat {
        /// Output directory of a finished job
        #[arg(short, long)]
        output: PathBuf,

        /// Separator between key and value in the part files
        #[arg(short, long, default_value = "\\t")]
        separator: String,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub input: String,
    pub workload: String,
    pub output: String,
    pub args: Vec<String>,
    pub n_reduce: u32,
    pub map_threads: usize,
    pub spill_dir: Option<PathBuf>,
}

impl Job {
    /// An inverted index job over `input` with one reducer, writing to `output`.
    pub fn new(input: impl ToString, output: impl ToString) -> Self {
        Self {
            input: input.to_string(),
            workload: "invert".to_string(),
            output: output.to_string(),
            args: Vec::new(),
            n_reduce: 1,
            map_threads: default_threads(),
            spill_dir: None,
        }
    }
}

pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
