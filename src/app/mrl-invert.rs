use anyhow::Result;
use clap::Parser;
use mrinvert::standalone::{
    default_threads,
    engine::{read_output, run_job},
    logging::init_logging,
    Args, Commands, Job,
};
use mrinvert::utils;
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};

fn submit(job: Job) -> Result<()> {
    let report = run_job(&job)?;
    info!(
        input_files = report.input_files,
        input_bytes = report.input_bytes,
        map_output_records = report.map_output_records,
        reduce_input_groups = report.reduce_input_groups,
        output_bytes = report.output_bytes,
        "Job counters"
    );
    Ok(())
}

fn cat(output: &Path, separator: &str) -> Result<()> {
    let separator = utils::unescape(separator);
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    for (key, value) in read_output(output, &separator)? {
        writeln!(out, "{key}{separator}{value}")?;
    }
    out.flush()?;
    Ok(())
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Submit {
            input,
            workload,
            output,
            reducers,
            map_threads,
            spill_dir,
            args,
        } => submit(Job {
            input,
            workload,
            output,
            args,
            n_reduce: reducers,
            map_threads: map_threads.unwrap_or_else(default_threads),
            spill_dir,
        }),
        Commands::Cat { output, separator } => cat(&output, &separator),
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        // --help and --version
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            // usage errors exit 1 like every other failure
            let _ = err.print();
            return ExitCode::from(1);
        }
    };
    init_logging(args.verbose);

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Job failed: {err:#}");
            ExitCode::from(1)
        }
    }
}
