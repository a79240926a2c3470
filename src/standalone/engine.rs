use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use glob::glob;
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::encode::Spill;
use crate::standalone::Job;
use crate::*;

// types related to this engine
pub type BucketIndex = u32;
pub type Buckets = DashMap<BucketIndex, Vec<KeyValue>>;

/// Name of the marker written once every part file is complete.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Where map output waits for the reduce stage.
pub enum Shuffle {
    Memory(Buckets),
    Spilled(Spill),
}

impl Shuffle {
    fn for_job(job: &Job) -> Result<Self> {
        Ok(match &job.spill_dir {
            Some(root) => Shuffle::Spilled(Spill::create(root)?),
            None => Shuffle::Memory(Buckets::new()),
        })
    }

    /// Accepts the bucketed output of map task `shard`. Must be called in
    /// shard order.
    fn accept(&self, shard: usize, buckets: BTreeMap<BucketIndex, Vec<KeyValue>>) -> Result<()> {
        match self {
            Shuffle::Memory(all) => {
                for (bucket_no, mut kvs) in buckets {
                    all.entry(bucket_no).or_default().append(&mut kvs);
                }
            }
            Shuffle::Spilled(spill) => {
                for (bucket_no, kvs) in buckets {
                    spill.write_shard(bucket_no, shard, &kvs)?;
                }
            }
        }
        Ok(())
    }

    /// Hands over everything routed to `bucket_no`.
    fn take(&self, bucket_no: BucketIndex) -> Result<Vec<KeyValue>> {
        match self {
            Shuffle::Memory(all) => Ok(all.remove(&bucket_no).map(|(_, v)| v).unwrap_or_default()),
            Shuffle::Spilled(spill) => spill.read_bucket(bucket_no),
        }
    }
}

/// Counters for a finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub input_files: usize,
    pub input_bytes: u64,
    pub map_output_records: u64,
    pub reduce_input_groups: u64,
    pub output_parts: u32,
    pub output_bytes: u64,
    pub elapsed: Duration,
}

struct MapShard {
    input_bytes: u64,
    pairs: u64,
    buckets: BTreeMap<BucketIndex, Vec<KeyValue>>,
}

#[derive(Default)]
struct PartStats {
    groups: u64,
    bytes: u64,
}

/// Expands the job's input location into the list of files to map.
///
/// A directory contributes its regular files, skipping names that start with
/// `_` or `.`. Anything that is neither a file nor a directory is treated as a
/// glob pattern. The result is sorted.
pub fn resolve_inputs(input: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(input);
    let mut files = if path.is_dir() {
        let mut files = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("reading {}", path.display()))? {
            let entry = entry?;
            let hidden = entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.starts_with('_') || name.starts_with('.'));
            // follows symlinks
            let path = entry.path();
            if !hidden && path.is_file() {
                files.push(path);
            }
        }
        files
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        let matches = glob(input).map_err(|source| JobError::InputPattern {
            pattern: input.to_string(),
            source,
        })?;
        let files: Vec<PathBuf> = matches.flatten().filter(|p| p.is_file()).collect();
        if files.is_empty() {
            return Err(JobError::NoInput(input.to_string()).into());
        }
        files
    };
    files.sort();
    Ok(files)
}

/// Makes `output` an empty directory, deleting whatever was there.
pub fn prepare_output(output: &Path, inputs: &[PathBuf]) -> Result<()> {
    if output.as_os_str().is_empty() {
        return Err(JobError::EmptyOutput.into());
    }
    if output.exists() {
        let out = output.canonicalize()?;
        for input in inputs {
            if input.canonicalize()?.starts_with(&out) {
                return Err(JobError::OutputContainsInput(output.to_path_buf()).into());
            }
        }
        warn!(output = %output.display(), "Output path exists. Deleting");
        if output.is_dir() {
            fs::remove_dir_all(output)?;
        } else {
            fs::remove_file(output)?;
        }
    }
    fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;
    Ok(())
}

fn map_file(
    path: &Path,
    engine: &Workload,
    serialized_args: &Bytes,
    num_reduce_worker: u32,
) -> Result<MapShard> {
    let buf = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let input_bytes = buf.len() as u64;
    // <file name, all data in file>
    let input_kv = KeyValue {
        key: Bytes::from(path.to_string_lossy().into_owned()),
        value: Bytes::from(buf),
    };

    let mut buckets: BTreeMap<BucketIndex, Vec<KeyValue>> = BTreeMap::new();
    let mut pairs = 0;
    for item in (engine.map_fn)(input_kv, serialized_args.clone())? {
        let kv = item?;
        let bucket_no = ihash(&kv.key) % num_reduce_worker;
        buckets.entry(bucket_no).or_default().push(kv);
        pairs += 1;
    }
    debug!(file = %path.display(), pairs, "Mapped file");

    Ok(MapShard {
        input_bytes,
        pairs,
        buckets,
    })
}

/// Runs the map function over every input file and routes the emitted pairs
/// into `shuffle` by `ihash(key) % n_reduce`.
///
/// Up to `job.map_threads` files are mapped at once, but shards are handed to
/// the shuffle in input order, so each bucket holds its values in
/// (file, line) order.
pub fn perform_map(
    job: &Job,
    inputs: &[PathBuf],
    engine: &Workload,
    serialized_args: &Bytes,
    shuffle: &Shuffle,
) -> Result<JobReport> {
    let mut report = JobReport {
        input_files: inputs.len(),
        ..JobReport::default()
    };
    let threads = job.map_threads.max(1);

    for (chunk_no, chunk) in inputs.chunks(threads).enumerate() {
        let shards: Vec<Result<MapShard>> = thread::scope(|s| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|path| {
                    s.spawn(move || map_file(path, engine, serialized_args, job.n_reduce))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("map task panicked"))))
                .collect()
        });

        for (i, shard) in shards.into_iter().enumerate() {
            let shard = shard?;
            report.input_bytes += shard.input_bytes;
            report.map_output_records += shard.pairs;
            shuffle.accept(chunk_no * threads + i, shard.buckets)?;
        }
    }

    Ok(report)
}

fn part_path(output_dir: &Path, reduce_id: BucketIndex) -> PathBuf {
    output_dir.join(format!("part-r-{reduce_id:05}"))
}

/// Sorts one bucket by key and writes the reduce output for every key to its
/// part file.
fn reduce_bucket(
    output_dir: &Path,
    engine: &Workload,
    serialized_args: &Bytes,
    reduce_id: BucketIndex,
    mut bkt: Vec<KeyValue>,
) -> Result<PartStats> {
    let reduce_func = engine.reduce_fn;
    let out_pathspec = part_path(output_dir, reduce_id);
    let mut out_file = BufWriter::new(File::create(&out_pathspec)?);
    let mut stats = PartStats::default();

    // stable, so values keep their map order within a key
    bkt.sort_by(|a, b| a.key.cmp(&b.key));
    for (key, value_group) in &bkt.into_iter().chunk_by(KeyValue::key) {
        let iter = value_group.map(KeyValue::into_value);
        let out = reduce_func(key, Box::new(iter), serialized_args.clone())?;
        out_file.write_all(&out)?;
        stats.groups += 1;
        stats.bytes += out.len() as u64;
    }

    let file = out_file.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    debug!(part = %out_pathspec.display(), keys = stats.groups, "Wrote part");
    Ok(stats)
}

/// Reduces every bucket `0..n_reduce` into `part-r-NNNNN` under `output_dir`.
///
/// Each part file is sorted by key. A bucket nothing was routed to still gets
/// an (empty) part file.
pub fn perform_reduce(
    job: &Job,
    output_dir: &Path,
    engine: &Workload,
    serialized_args: &Bytes,
    shuffle: &Shuffle,
    report: &mut JobReport,
) -> Result<()> {
    let reduce_ids: Vec<BucketIndex> = (0..job.n_reduce).collect();

    for chunk in reduce_ids.chunks(job.map_threads.max(1)) {
        let parts: Vec<Result<PartStats>> = thread::scope(|s| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|&reduce_id| {
                    s.spawn(move || {
                        let bkt = shuffle.take(reduce_id)?;
                        reduce_bucket(output_dir, engine, serialized_args, reduce_id, bkt)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("reduce task panicked"))))
                .collect()
        });

        for part in parts {
            let part = part?;
            report.reduce_input_groups += part.groups;
            report.output_bytes += part.bytes;
            report.output_parts += 1;
        }
    }
    Ok(())
}

fn write_success_marker(output_dir: &Path) -> Result<()> {
    let marker = File::create(output_dir.join(SUCCESS_MARKER))?;
    marker.sync_all()?;
    Ok(())
}

/// Runs `job` end to end: resolve input, clear output, map, shuffle, reduce.
///
/// The `_SUCCESS` marker is only written after every part file has been
/// synced; output without it is incomplete.
pub fn run_job(job: &Job) -> Result<JobReport> {
    let start = Instant::now();
    if job.n_reduce == 0 {
        return Err(JobError::ZeroReducers.into());
    }
    let engine = workload::named(&job.workload)?;
    let raw_args = utils::string_to_bytes(serde_json::to_string(&job.args)?);
    let serialized_args = (engine.args_fn)(raw_args).map_err(|err| JobError::WorkloadArgs {
        workload: job.workload.clone(),
        message: format!("{err:#}"),
    })?;
    let inputs = resolve_inputs(&job.input)?;
    let output_dir = PathBuf::from(&job.output);

    info!(
        input = %job.input,
        inputs = ?inputs,
        output = %output_dir.display(),
        workload = %job.workload,
        files = inputs.len(),
        reducers = job.n_reduce,
        "Starting job"
    );
    prepare_output(&output_dir, &inputs)?;

    let shuffle = Shuffle::for_job(job)?;

    /*  The map logic carries out mapping and also shuffle. This makes sense in
     *  the case of a standalone system.
     */
    let mut report = perform_map(job, &inputs, &engine, &serialized_args, &shuffle)?;
    info!(
        files = report.input_files,
        pairs = report.map_output_records,
        "Map phase complete"
    );
    perform_reduce(job, &output_dir, &engine, &serialized_args, &shuffle, &mut report)?;
    drop(shuffle);

    write_success_marker(&output_dir)?;
    report.elapsed = start.elapsed();
    info!(
        keys = report.reduce_input_groups,
        parts = report.output_parts,
        bytes = report.output_bytes,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Job completed"
    );
    Ok(report)
}

/// Reads a finished job's output as `(key, value)` records in one total key
/// order, merging the individually sorted part files.
///
/// Each line is split at the first `separator`. Fails if the output has no
/// `_SUCCESS` marker.
pub fn read_output(output_dir: &Path, separator: &str) -> Result<Vec<(String, String)>> {
    if !output_dir.join(SUCCESS_MARKER).is_file() {
        return Err(anyhow!(
            "{} has no {SUCCESS_MARKER} marker, output is incomplete",
            output_dir.display()
        ));
    }

    let mut parts = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let path = entry?.path();
        let is_part = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("part-"));
        if is_part {
            parts.push(path);
        }
    }
    parts.sort();

    let mut records = Vec::with_capacity(parts.len());
    for part in parts {
        let mut part_records = Vec::new();
        for line in BufReader::new(File::open(&part)?).lines() {
            let line = line?;
            let (key, value) = line.split_once(separator).unwrap_or((line.as_str(), ""));
            part_records.push((key.to_string(), value.to_string()));
        }
        records.push(part_records);
    }

    Ok(records
        .into_iter()
        .kmerge_by(|a: &(String, String), b: &(String, String)| a.0 < b.0)
        .collect())
}
