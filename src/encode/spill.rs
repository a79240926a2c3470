//! Parquet spill files for map output.
//!
//! Each map task writes its pairs for reduce bucket `n` to
//! `<root>/mrl-<uuid>/bucket-<n>/shard-<file>.parquet`. A reducer reads every
//! shard of its bucket back in shard order, so the order in which values reach
//! the reduce function is the same as with in-memory buckets.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, BinaryArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::KeyValue;

/// Rows per record batch. Keeps each binary column well below the 2 GiB
/// offset limit of `BinaryArray`.
const BATCH_ROWS: usize = 64 * 1024;

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Binary, false),
        Field::new("val", DataType::Binary, false),
    ]))
}

/// Writes `kvs` to a new parquet file at `path`, in order.
pub fn write_parquet(path: &Path, kvs: &[KeyValue]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let schema = schema();
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
    for chunk in kvs.chunks(BATCH_ROWS) {
        let keys: Vec<&[u8]> = chunk.iter().map(|kv| kv.key.as_ref()).collect();
        let vals: Vec<&[u8]> = chunk.iter().map(|kv| kv.value.as_ref()).collect();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(BinaryArray::from(keys)) as ArrayRef,
                Arc::new(BinaryArray::from(vals)) as ArrayRef,
            ],
        )?;
        writer.write(&batch)?;
    }
    // the footer is only written on close
    writer.close()?;
    Ok(())
}

fn binary_column(batch: &RecordBatch, index: usize) -> Result<&BinaryArray> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<BinaryArray>()
        .with_context(|| format!("column {index} is not binary"))
}

/// Reads back a file written by [`write_parquet`].
pub fn read_parquet(path: &Path) -> Result<Vec<KeyValue>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let keys = binary_column(&batch, 0)?;
        let vals = binary_column(&batch, 1)?;
        out.reserve(batch.num_rows());
        for i in 0..batch.num_rows() {
            out.push(KeyValue::new(
                Bytes::copy_from_slice(keys.value(i)),
                Bytes::copy_from_slice(vals.value(i)),
            ));
        }
    }
    Ok(out)
}

/// A job-scoped spill directory. Removed when dropped.
#[derive(Debug)]
pub struct Spill {
    dir: PathBuf,
}

impl Spill {
    /// Creates a fresh, uniquely named directory under `root`.
    pub fn create(root: &Path) -> Result<Self> {
        let dir = root.join(format!("mrl-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        debug!(dir = %dir.display(), "Created spill directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn bucket_dir(&self, bucket: u32) -> PathBuf {
        self.dir.join(format!("bucket-{bucket:05}"))
    }

    /// Writes the pairs one map task produced for `bucket`.
    pub fn write_shard(&self, bucket: u32, shard: usize, kvs: &[KeyValue]) -> Result<()> {
        let dir = self.bucket_dir(bucket);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("shard-{shard:08}.parquet"));
        write_parquet(&path, kvs)?;
        trace!(path = %path.display(), rows = kvs.len(), "Spilled shard");
        Ok(())
    }

    /// Reads all shards of `bucket`, in shard order.
    ///
    /// A bucket no map task wrote to is empty.
    pub fn read_bucket(&self, bucket: u32) -> Result<Vec<KeyValue>> {
        let dir = self.bucket_dir(bucket);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut shards = fs::read_dir(&dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        // zero-padded names, so lexical order is shard order
        shards.sort();

        let mut out = Vec::new();
        for shard in shards {
            out.append(&mut read_parquet(&shard)?);
        }
        Ok(out)
    }
}

impl Drop for Spill {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), "Failed to remove spill directory: {err}");
        }
    }
}
