use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, BinaryArray, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use super::model::{FrameRecord, DTYPE, HEIGHT, METADATA, PATH, PIXELS, WIDTH};

pub const DEFAULT_FLUSH_INTERVAL: usize = 100;

/// Arrow schema shared by every store file.
pub fn frame_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(PATH, DataType::Utf8, false),
        Field::new(DTYPE, DataType::Utf8, false),
        Field::new(WIDTH, DataType::UInt32, false),
        Field::new(HEIGHT, DataType::UInt32, false),
        Field::new(PIXELS, DataType::Binary, false),
        Field::new(METADATA, DataType::Utf8, false),
    ]))
}

// ---------------------------------------------------------------------------
// ColumnFileWriter
// ---------------------------------------------------------------------------

/// Append-only writer for the frame store.
///
/// Rows are buffered and written as one Parquet row group every
/// `flush_interval` rows. Output goes to a sibling `.partial` file which
/// replaces the target on [`ColumnFileWriter::finish`]; a run that dies
/// midway leaves the previous store untouched.
pub struct ColumnFileWriter {
    target: PathBuf,
    staging: PathBuf,
    schema: SchemaRef,
    writer: ArrowWriter<File>,
    pending: Vec<FrameRecord>,
    flush_interval: usize,
    carried_over: usize,
    appended: usize,
}

impl ColumnFileWriter {
    /// Open `path` for appending. Rows already stored there are kept.
    pub fn append(path: &Path) -> Result<Self> {
        let staging = staging_path(path);
        let schema = frame_schema();
        let file = File::create(&staging)
            .with_context(|| format!("creating {}", staging.display()))?;
        let mut writer =
            ArrowWriter::try_new(file, schema.clone(), None).context("creating parquet writer")?;

        let mut carried_over = 0;
        if path.exists() {
            carried_over = copy_existing(path, &schema, &mut writer)
                .with_context(|| format!("carrying over rows of {}", path.display()))?;
            log::info!("{}: appending after {carried_over} existing rows", path.display());
        }

        Ok(Self {
            target: path.to_path_buf(),
            staging,
            schema,
            writer,
            pending: Vec::new(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            carried_over,
            appended: 0,
        })
    }

    pub fn set_flush_interval(&mut self, rows: usize) {
        self.flush_interval = rows.max(1);
    }

    pub fn add_row(&mut self, row: FrameRecord) -> Result<()> {
        self.pending.push(row);
        if self.pending.len() >= self.flush_interval {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered rows as a row group.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = frames_to_batch(&self.schema, &self.pending)?;
        self.writer.write(&batch).context("writing record batch")?;
        self.writer.flush().context("flushing row group")?;
        self.appended += self.pending.len();
        self.pending.clear();
        Ok(())
    }

    /// Number of rows appended in this session (flushed or pending).
    pub fn rows_appended(&self) -> usize {
        self.appended + self.pending.len()
    }

    /// Flush, close and move the store into place. Returns the total row
    /// count of the store.
    pub fn finish(mut self) -> Result<usize> {
        self.flush()?;
        self.writer.close().context("closing parquet writer")?;
        std::fs::rename(&self.staging, &self.target).with_context(|| {
            format!(
                "moving {} to {}",
                self.staging.display(),
                self.target.display()
            )
        })?;
        Ok(self.carried_over + self.appended)
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("store"));
    name.push(".partial");
    path.with_file_name(name)
}

fn copy_existing(path: &Path, schema: &SchemaRef, writer: &mut ArrowWriter<File>) -> Result<usize> {
    let file = File::open(path).context("opening existing store")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    if builder.schema().fields() != schema.fields() {
        bail!("existing file does not have the frame store schema");
    }
    let reader = builder.build().context("building parquet reader")?;

    let mut rows = 0;
    for batch in reader {
        let batch = batch.context("reading record batch")?;
        rows += batch.num_rows();
        writer.write(&batch).context("copying record batch")?;
    }
    writer.flush().context("flushing copied rows")?;
    Ok(rows)
}

fn frames_to_batch(schema: &SchemaRef, rows: &[FrameRecord]) -> Result<RecordBatch> {
    let metadata = rows
        .iter()
        .map(|r| serde_json::to_string(&r.tags))
        .collect::<Result<Vec<_>, _>>()
        .context("encoding metadata")?;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.path.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.dtype.as_str()))),
        Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.width))),
        Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.height))),
        Arc::new(BinaryArray::from_iter_values(rows.iter().map(|r| r.pixels.as_slice()))),
        Arc::new(StringArray::from_iter_values(metadata.iter())),
    ];

    RecordBatch::try_new(schema.clone(), columns).context("assembling record batch")
}
