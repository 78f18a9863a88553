use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, AsArray, BinaryArray, BooleanArray, StringArray, UInt32Array};
use arrow::datatypes::{Schema, UInt32Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{
    ArrowPredicate, ArrowPredicateFn, ParquetRecordBatchReaderBuilder, RowFilter,
};
use parquet::arrow::ProjectionMask;
use regex::Regex;

use super::model::{Column, SelectedRow, TagValue, DTYPE, HEIGHT, METADATA, PATH, PIXELS, WIDTH};

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Row-level condition on one column.
///
/// A row passes a predicate when:
/// * `Matches` – the value's text form contains a match of the regex
/// * `OneOf` – the value is in the set
/// * `Custom` – the closure returns `true`
///
/// A row that has no value for the column never passes.
pub enum Predicate {
    Matches(Regex),
    OneOf(BTreeSet<TagValue>),
    Custom(Box<dyn Fn(&TagValue) -> bool + Send + Sync>),
}

impl Predicate {
    pub fn test(&self, value: &TagValue) -> bool {
        match self {
            Predicate::Matches(regex) => match value {
                TagValue::Text(s) => regex.is_match(s),
                other => regex.is_match(&other.to_string()),
            },
            Predicate::OneOf(values) => values.contains(value),
            Predicate::Custom(f) => f(value),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Matches(regex) => f.debug_tuple("Matches").field(&regex.as_str()).finish(),
            Predicate::OneOf(values) => f.debug_tuple("OneOf").field(values).finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Query: projection + predicates
// ---------------------------------------------------------------------------

/// Column projection plus the predicates every streamed row must satisfy.
#[derive(Debug)]
pub struct Query {
    projection: BTreeSet<Column>,
    predicates: Vec<(Column, Arc<Predicate>)>,
}

impl Query {
    pub fn new(projection: impl IntoIterator<Item = Column>) -> Self {
        Self {
            projection: projection.into_iter().collect(),
            predicates: Vec::new(),
        }
    }

    pub fn filter(mut self, column: Column, predicate: Predicate) -> Self {
        self.predicates.push((column, Arc::new(predicate)));
        self
    }

    /// Physical columns read for rows that passed the predicates.
    fn projected_columns(&self) -> BTreeSet<&'static str> {
        self.projection.iter().map(Column::physical_name).collect()
    }

    /// Physical columns the predicates are evaluated on.
    fn filter_columns(&self) -> BTreeSet<&'static str> {
        self.predicates.iter().map(|(c, _)| c.physical_name()).collect()
    }

    fn projects_tag(&self, tag: u32) -> bool {
        self.projection.contains(&Column::Metadata) || self.projection.contains(&Column::Tag(tag))
    }
}

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Stream every row of the store at `path` that passes all predicates of
/// `query` into `on_row`. Returns the number of matching rows.
///
/// Predicates run first, on their own columns only; the projected columns
/// are decoded just for the rows that pass.
///
/// Errors from `on_row` abort the scan and are returned as-is.
pub fn select<F>(path: &Path, query: &Query, mut on_row: F) -> Result<usize>
where
    F: FnMut(SelectedRow) -> Result<()>,
{
    if let Some((column, _)) = query
        .predicates
        .iter()
        .find(|(c, _)| matches!(c, Column::Pixels | Column::Metadata))
    {
        bail!("the {column} column cannot be used in a predicate");
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;

    let projection = ProjectionMask::roots(
        builder.parquet_schema(),
        column_indices(builder.schema(), query.projected_columns())?,
    );

    if !query.predicates.is_empty() {
        let filter_mask = ProjectionMask::roots(
            builder.parquet_schema(),
            column_indices(builder.schema(), query.filter_columns())?,
        );
        let predicates = query.predicates.clone();
        let predicate = ArrowPredicateFn::new(filter_mask, move |batch: RecordBatch| {
            evaluate(&batch, &predicates).map_err(|e| ArrowError::ExternalError(e.into()))
        });
        let filters: Vec<Box<dyn ArrowPredicate>> = vec![Box::new(predicate)];
        builder = builder.with_row_filter(RowFilter::new(filters));
    }

    let reader = builder
        .with_projection(projection)
        .build()
        .context("building parquet reader")?;

    let mut matched = 0;
    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let columns = BatchColumns::locate(&batch)?;

        for row in 0..batch.num_rows() {
            let tags = columns
                .metadata_at(row)
                .with_context(|| format!("decoding metadata of row {row}"))?;
            matched += 1;
            on_row(columns.project(query, row, tags))?;
        }
    }

    Ok(matched)
}

fn column_indices(schema: &Schema, names: BTreeSet<&'static str>) -> Result<Vec<usize>> {
    names
        .into_iter()
        .map(|name| {
            schema
                .index_of(name)
                .with_context(|| format!("store is missing the '{name}' column"))
        })
        .collect()
}

/// Which rows of a batch of predicate columns pass every predicate.
fn evaluate(batch: &RecordBatch, predicates: &[(Column, Arc<Predicate>)]) -> Result<BooleanArray> {
    let columns = BatchColumns::locate(batch)?;
    let mut passes = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let tags = columns
            .metadata_at(row)
            .with_context(|| format!("decoding metadata of row {row}"))?;
        passes.push(predicates.iter().all(|(column, predicate)| {
            columns
                .cell(*column, row, &tags)
                .is_some_and(|value| predicate.test(&value))
        }));
    }
    Ok(BooleanArray::from(passes))
}

/// Render the first `limit` rows of the store (everything but pixel data)
/// as a text table.
pub fn preview(path: &Path, limit: usize) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let total = builder.metadata().file_metadata().num_rows();

    let indices: Vec<usize> = builder
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| f.name() != PIXELS)
        .map(|(i, _)| i)
        .collect();
    let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
    let mut reader = builder
        .with_projection(mask)
        .with_batch_size(limit.max(1))
        .build()
        .context("building parquet reader")?;

    let table = match reader.next() {
        Some(batch) => {
            let batch = batch.context("reading parquet record batch")?;
            let shown = batch.slice(0, limit.min(batch.num_rows()));
            arrow::util::pretty::pretty_format_batches(&[shown])
                .context("formatting rows")?
                .to_string()
        }
        None => String::from("(empty store)"),
    };

    Ok(format!("{table}\n{total} rows in {}", path.display()))
}

// ---------------------------------------------------------------------------
// Batch helpers
// ---------------------------------------------------------------------------

/// Typed views onto the physical columns present in a projected batch.
struct BatchColumns<'a> {
    path: Option<&'a StringArray>,
    dtype: Option<&'a StringArray>,
    width: Option<&'a UInt32Array>,
    height: Option<&'a UInt32Array>,
    pixels: Option<&'a BinaryArray>,
    metadata: Option<&'a StringArray>,
}

impl<'a> BatchColumns<'a> {
    fn locate(batch: &'a RecordBatch) -> Result<Self> {
        let find = |name: &str| -> Option<&'a dyn Array> {
            batch
                .schema()
                .index_of(name)
                .ok()
                .map(|i| batch.column(i).as_ref())
        };

        let text = |name: &str| -> Result<Option<&'a StringArray>> {
            find(name)
                .map(|col| {
                    col.as_string_opt::<i32>()
                        .with_context(|| format!("'{name}' is not a Utf8 column"))
                })
                .transpose()
        };
        let count = |name: &str| -> Result<Option<&'a UInt32Array>> {
            find(name)
                .map(|col| {
                    col.as_primitive_opt::<UInt32Type>()
                        .with_context(|| format!("'{name}' is not a UInt32 column"))
                })
                .transpose()
        };

        let pixels = find(PIXELS)
            .map(|col| {
                col.as_binary_opt::<i32>()
                    .context("'pixels' is not a Binary column")
            })
            .transpose()?;

        Ok(Self {
            path: text(PATH)?,
            dtype: text(DTYPE)?,
            width: count(WIDTH)?,
            height: count(HEIGHT)?,
            pixels,
            metadata: text(METADATA)?,
        })
    }

    fn metadata_at(&self, row: usize) -> Result<BTreeMap<u32, TagValue>> {
        match self.metadata {
            Some(col) if !col.is_null(row) => Ok(serde_json::from_str(col.value(row))?),
            _ => Ok(BTreeMap::new()),
        }
    }

    /// Value of a logical column, as seen by predicates.
    fn cell(&self, column: Column, row: usize, tags: &BTreeMap<u32, TagValue>) -> Option<TagValue> {
        let text = |col: Option<&StringArray>| {
            col.filter(|c| !c.is_null(row))
                .map(|c| TagValue::Text(c.value(row).to_string()))
        };
        let count = |col: Option<&UInt32Array>| {
            col.filter(|c| !c.is_null(row))
                .map(|c| TagValue::Integer(i64::from(c.value(row))))
        };
        match column {
            Column::Path => text(self.path),
            Column::Dtype => text(self.dtype),
            Column::Width => count(self.width),
            Column::Height => count(self.height),
            Column::Pixels | Column::Metadata => None,
            Column::Tag(tag) => tags.get(&tag).cloned(),
        }
    }

    fn project(&self, query: &Query, row: usize, mut tags: BTreeMap<u32, TagValue>) -> SelectedRow {
        let wants = |c: Column| query.projection.contains(&c);
        let text = |col: Option<&StringArray>| {
            col.filter(|c| !c.is_null(row)).map(|c| c.value(row).to_string())
        };
        let count = |col: Option<&UInt32Array>| col.filter(|c| !c.is_null(row)).map(|c| c.value(row));

        tags.retain(|tag, _| query.projects_tag(*tag));

        SelectedRow {
            path: if wants(Column::Path) { text(self.path) } else { None },
            dtype: if wants(Column::Dtype) { text(self.dtype) } else { None },
            width: if wants(Column::Width) { count(self.width) } else { None },
            height: if wants(Column::Height) { count(self.height) } else { None },
            pixels: if wants(Column::Pixels) {
                self.pixels
                    .filter(|c| !c.is_null(row))
                    .map(|c| c.value(row).to_vec())
            } else {
                None
            },
            tags,
        }
    }
}
