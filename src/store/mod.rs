/// Columnar store of decoded imaging frames.
///
/// Architecture:
/// ```text
///   DICOM files
///        │
///        ▼
///   ┌──────────┐
///   │  writer   │  FrameRecord rows → Parquet row groups (flush interval)
///   └──────────┘
///        │
///        ▼
///   ┌──────────────┐
///   │ dicoms.parquet│  path, dtype, width, height, pixels, metadata
///   └──────────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  select   │  projection + per-column predicates → callback per row
///   └──────────┘
/// ```

pub mod model;
pub mod select;
pub mod writer;

pub use model::{Column, FrameRecord, PixelType, SelectedRow, TagValue};
pub use select::{preview, select, Predicate, Query};
pub use writer::{ColumnFileWriter, DEFAULT_FLUSH_INTERVAL};
