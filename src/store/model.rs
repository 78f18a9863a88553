use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Physical column names
// ---------------------------------------------------------------------------

pub const PATH: &str = "path";
pub const DTYPE: &str = "dtype";
pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";
pub const PIXELS: &str = "pixels";
pub const METADATA: &str = "metadata";

// ---------------------------------------------------------------------------
// TagValue – a single metadata cell
// ---------------------------------------------------------------------------

/// A dynamically-typed metadata value, keyed in a row by DICOM tag.
/// Used inside `BTreeSet` predicates, so `TagValue` must be `Ord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

// -- Manual Eq/Ord so we can put TagValue in BTreeSet --

impl Eq for TagValue {}

impl PartialOrd for TagValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TagValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use TagValue::*;
        fn discriminant(v: &TagValue) -> u8 {
            match v {
                Integer(_) => 0,
                Float(_) => 1,
                Text(_) => 2,
            }
        }
        match (self, other) {
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            _ => discriminant(self).cmp(&discriminant(other)),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Integer(i) => write!(f, "{i}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Text(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Column – logical column addressed by queries
// ---------------------------------------------------------------------------

/// A logical column of the store. `Tag` columns live inside the physical
/// `metadata` column; the others map one-to-one onto physical columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Column {
    Path,
    Dtype,
    Width,
    Height,
    Pixels,
    /// Every stored tag of the row.
    Metadata,
    /// DICOM tag as `(group << 16) | element`.
    Tag(u32),
}

impl Column {
    /// Name of the physical column holding this logical column.
    pub fn physical_name(&self) -> &'static str {
        match self {
            Column::Path => PATH,
            Column::Dtype => DTYPE,
            Column::Width => WIDTH,
            Column::Height => HEIGHT,
            Column::Pixels => PIXELS,
            Column::Metadata | Column::Tag(_) => METADATA,
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Column::Tag(tag) => write!(f, "({:04X},{:04X})", tag >> 16, tag & 0xFFFF),
            other => f.write_str(other.physical_name()),
        }
    }
}

// ---------------------------------------------------------------------------
// PixelType – sample layout of the stored pixel buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    I8,
    U16,
    I16,
}

impl PixelType {
    /// Derive the sample type from Bits Allocated / Pixel Representation.
    pub fn from_layout(bits_allocated: u16, signed: bool) -> Option<Self> {
        match (bits_allocated, signed) {
            (8, false) => Some(PixelType::U8),
            (8, true) => Some(PixelType::I8),
            (16, false) => Some(PixelType::U16),
            (16, true) => Some(PixelType::I16),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelType::U8 => "uint8",
            PixelType::I8 => "int8",
            PixelType::U16 => "uint16",
            PixelType::I16 => "int16",
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PixelType::U8 | PixelType::I8 => 1,
            PixelType::U16 | PixelType::I16 => 2,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uint8" => Ok(PixelType::U8),
            "int8" => Ok(PixelType::I8),
            "uint16" => Ok(PixelType::U16),
            "int16" => Ok(PixelType::I16),
            other => bail!("unknown pixel dtype '{other}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameRecord – one row written by the loader
// ---------------------------------------------------------------------------

/// One decoded 2D frame plus its flat metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub path: String,
    pub dtype: PixelType,
    /// First array dimension (rows).
    pub width: u32,
    /// Second array dimension (columns).
    pub height: u32,
    /// Raw samples, little endian, `width * height * bytes_per_sample` bytes.
    pub pixels: Vec<u8>,
    pub tags: BTreeMap<u32, TagValue>,
}

// ---------------------------------------------------------------------------
// SelectedRow – one row streamed by `select`
// ---------------------------------------------------------------------------

/// A row returned by a query. Only projected columns are populated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectedRow {
    pub path: Option<String>,
    pub dtype: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixels: Option<Vec<u8>>,
    pub tags: BTreeMap<u32, TagValue>,
}

impl SelectedRow {
    pub fn path(&self) -> Result<&str> {
        self.path.as_deref().ok_or_else(|| not_projected(Column::Path))
    }

    /// Stored sample type; an unknown dtype string is an error.
    pub fn dtype(&self) -> Result<PixelType> {
        self.dtype.as_deref().ok_or_else(|| not_projected(Column::Dtype))?.parse()
    }

    pub fn width(&self) -> Result<u32> {
        self.width.ok_or_else(|| not_projected(Column::Width))
    }

    pub fn height(&self) -> Result<u32> {
        self.height.ok_or_else(|| not_projected(Column::Height))
    }

    pub fn pixels(&self) -> Result<&[u8]> {
        self.pixels.as_deref().ok_or_else(|| not_projected(Column::Pixels))
    }

    /// Value of a metadata tag, if the row carries it.
    pub fn tag(&self, tag: u32) -> Option<&TagValue> {
        self.tags.get(&tag)
    }
}

fn not_projected(column: Column) -> anyhow::Error {
    anyhow!("column '{column}' was not projected by the query")
}
