//! DICOM ingestion: one [`FrameRecord`] per readable 2D image.
//!
//! Files that cannot be opened, carry no pixel data, are not a single 2D
//! frame, or use a sample layout we cannot store are skipped and logged;
//! they never abort a load.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use dicom_core::dictionary::DataDictionary;
use dicom_core::header::Header;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::mem::InMemElement;
use dicom_object::{open_file, DefaultDicomObject};

use crate::store::{ColumnFileWriter, FrameRecord, PixelType, TagValue};

/// Explicit VR Big Endian, the one transfer syntax whose native samples are
/// not little endian.
const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Whether pixel bytes under `transfer_syntax` can be stored as-is.
pub fn is_little_endian(transfer_syntax: &str) -> bool {
    transfer_syntax.trim_end_matches(['\0', ' ']) != EXPLICIT_VR_BIG_ENDIAN
}

/// Store key of a DICOM tag.
pub fn tag_key(tag: Tag) -> u32 {
    (u32::from(tag.group()) << 16) | u32::from(tag.element())
}

/// Dictionary keyword of a store key, e.g. `PatientSex`, or `None` for
/// private and unknown tags.
pub fn tag_keyword(key: u32) -> Option<&'static str> {
    let tag = Tag((key >> 16) as u16, (key & 0xFFFF) as u16);
    StandardDataDictionary.by_tag(tag).map(|entry| entry.alias)
}

// ---------------------------------------------------------------------------
// Metadata encoding
// ---------------------------------------------------------------------------

/// How an element is stored in the metadata map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Text,
    Integer,
    Float,
    /// Multi-valued decimal string, joined with commas.
    DecimalList,
    Unsupported,
}

/// Pick the storage encoding for an element from its VR and value count.
pub fn classify(vr: VR, multiplicity: u32) -> Encoding {
    use VR::*;
    match vr {
        DS if multiplicity > 1 => Encoding::DecimalList,
        AE | AS | CS | DA | DT | LO | LT | PN | SH | ST | TM | UI | UT if multiplicity <= 1 => {
            Encoding::Text
        }
        IS | SS | US | SL | UL if multiplicity == 1 => Encoding::Integer,
        DS | FL | FD if multiplicity == 1 => Encoding::Float,
        _ => Encoding::Unsupported,
    }
}

/// Shortest round-trip decimals, comma separated.
pub fn format_decimal_list(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn encode_element(elem: &InMemElement) -> Option<TagValue> {
    let multiplicity = elem.value().primitive()?.multiplicity();
    match classify(elem.vr(), multiplicity) {
        Encoding::Text => elem
            .to_str()
            .ok()
            .map(|s| TagValue::Text(s.trim_end_matches(['\0', ' ']).to_string())),
        Encoding::Integer => elem.to_int::<i64>().ok().map(TagValue::Integer),
        Encoding::Float => elem.to_float64().ok().map(|v| {
            if v.is_finite() {
                TagValue::Float(v)
            } else {
                TagValue::Text(v.to_string())
            }
        }),
        Encoding::DecimalList => elem
            .to_multi_float64()
            .ok()
            .map(|v| TagValue::Text(format_decimal_list(&v))),
        Encoding::Unsupported => None,
    }
}

// ---------------------------------------------------------------------------
// DicomLoader
// ---------------------------------------------------------------------------

/// Summary of a load run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub stored: usize,
    pub skipped: usize,
    pub total_rows: usize,
}

/// Reads DICOM files into frame rows.
///
/// Remembers which tags it has already reported as unsupported, so each
/// unseen tag is logged once per loader.
#[derive(Debug, Default)]
pub struct DicomLoader {
    reported: BTreeSet<u32>,
}

impl DicomLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one file. Returns `None` when the file should be skipped.
    pub fn read_frame(&mut self, path: &Path) -> Option<FrameRecord> {
        let obj = match open_file(path) {
            Ok(obj) => obj,
            Err(e) => {
                log::warn!("{}: not readable as DICOM: {e}", path.display());
                return None;
            }
        };

        let (dtype, width, height, pixels) = match extract_pixels(&obj) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("{}: no single 2D frame, skipping", path.display());
                return None;
            }
            Err(e) => {
                log::debug!("{}: pixel data not decodable: {e:#}", path.display());
                return None;
            }
        };

        Some(FrameRecord {
            path: path.to_string_lossy().into_owned(),
            dtype,
            width,
            height,
            pixels,
            tags: self.collect_metadata(&obj),
        })
    }

    fn collect_metadata(&mut self, obj: &DefaultDicomObject) -> BTreeMap<u32, TagValue> {
        let mut metadata = BTreeMap::new();
        for elem in obj.iter() {
            if elem.tag() == tags::PIXEL_DATA {
                continue;
            }
            let key = tag_key(elem.tag());
            match encode_element(elem) {
                Some(value) => {
                    metadata.insert(key, value);
                }
                None => {
                    if self.reported.insert(key) {
                        log::info!(
                            "tag {} ({:?}) has no scalar encoding, not stored",
                            elem.tag(),
                            elem.vr()
                        );
                    }
                }
            }
        }
        metadata
    }
}

fn element_u32(obj: &DefaultDicomObject, tag: Tag) -> Result<Option<u32>> {
    obj.get(tag)
        .map(|e| e.to_int::<u32>().with_context(|| format!("reading {tag}")))
        .transpose()
}

/// Shape, sample type and raw bytes of a single 2D frame.
fn extract_pixels(obj: &DefaultDicomObject) -> Result<Option<(PixelType, u32, u32, Vec<u8>)>> {
    let Some(data) = obj.get(tags::PIXEL_DATA) else {
        return Ok(None);
    };
    let syntax = obj.meta().transfer_syntax();
    if !is_little_endian(syntax) {
        bail!("transfer syntax {syntax} is big endian");
    }
    let samples = element_u32(obj, tags::SAMPLES_PER_PIXEL)?.unwrap_or(1);
    let frames = element_u32(obj, tags::NUMBER_OF_FRAMES)?.unwrap_or(1);
    if samples != 1 || frames != 1 {
        return Ok(None);
    }

    let rows = element_u32(obj, tags::ROWS)?.context("missing Rows")?;
    let columns = element_u32(obj, tags::COLUMNS)?.context("missing Columns")?;
    let bits = element_u32(obj, tags::BITS_ALLOCATED)?.context("missing Bits Allocated")?;
    let signed = element_u32(obj, tags::PIXEL_REPRESENTATION)?.unwrap_or(0) == 1;

    let dtype = u16::try_from(bits)
        .ok()
        .and_then(|b| PixelType::from_layout(b, signed))
        .with_context(|| format!("unsupported bits allocated: {bits}"))?;

    let bytes = data.to_bytes().context("pixel data is not native")?;
    let expected = rows as usize * columns as usize * dtype.bytes_per_sample();
    if bytes.len() < expected {
        bail!("pixel data holds {} bytes, expected {expected}", bytes.len());
    }

    Ok(Some((dtype, rows, columns, bytes[..expected].to_vec())))
}

/// Load every input into the store at `output`, flushing every
/// `flush_interval` rows.
pub fn load_dicoms(inputs: &[impl AsRef<Path>], output: &Path, flush_interval: usize) -> Result<LoadSummary> {
    let mut writer = ColumnFileWriter::append(output)?;
    writer.set_flush_interval(flush_interval);

    let mut loader = DicomLoader::new();
    let mut summary = LoadSummary::default();

    for input in inputs {
        match loader.read_frame(input.as_ref()) {
            Some(frame) => {
                writer.add_row(frame)?;
                summary.stored += 1;
            }
            None => summary.skipped += 1,
        }
    }

    summary.total_rows = writer.finish()?;
    Ok(summary)
}
