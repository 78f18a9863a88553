use std::collections::BTreeMap;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use ndarray::{Array2, Array3, ArrayBase, Axis, DataMut, Dimension};

use super::pattern::{FramePattern, FrameSelection, View};
use super::StudyError;
use crate::store::{Column, PixelType, Query, SelectedRow};

// ---------------------------------------------------------------------------
// Frame decoding and resampling
// ---------------------------------------------------------------------------

/// Decode a stored `uint16` frame into a `(width, height)` array scaled to
/// `[0, 1]`.
pub fn decode_frame(dtype: PixelType, width: u32, height: u32, bytes: &[u8]) -> Result<Array2<f32>, StudyError> {
    if dtype != PixelType::U16 {
        return Err(StudyError::UnsupportedDtype(dtype.to_string()));
    }
    let (rows, cols) = (width as usize, height as usize);
    if rows == 0 || cols == 0 {
        return Err(StudyError::EmptyFrame);
    }
    let expected = rows * cols * 2;
    if bytes.len() < expected {
        return Err(StudyError::ShortPixelBuffer {
            width,
            height,
            expected,
            found: bytes.len(),
        });
    }

    let samples: Vec<f32> = bytes[..expected]
        .chunks_exact(2)
        .map(|pair| f32::from(u16::from_le_bytes([pair[0], pair[1]])) / f32::from(u16::MAX))
        .collect();
    Array2::from_shape_vec((rows, cols), samples).map_err(|_| StudyError::EmptyFrame)
}

/// Bilinear resample to `size × size`. Values must lie in `[0, 1]`.
pub fn resize(frame: &Array2<f32>, size: usize) -> Result<Array2<f32>> {
    let (rows, cols) = frame.dim();
    let samples: Vec<f32> = frame.iter().copied().collect();
    let image = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(cols as u32, rows as u32, samples)
        .context("frame buffer does not match its shape")?;

    let resized = imageops::resize(&image, size as u32, size as u32, FilterType::Triangle);
    Array2::from_shape_vec((size, size), resized.into_raw()).context("reshaping resized frame")
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Shift and scale in place to zero mean and unit (population) variance.
/// Returns `false`, leaving the values untouched, when the input is
/// constant or empty.
pub fn standardize<S, D>(values: &mut ArrayBase<S, D>) -> bool
where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    let n = values.len();
    if n == 0 {
        return false;
    }
    let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64;
    let variance = values
        .iter()
        .map(|&v| (f64::from(v) - mean).powi(2))
        .sum::<f64>()
        / n as f64;
    let stddev = variance.sqrt();
    if stddev.is_nan() || stddev <= 0.0 {
        return false;
    }
    values.mapv_inplace(|v| ((f64::from(v) - mean) / stddev) as f32);
    true
}

/// Subtract the per-pixel mean over time from every frame, leaving what
/// moves during the cardiac cycle.
pub fn subtract_temporal_mean(stack: &mut Array3<f32>) {
    if let Some(mean) = stack.mean_axis(Axis(0)) {
        *stack -= &mean;
    }
}

// ---------------------------------------------------------------------------
// FrameAccumulator
// ---------------------------------------------------------------------------

/// Collects the frames of every study streamed out of the store.
///
/// Create it before the select, feed it each row, then [`finish`] it to
/// get one normalized `(frames, size, size)` stack per study.
///
/// [`finish`]: FrameAccumulator::finish
#[derive(Debug)]
pub struct FrameAccumulator {
    pattern: FramePattern,
    image_size: usize,
    stack_depth: usize,
    studies: BTreeMap<u32, Array3<f32>>,
}

impl FrameAccumulator {
    /// `stack_depth` is the number of time frames kept per study when
    /// `selection` is [`FrameSelection::Stack`]; the first-frame variant
    /// always keeps one.
    pub fn new(view: View, selection: FrameSelection, image_size: usize, stack_depth: usize) -> Result<Self> {
        let stack_depth = match selection {
            FrameSelection::First => 1,
            FrameSelection::Stack => stack_depth,
        };
        Ok(Self {
            pattern: FramePattern::new(view, selection)?,
            image_size,
            stack_depth,
            studies: BTreeMap::new(),
        })
    }

    /// Store query returning the rows this accumulator accepts.
    pub fn query(&self) -> Query {
        Query::new([Column::Path, Column::Dtype, Column::Width, Column::Height, Column::Pixels])
            .filter(Column::Path, self.pattern.predicate())
    }

    pub fn ingest(&mut self, row: &SelectedRow) -> Result<()> {
        let path = row.path()?;
        let key = self
            .pattern
            .locate(path)
            .ok_or_else(|| StudyError::UnrecognizedPath(path.to_string()))?;
        if key.frame >= self.stack_depth {
            return Err(StudyError::FrameOutOfRange {
                study: key.study,
                frame: key.frame,
                capacity: self.stack_depth,
            }
            .into());
        }

        let frame = decode_frame(row.dtype()?, row.width()?, row.height()?, row.pixels()?)
            .with_context(|| format!("decoding {path}"))?;
        let frame = resize(&frame, self.image_size).with_context(|| format!("resizing {path}"))?;

        let (depth, size) = (self.stack_depth, self.image_size);
        let stack = self
            .studies
            .entry(key.study)
            .or_insert_with(|| Array3::zeros((depth, size, size)));
        if depth == 1 && stack.iter().any(|&v| v != 0.0) {
            log::debug!("study {}: replacing first frame with {path}", key.study);
        }
        stack.index_axis_mut(Axis(0), key.frame).assign(&frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Normalize every study and hand the stacks over.
    pub fn finish(self) -> Result<BTreeMap<u32, Array3<f32>>, StudyError> {
        let stacked = self.stack_depth > 1;
        let mut studies = self.studies;
        for (study, stack) in studies.iter_mut() {
            if stacked {
                subtract_temporal_mean(stack);
            }
            if !standardize(stack) {
                return Err(StudyError::ZeroVariance(*study));
            }
        }
        Ok(studies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn frame_bytes(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn row(path: &str, width: u32, height: u32, values: &[u16]) -> SelectedRow {
        SelectedRow {
            path: Some(path.to_string()),
            dtype: Some("uint16".to_string()),
            width: Some(width),
            height: Some(height),
            pixels: Some(frame_bytes(values)),
            ..Default::default()
        }
    }

    fn mean_and_std(values: &Array3<f32>) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let var = values.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
    }

    #[test]
    fn decode_scales_to_unit_range() {
        let frame = decode_frame(PixelType::U16, 2, 2, &frame_bytes(&[0, 65535, 0, 65535])).unwrap();
        assert_eq!(frame, array![[0.0, 1.0], [0.0, 1.0]]);
    }

    #[test]
    fn decode_rejects_other_dtypes_and_short_buffers() {
        assert_eq!(
            decode_frame(PixelType::I16, 1, 1, &[0, 0]),
            Err(StudyError::UnsupportedDtype("int16".into()))
        );
        assert!(matches!(
            decode_frame(PixelType::U16, 2, 2, &[0, 0]),
            Err(StudyError::ShortPixelBuffer { expected: 8, found: 2, .. })
        ));
        assert_eq!(decode_frame(PixelType::U16, 0, 4, &[]), Err(StudyError::EmptyFrame));
    }

    #[test]
    fn resize_keeps_constant_images_constant() {
        let frame = Array2::from_elem((10, 6), 0.25f32);
        let resized = resize(&frame, 4).unwrap();
        assert_eq!(resized.dim(), (4, 4));
        for &v in resized.iter() {
            assert_abs_diff_eq!(v, 0.25, epsilon = 1e-5);
        }
    }

    #[test]
    fn standardize_gives_zero_mean_unit_variance() {
        let mut values = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 9.0]];
        assert!(standardize(&mut values));
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let var = values.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn standardize_refuses_constant_input() {
        let mut values = Array2::from_elem((3, 3), 7.0f32);
        assert!(!standardize(&mut values));
        assert_eq!(values, Array2::from_elem((3, 3), 7.0f32));
    }

    #[test]
    fn temporal_mean_removes_static_content() {
        let mut stack = Array3::from_shape_fn((3, 2, 2), |(t, r, _)| (10 * r + t) as f32);
        subtract_temporal_mean(&mut stack);
        assert_abs_diff_eq!(stack[[0, 1, 0]], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stack[[1, 0, 1]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stack[[2, 1, 1]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn first_frame_studies_are_standardized() {
        let mut acc = FrameAccumulator::new(View::TwoChamber, FrameSelection::First, 4, 30).unwrap();
        let values: Vec<u16> = (0..16).map(|v| v * 1000).collect();
        acc.ingest(&row("train/3/study/2ch_1/IM-0001-0001.dcm", 4, 4, &values)).unwrap();
        acc.ingest(&row("train/5/study/2ch_1/IM-0002-0001.dcm", 4, 4, &values)).unwrap();
        assert_eq!(acc.len(), 2);

        let studies = acc.finish().unwrap();
        let stack = &studies[&3];
        assert_eq!(stack.dim(), (1, 4, 4));
        let (mean, std) = mean_and_std(stack);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(std, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn stacks_place_frames_by_index() {
        let mut acc = FrameAccumulator::new(View::FourChamber, FrameSelection::Stack, 2, 3).unwrap();
        acc.ingest(&row("7/study/4ch_1/IM-0001-0001.dcm", 2, 2, &[100; 4])).unwrap();
        acc.ingest(&row("7/study/4ch_1/IM-0001-0003.dcm", 2, 2, &[900; 4])).unwrap();

        let studies = acc.finish().unwrap();
        let stack = &studies[&7];
        assert_eq!(stack.dim(), (3, 2, 2));
        // Frame 1 was never stored; after removing the temporal mean the
        // last frame is the brightest.
        assert!(stack[[2, 0, 0]] > stack[[0, 0, 0]]);
        assert!(stack[[0, 0, 0]] > stack[[1, 0, 0]]);
        let (mean, std) = mean_and_std(stack);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(std, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn frames_beyond_the_stack_abort() {
        let mut acc = FrameAccumulator::new(View::FourChamber, FrameSelection::Stack, 2, 3).unwrap();
        let err = acc
            .ingest(&row("7/study/4ch_1/IM-0001-0004.dcm", 2, 2, &[1; 4]))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<StudyError>(),
            Some(&StudyError::FrameOutOfRange { study: 7, frame: 3, capacity: 3 })
        );
    }

    #[test]
    fn constant_studies_abort() {
        let mut acc = FrameAccumulator::new(View::TwoChamber, FrameSelection::First, 2, 30).unwrap();
        acc.ingest(&row("4/study/2ch_1/IM-0001-0001.dcm", 2, 2, &[500; 4])).unwrap();
        assert_eq!(acc.finish().unwrap_err(), StudyError::ZeroVariance(4));
    }
}
