//! Stroke dataset loading and batching.
//!
//! Raw sketches arrive in stroke-3 form, `(Δx, Δy, lift)` per step, inside a
//! JSON file with `train`, `valid` and `test` splits. [`StrokesDataset`]
//! filters them by length, normalises offsets and converts them to padded
//! stroke-5 rows:
//! - row 0 is the start token `(0, 0, 1, 0, 0)`
//! - rows `1..=len` hold `(Δx/scale, Δy/scale, 1 - lift, lift, 0)`
//! - the remaining rows are end tokens `(0, 0, 0, 0, 1)`
//!
//! The mask is 1 on the start token, every stroke and the first end token.
//! [`DataLoader`] yields time-major [`StrokeBatch`]es.
//!
//! # Example
//!
//! ```no_run
//! use sketch_rnn_rs::data::{DataLoader, StrokeSplits, StrokesDataset};
//! use candle_core::Device;
//!
//! let splits = StrokeSplits::from_json_file("data/sketch/bicycle.json").unwrap();
//! let train = StrokesDataset::new(&splits.train, 200, 10, None).unwrap();
//! let valid = StrokesDataset::new(&splits.valid, 200, 10, Some(train.scale())).unwrap();
//!
//! for batch in DataLoader::new(&train, 100, Device::Cpu) {
//!     let batch = batch.unwrap();
//!     println!("seq_len: {}, batch: {}", batch.seq_len(), batch.batch_size());
//! }
//! # let _ = valid;
//! ```

use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{SketchError, SketchResult};

/// One stroke-3 step: `(Δx, Δy, lift)`.
pub type Stroke3 = [f32; 3];

/// Offsets are clamped to this magnitude before normalisation.
pub const MAX_OFFSET: f32 = 1000.0;

/// Start-of-sequence token.
pub const START_TOKEN: [f32; 5] = [0.0, 0.0, 1.0, 0.0, 0.0];

/// End-of-sequence / padding token.
pub const END_TOKEN: [f32; 5] = [0.0, 0.0, 0.0, 0.0, 1.0];

/// Raw splits as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrokeSplits {
    /// Training sketches
    #[serde(default)]
    pub train: Vec<Vec<Stroke3>>,
    /// Validation sketches
    #[serde(default)]
    pub valid: Vec<Vec<Stroke3>>,
    /// Test sketches
    #[serde(default)]
    pub test: Vec<Vec<Stroke3>>,
}

impl StrokeSplits {
    /// Read splits from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SketchResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SketchError::data(format!("failed to read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write splits to a JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> SketchResult<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Padded, normalised stroke-5 sequences.
#[derive(Debug, Clone)]
pub struct StrokesDataset {
    /// `[n, seq_len, 5]`, row-major
    data: Vec<f32>,
    /// `[n, seq_len]`, row-major
    mask: Vec<f32>,
    lengths: Vec<usize>,
    seq_len: usize,
    scale: f32,
}

impl StrokesDataset {
    /// Build a dataset from stroke-3 sketches.
    ///
    /// Keeps sketches with `min_seq_length < len <= max_seq_length`. When
    /// `scale` is `None` it is the standard deviation of every kept offset;
    /// pass the training scale when building validation or test sets.
    pub fn new(
        sequences: &[Vec<Stroke3>],
        max_seq_length: usize,
        min_seq_length: usize,
        scale: Option<f32>,
    ) -> SketchResult<Self> {
        let kept: Vec<Vec<Stroke3>> = sequences
            .iter()
            .filter(|s| s.len() > min_seq_length && s.len() <= max_seq_length)
            .map(|s| {
                s.iter()
                    .map(|&[dx, dy, lift]| {
                        [
                            dx.clamp(-MAX_OFFSET, MAX_OFFSET),
                            dy.clamp(-MAX_OFFSET, MAX_OFFSET),
                            lift,
                        ]
                    })
                    .collect()
            })
            .collect();

        if kept.is_empty() {
            return Err(SketchError::data(format!(
                "no sequences with {min_seq_length} < length <= {max_seq_length} (of {})",
                sequences.len()
            )));
        }

        let scale = match scale {
            Some(scale) => scale,
            None => offset_std(&kept),
        };
        if !(scale.is_finite() && scale > 0.0) {
            return Err(SketchError::data(format!(
                "offset scale must be positive, got {scale}"
            )));
        }

        let longest = kept.iter().map(Vec::len).max().unwrap_or(0);
        let seq_len = longest + 2;

        let mut data = Vec::with_capacity(kept.len() * seq_len * 5);
        let mut mask = Vec::with_capacity(kept.len() * seq_len);
        let mut lengths = Vec::with_capacity(kept.len());

        for seq in &kept {
            data.extend_from_slice(&START_TOKEN);
            for &[dx, dy, lift] in seq {
                data.extend_from_slice(&[dx / scale, dy / scale, 1.0 - lift, lift, 0.0]);
            }
            for _ in seq.len() + 1..seq_len {
                data.extend_from_slice(&END_TOKEN);
            }

            mask.extend((0..seq_len).map(|t| if t <= seq.len() + 1 { 1.0 } else { 0.0 }));
            lengths.push(seq.len());
        }

        tracing::debug!(
            kept = kept.len(),
            total = sequences.len(),
            seq_len,
            scale,
            "built strokes dataset"
        );

        Ok(Self {
            data,
            mask,
            lengths,
            seq_len,
            scale,
        })
    }

    /// Number of sketches
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    /// Whether the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Padded length (longest sketch + 2)
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Offset normalisation factor
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Stroke count of sketch `idx`
    pub fn length(&self, idx: usize) -> Option<usize> {
        self.lengths.get(idx).copied()
    }

    /// Stroke-5 rows of sketch `idx`, including start and padding rows.
    pub fn rows(&self, idx: usize) -> Option<Vec<[f32; 5]>> {
        if idx >= self.len() {
            return None;
        }
        let start = idx * self.seq_len * 5;
        let rows = self.data[start..start + self.seq_len * 5]
            .chunks_exact(5)
            .map(|r| [r[0], r[1], r[2], r[3], r[4]])
            .collect();
        Some(rows)
    }

    /// Sketch `idx` back in stroke-3 form with offsets in original units.
    pub fn stroke3(&self, idx: usize) -> Option<Vec<Stroke3>> {
        self.rows(idx).map(|rows| stroke5_to_stroke3(&rows[1..], self.scale))
    }

    /// Time-major batch `[seq_len, n, 5]` of the given sketches.
    pub fn batch(&self, indices: &[usize], device: &Device) -> SketchResult<StrokeBatch> {
        let n = self.len();
        let mut data = Vec::with_capacity(indices.len() * self.seq_len * 5);
        let mut mask = Vec::with_capacity(indices.len() * self.seq_len);

        for &idx in indices {
            if idx >= n {
                return Err(SketchError::data(format!(
                    "index {idx} out of range for dataset of {n}"
                )));
            }
            let d = idx * self.seq_len * 5;
            data.extend_from_slice(&self.data[d..d + self.seq_len * 5]);
            let m = idx * self.seq_len;
            mask.extend_from_slice(&self.mask[m..m + self.seq_len]);
        }

        let b = indices.len();
        let data = Tensor::from_vec(data, (b, self.seq_len, 5), device)?
            .transpose(0, 1)?
            .contiguous()?;
        let mask = Tensor::from_vec(mask, (b, self.seq_len), device)?
            .t()?
            .contiguous()?;

        StrokeBatch::new(data, mask)
    }
}

/// Pooled population standard deviation of every Δx and Δy.
fn offset_std(sequences: &[Vec<Stroke3>]) -> f32 {
    let values: Vec<f64> = sequences
        .iter()
        .flatten()
        .flat_map(|&[dx, dy, _]| [dx as f64, dy as f64])
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    var.sqrt() as f32
}

/// Convert stroke-5 rows (without the start token) to stroke-3, stopping at the
/// first end token and multiplying offsets by `scale`.
pub fn stroke5_to_stroke3(rows: &[[f32; 5]], scale: f32) -> Vec<Stroke3> {
    rows.iter()
        .take_while(|r| r[4] < 0.5)
        .map(|r| [r[0] * scale, r[1] * scale, r[3]])
        .collect()
}

/// A time-major batch.
#[derive(Debug, Clone)]
pub struct StrokeBatch {
    /// `[seq_len, batch, 5]`
    pub data: Tensor,
    /// `[seq_len, batch]`
    pub mask: Tensor,
}

impl StrokeBatch {
    /// Check shapes and wrap.
    pub fn new(data: Tensor, mask: Tensor) -> SketchResult<Self> {
        let (seq_len, batch, features) = data.dims3()?;
        if features != 5 {
            return Err(SketchError::shape_mismatch(
                "[T, B, 5]",
                format!("{:?}", data.dims()),
            ));
        }
        if mask.dims() != [seq_len, batch].as_slice() {
            return Err(SketchError::shape_mismatch(
                format!("[{seq_len}, {batch}]"),
                format!("{:?}", mask.dims()),
            ));
        }
        Ok(Self { data, mask })
    }

    /// Number of sequences
    pub fn batch_size(&self) -> usize {
        self.data.dims()[1]
    }

    /// Padded sequence length
    pub fn seq_len(&self) -> usize {
        self.data.dims()[0]
    }
}

/// Iterator over consecutive batches of a [`StrokesDataset`].
///
/// The final batch may be smaller than `batch_size`.
pub struct DataLoader<'a> {
    dataset: &'a StrokesDataset,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
    device: Device,
}

impl<'a> DataLoader<'a> {
    /// Sequential loader.
    pub fn new(dataset: &'a StrokesDataset, batch_size: usize, device: Device) -> Self {
        Self {
            dataset,
            order: (0..dataset.len()).collect(),
            batch_size: batch_size.max(1),
            position: 0,
            device,
        }
    }

    /// Visit sketches in an order drawn from `rng`.
    pub fn shuffled<R: Rng + ?Sized>(mut self, rng: &mut R) -> Self {
        self.order.shuffle(rng);
        self
    }

    /// Number of batches per pass
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl Iterator for DataLoader<'_> {
    type Item = SketchResult<StrokeBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;
        Some(self.dataset.batch(indices, &self.device))
    }
}
