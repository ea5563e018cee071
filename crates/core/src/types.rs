use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ndarray::{stack, Array2, Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

/// 8-bit RGB frame, interleaved HWC layout.
///
/// The pipeline never mutates a source frame in place; the Compositor clones
/// the pixel buffer before pasting synthesized regions back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            bail!(
                "frame data length mismatch: expected {expected} ({width}x{height}x3), got {}",
                data.len()
            );
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Extract the sub-image selected by `bbox` together with the box that
    /// produced it.
    pub fn crop(&self, bbox: BoundingBox) -> FaceCrop {
        let w = bbox.width() as usize;
        let h = bbox.height() as usize;
        let mut data = Vec::with_capacity(w * h * 3);
        let stride = self.width as usize * 3;
        for y in bbox.y1 as usize..bbox.y2 as usize {
            let row_start = y * stride + bbox.x1 as usize * 3;
            data.extend_from_slice(&self.data[row_start..row_start + w * 3]);
        }
        FaceCrop {
            data,
            width: w as u32,
            height: h as u32,
            bbox,
        }
    }
}

/// Axis-aligned face rectangle in source-frame pixel coordinates.
///
/// Constructed only through [`BoundingBox::clamped`], so `0 <= x1 < x2 <= w`
/// and `0 <= y1 < y2 <= h` always hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    /// Clamp raw (possibly padded, possibly negative) coordinates to the frame
    /// extent. Fails on a degenerate box.
    pub fn clamped(
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Self> {
        let cx1 = x1.clamp(0, frame_width as i64) as u32;
        let cy1 = y1.clamp(0, frame_height as i64) as u32;
        let cx2 = x2.clamp(0, frame_width as i64) as u32;
        let cy2 = y2.clamp(0, frame_height as i64) as u32;
        if cx1 >= cx2 || cy1 >= cy2 {
            bail!(
                "degenerate bounding box ({x1},{y1})-({x2},{y2}) after clamping to {frame_width}x{frame_height}"
            );
        }
        Ok(Self {
            x1: cx1,
            y1: cy1,
            x2: cx2,
            y2: cy2,
        })
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// Face sub-image plus the clamped box it was sliced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceCrop {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bbox: BoundingBox,
}

/// One fixed-width column slice of the global audio feature map, tagged with
/// the output frame index it drives.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFeatureWindow {
    /// (feature_bins, window_width)
    pub data: Array2<f32>,
    pub frame_index: usize,
}

/// One model-ready item: 6-channel masked+unmasked face tensor, its audio
/// window, and everything needed to paste the result back.
#[derive(Debug, Clone)]
pub struct ModelInputItem {
    /// (6, S, S), values in [0, 1]. Channels 0..3 are the lower-half-masked
    /// crop, channels 3..6 the unmodified crop.
    pub face: Array3<f32>,
    /// (1, feature_bins, window_width)
    pub mel: Array3<f32>,
    /// Output frame index (== audio window index).
    pub frame_index: usize,
    /// Frame the synthesized mouth is composited onto. Shared, never mutated.
    pub frame: Arc<Frame>,
    pub bbox: BoundingBox,
}

/// Ordered, bounded group of items submitted to the model in one call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub items: Vec<ModelInputItem>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Stack the per-item face tensors into (N, 6, S, S) for the model.
    pub fn face_tensor(&self) -> Result<Array4<f32>> {
        let views: Vec<_> = self.items.iter().map(|item| item.face.view()).collect();
        stack(Axis(0), &views).context("face tensors in batch have mismatched shapes")
    }

    /// Stack the per-item audio windows into (N, 1, F, W) for the model.
    pub fn mel_tensor(&self) -> Result<Array4<f32>> {
        let views: Vec<_> = self.items.iter().map(|item| item.mel.view()).collect();
        stack(Axis(0), &views).context("audio windows in batch have mismatched shapes")
    }
}

/// Model output for one item: (3, S, S) RGB, values in [0, 1].
#[derive(Debug, Clone)]
pub struct SynthesizedCrop {
    pub data: Array3<f32>,
}

/// Final frame for one output index; owned by the Sequencer from here on.
#[derive(Debug, Clone)]
pub struct CompositedFrame {
    pub index: usize,
    pub frame: Frame,
}

/// Which source frame feeds each audio window: a single static reference
/// image, or moving footage cycled frame by frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Every output frame reuses source frame 0.
    #[default]
    Static,
    /// Output frame i uses source frame `i % frame_count`.
    Moving,
}
