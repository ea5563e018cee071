//! Batch assembly: pairs each audio feature window with a face crop, builds
//! the masked dual-channel model input, and yields capacity-bounded batches.

use std::sync::Arc;

use anyhow::{bail, Result};
use ndarray::{Array3, Axis};

use crate::resize::{resize_rgb, ResizeFilter};
use crate::types::{
    AudioFeatureWindow, Batch, BoundingBox, FaceCrop, Frame, ModelInputItem, SourceMode,
};

pub const DEFAULT_IMG_SIZE: usize = 96;
pub const DEFAULT_BATCH_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerOptions {
    /// Model input square size S; crops are resized to S x S.
    pub img_size: usize,
    /// Maximum items per batch; the final batch may be smaller.
    pub batch_capacity: usize,
    pub mode: SourceMode,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            img_size: DEFAULT_IMG_SIZE,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            mode: SourceMode::Static,
        }
    }
}

/// Build ordered batches, one item per audio window.
///
/// Audio length drives output length: item i takes `frames[0]` in static mode
/// and `frames[i % frames.len()]` in moving mode, so windows may outnumber
/// frames and cycle over them. Item order inside and across batches follows
/// window order.
pub fn assemble_batches(
    crops: &[(FaceCrop, BoundingBox)],
    frames: &[Arc<Frame>],
    windows: &[AudioFeatureWindow],
    opts: &AssemblerOptions,
) -> Result<Vec<Batch>> {
    if opts.img_size < 2 {
        bail!("img_size must be at least 2, got {}", opts.img_size);
    }
    if opts.batch_capacity == 0 {
        bail!("batch_capacity must be positive");
    }
    if frames.is_empty() || crops.is_empty() {
        bail!("assembler requires at least one frame and one face crop");
    }
    match opts.mode {
        SourceMode::Static => {}
        SourceMode::Moving => {
            if crops.len() != frames.len() {
                bail!(
                    "moving source needs one crop per frame: {} crops, {} frames",
                    crops.len(),
                    frames.len()
                );
            }
        }
    }

    // The tensor for a given source index never changes; build each once and
    // share it across the items that cycle back to it.
    let face_tensors: Vec<Array3<f32>> = crops
        .iter()
        .map(|(crop, _)| face_tensor(crop, opts.img_size))
        .collect();

    let mut batches = Vec::new();
    let mut items = Vec::with_capacity(opts.batch_capacity.min(windows.len()));

    for (i, window) in windows.iter().enumerate() {
        let source_index = match opts.mode {
            SourceMode::Static => 0,
            SourceMode::Moving => i % frames.len(),
        };

        items.push(ModelInputItem {
            face: face_tensors[source_index].clone(),
            mel: window.data.clone().insert_axis(Axis(0)),
            frame_index: window.frame_index,
            frame: Arc::clone(&frames[source_index]),
            bbox: crops[source_index].1,
        });

        if items.len() >= opts.batch_capacity {
            batches.push(Batch {
                index: batches.len(),
                items: std::mem::take(&mut items),
            });
        }
    }

    if !items.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            items,
        });
    }

    Ok(batches)
}

/// Resize a crop to S x S and build the 6-channel normalized tensor: channels
/// 0..3 are the crop with its lower half (rows >= S/2) zeroed, channels 3..6
/// the unmodified crop, all divided by 255.
fn face_tensor(crop: &FaceCrop, img_size: usize) -> Array3<f32> {
    let resized = resize_rgb(
        &crop.data,
        crop.width as usize,
        crop.height as usize,
        img_size,
        img_size,
        ResizeFilter::Bilinear,
    );

    let half = img_size / 2;
    let mut tensor = Array3::zeros((6, img_size, img_size));
    for y in 0..img_size {
        for x in 0..img_size {
            for c in 0..3 {
                let value = resized[(y * img_size + x) * 3 + c] as f32 / 255.0;
                tensor[[3 + c, y, x]] = value;
                if y < half {
                    tensor[[c, y, x]] = value;
                }
            }
        }
    }
    tensor
}
