//! Output compositing: rescales each synthesized mouth crop to its recorded
//! box extent and pastes it into a fresh copy of the source frame.

use anyhow::{bail, Result};

use crate::resize::{resize_rgb, ResizeFilter};
use crate::types::{Batch, CompositedFrame, ModelInputItem, SynthesizedCrop};

/// Composite every item of a batch with its synthesized crop, in item order.
pub fn composite_batch(
    batch: &Batch,
    crops: &[SynthesizedCrop],
) -> Result<Vec<CompositedFrame>> {
    if crops.len() != batch.len() {
        bail!(
            "synthesized crop count {} does not match batch size {}",
            crops.len(),
            batch.len()
        );
    }

    batch
        .items
        .iter()
        .zip(crops)
        .map(|(item, crop)| composite_item(item, crop))
        .collect()
}

/// Paste one synthesized crop back at its recorded coordinates.
///
/// The source frame is cloned first; items sharing a source frame (static
/// reference mode) each get an independent copy.
pub fn composite_item(item: &ModelInputItem, crop: &SynthesizedCrop) -> Result<CompositedFrame> {
    let (channels, crop_h, crop_w) = crop.data.dim();
    if channels != 3 {
        bail!("synthesized crop must have 3 channels, got {channels}");
    }

    // Denormalize CHW [0,1] floats to interleaved 8-bit RGB.
    let mut rgb = vec![0u8; crop_h * crop_w * 3];
    for y in 0..crop_h {
        for x in 0..crop_w {
            for c in 0..3 {
                rgb[(y * crop_w + x) * 3 + c] =
                    (crop.data[[c, y, x]] * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    let box_w = item.bbox.width() as usize;
    let box_h = item.bbox.height() as usize;
    let rescaled = resize_rgb(&rgb, crop_w, crop_h, box_w, box_h, ResizeFilter::Bilinear);

    let mut frame = (*item.frame).clone();
    let stride = frame.width as usize * 3;
    for (row, chunk) in rescaled.chunks_exact(box_w * 3).enumerate() {
        let y = item.bbox.y1 as usize + row;
        let start = y * stride + item.bbox.x1 as usize * 3;
        frame.data[start..start + box_w * 3].copy_from_slice(chunk);
    }

    Ok(CompositedFrame {
        index: item.frame_index,
        frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Frame};
    use ndarray::{Array2, Array3, Axis};
    use std::sync::Arc;

    fn gradient_frame(w: u32, h: u32) -> Frame {
        let mut data = vec![0u8; w as usize * h as usize * 3];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i * 3 % 256) as u8;
        }
        Frame::new(data, w, h).unwrap()
    }

    fn item_for(frame: Arc<Frame>, bbox: BoundingBox, index: usize) -> ModelInputItem {
        ModelInputItem {
            face: Array3::zeros((6, 4, 4)),
            mel: Array2::<f32>::zeros((80, 16)).insert_axis(Axis(0)),
            frame_index: index,
            frame,
            bbox,
        }
    }

    /// Turn the pixels under `bbox` into the (3, h, w) [0,1] tensor the model
    /// would produce if it reconstructed the region perfectly.
    fn identity_crop(frame: &Frame, bbox: BoundingBox) -> SynthesizedCrop {
        let crop = frame.crop(bbox);
        let (w, h) = (crop.width as usize, crop.height as usize);
        let data = Array3::from_shape_fn((3, h, w), |(c, y, x)| {
            crop.data[(y * w + x) * 3 + c] as f32 / 255.0
        });
        SynthesizedCrop { data }
    }

    #[test]
    fn test_identity_model_round_trip() {
        let frame = Arc::new(gradient_frame(16, 16));
        let bbox = BoundingBox::clamped(4, 6, 10, 12, 16, 16).unwrap();
        let item = item_for(frame.clone(), bbox, 0);
        let crop = identity_crop(&frame, bbox);

        let composited = composite_item(&item, &crop).unwrap();
        // Same-extent rescale is exact, so the whole frame is reproduced.
        assert_eq!(composited.frame, *frame);
    }

    #[test]
    fn test_pixels_outside_box_untouched() {
        let frame = Arc::new(gradient_frame(12, 12));
        let bbox = BoundingBox::clamped(3, 3, 9, 9, 12, 12).unwrap();
        let item = item_for(frame.clone(), bbox, 0);
        let crop = SynthesizedCrop {
            data: Array3::from_elem((3, 6, 6), 1.0),
        };

        let composited = composite_item(&item, &crop).unwrap();
        for y in 0..12usize {
            for x in 0..12usize {
                let inside = (3..9).contains(&x) && (3..9).contains(&y);
                let offset = (y * 12 + x) * 3;
                if inside {
                    assert_eq!(&composited.frame.data[offset..offset + 3], &[255, 255, 255]);
                } else {
                    assert_eq!(
                        &composited.frame.data[offset..offset + 3],
                        &frame.data[offset..offset + 3]
                    );
                }
            }
        }
    }

    #[test]
    fn test_source_frame_never_mutated() {
        let frame = Arc::new(gradient_frame(8, 8));
        let original = (*frame).clone();
        let bbox = BoundingBox::clamped(0, 0, 8, 8, 8, 8).unwrap();
        let item_a = item_for(frame.clone(), bbox, 0);
        let item_b = item_for(frame.clone(), bbox, 1);
        let crop = SynthesizedCrop {
            data: Array3::from_elem((3, 8, 8), 0.5),
        };

        let a = composite_item(&item_a, &crop).unwrap();
        let b = composite_item(&item_b, &crop).unwrap();
        assert_eq!(*frame, original);
        assert_eq!(a.frame, b.frame);
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
    }

    #[test]
    fn test_crop_rescaled_to_box_extent() {
        let frame = Arc::new(gradient_frame(20, 20));
        // 10x6 box, model output is 4x4: compositor upscales.
        let bbox = BoundingBox::clamped(5, 7, 15, 13, 20, 20).unwrap();
        let item = item_for(frame, bbox, 2);
        let crop = SynthesizedCrop {
            data: Array3::from_elem((3, 4, 4), 0.0),
        };

        let composited = composite_item(&item, &crop).unwrap();
        for y in 7..13usize {
            for x in 5..15usize {
                let offset = (y * 20 + x) * 3;
                assert_eq!(&composited.frame.data[offset..offset + 3], &[0, 0, 0]);
            }
        }
    }

    #[test]
    fn test_batch_length_mismatch_rejected() {
        let frame = Arc::new(gradient_frame(8, 8));
        let bbox = BoundingBox::clamped(0, 0, 8, 8, 8, 8).unwrap();
        let batch = Batch {
            index: 0,
            items: vec![item_for(frame, bbox, 0)],
        };
        assert!(composite_batch(&batch, &[]).is_err());
    }
}
