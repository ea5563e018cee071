//! Face-region localization: chunked detection with adaptive batch-size
//! shrinkage on device memory exhaustion, padding, clamping, and temporal
//! smoothing of the detected boxes.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DetectError, PipelineError};
use crate::types::{BoundingBox, FaceCrop, Frame};

pub const DEFAULT_DETECT_BATCH_SIZE: usize = 64;
/// Width of the forward sliding window used to smooth box jitter.
pub const SMOOTHING_WINDOW: usize = 5;

/// Raw detector output in frame coordinates, unpadded and unclamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

/// Pixels of margin added around each detection before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Padding {
    pub top: i64,
    pub bottom: i64,
    pub left: i64,
    pub right: i64,
}

impl Default for Padding {
    fn default() -> Self {
        // Extra chin room; the mouth sits low in most detections.
        Self {
            top: 0,
            bottom: 10,
            left: 0,
            right: 0,
        }
    }
}

/// Face-detection collaborator. One call per chunk of frames; each slot of the
/// result is the detected box or `None` when the frame has no face.
///
/// Implementations must report device memory exhaustion as
/// [`DetectError::ResourceExhausted`] so the locator can shrink its chunk size
/// and retry; any other error aborts the run.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, batch: &[&Frame]) -> Result<Vec<Option<RawBox>>, DetectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorOptions {
    /// Requested detection chunk size; halved on exhaustion, re-seeded from
    /// config at the start of every run.
    pub batch_size: usize,
    pub pads: Padding,
    pub smooth: bool,
    /// Fixed (x1, y1, x2, y2) box; when set, detection is skipped entirely.
    pub override_box: Option<[i64; 4]>,
}

impl Default for LocatorOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_DETECT_BATCH_SIZE,
            pads: Padding::default(),
            smooth: true,
            override_box: None,
        }
    }
}

/// Produce one (crop, box) pair per input frame.
///
/// Detection runs over the whole sequence in chunks of the current batch size.
/// On [`DetectError::ResourceExhausted`] the partial pass is discarded, the
/// batch size is halved and the entire sequence is re-detected; once a pass
/// succeeds the size is final. A frame with no detectable face is fatal.
pub fn locate_faces(
    detector: &dyn FaceDetector,
    frames: &[Arc<Frame>],
    opts: &LocatorOptions,
) -> Result<Vec<(FaceCrop, BoundingBox)>> {
    if frames.is_empty() {
        bail!("cannot locate faces in an empty frame sequence");
    }

    if let Some([x1, y1, x2, y2]) = opts.override_box {
        info!(x1, y1, x2, y2, "using fixed bounding box, skipping face detection");
        return frames
            .iter()
            .map(|frame| {
                let bbox = BoundingBox::clamped(x1, y1, x2, y2, frame.width, frame.height)?;
                Ok((frame.crop(bbox), bbox))
            })
            .collect();
    }

    let predictions = detect_all(detector, frames, opts.batch_size)?;

    let mut boxes = Vec::with_capacity(frames.len());
    for (frame_index, (prediction, frame)) in predictions.iter().zip(frames).enumerate() {
        let raw = prediction.ok_or(PipelineError::FaceNotDetected { frame_index })?;
        let bbox = BoundingBox::clamped(
            raw.x1 - opts.pads.left,
            raw.y1 - opts.pads.top,
            raw.x2 + opts.pads.right,
            raw.y2 + opts.pads.bottom,
            frame.width,
            frame.height,
        )?;
        boxes.push(bbox);
    }

    if opts.smooth {
        smooth_boxes(&mut boxes, SMOOTHING_WINDOW);
    }

    Ok(frames
        .iter()
        .zip(&boxes)
        .map(|(frame, &bbox)| (frame.crop(bbox), bbox))
        .collect())
}

/// One full-sequence detection pass per batch size, restarting from frame 0
/// after every halving. Partial results from a failed pass are discarded.
fn detect_all(
    detector: &dyn FaceDetector,
    frames: &[Arc<Frame>],
    requested_batch_size: usize,
) -> Result<Vec<Option<RawBox>>> {
    let mut batch_size = requested_batch_size.max(1);

    loop {
        match detect_pass(detector, frames, batch_size) {
            Ok(predictions) => {
                debug!(batch_size, frames = frames.len(), "face detection pass complete");
                return Ok(predictions);
            }
            Err(DetectError::ResourceExhausted) => {
                if batch_size == 1 {
                    return Err(PipelineError::ResourceExhausted.into());
                }
                batch_size /= 2;
                info!(
                    new_batch_size = batch_size,
                    "recovering from detector memory exhaustion"
                );
            }
            Err(DetectError::Other(error)) => {
                return Err(error.context("face detection failed"));
            }
        }
    }
}

fn detect_pass(
    detector: &dyn FaceDetector,
    frames: &[Arc<Frame>],
    batch_size: usize,
) -> Result<Vec<Option<RawBox>>, DetectError> {
    let mut predictions = Vec::with_capacity(frames.len());
    for chunk in frames.chunks(batch_size) {
        let refs: Vec<&Frame> = chunk.iter().map(Arc::as_ref).collect();
        let chunk_predictions = detector.detect(&refs)?;
        if chunk_predictions.len() != chunk.len() {
            return Err(DetectError::Other(anyhow::anyhow!(
                "detector returned {} results for a chunk of {}",
                chunk_predictions.len(),
                chunk.len()
            )));
        }
        predictions.extend(chunk_predictions);
    }
    Ok(predictions)
}

/// In-place forward-window smoothing.
///
/// For index i the window is `boxes[i..i + window]`; when that runs past the
/// end, the window is the last `window` boxes instead, so the tail indices all
/// average the same span. Earlier indices are averaged before later ones, and
/// a tail window therefore sees already-smoothed values.
pub(crate) fn smooth_boxes(boxes: &mut [BoundingBox], window: usize) {
    let len = boxes.len();
    if len == 0 || window == 0 {
        return;
    }

    for i in 0..len {
        let span = if i + window > len {
            &boxes[len.saturating_sub(window)..]
        } else {
            &boxes[i..i + window]
        };

        let n = span.len() as f64;
        let (mut x1, mut y1, mut x2, mut y2) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for b in span {
            x1 += b.x1 as f64;
            y1 += b.y1 as f64;
            x2 += b.x2 as f64;
            y2 += b.y2 as f64;
        }

        boxes[i] = BoundingBox {
            x1: (x1 / n).round() as u32,
            y1: (y1 / n).round() as u32,
            x2: (x2 / n).round() as u32,
            y2: (y2 / n).round() as u32,
        };
    }
}
