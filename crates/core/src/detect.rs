//! ONNX-backed face-detection collaborator.
//!
//! The detection model itself is opaque: this adapter only does tensor
//! plumbing against an exported detector with one (N, 3, H, W) RGB input in
//! [0, 1] and one (N, 5) output of `[x1, y1, x2, y2, score]` rows in pixel
//! coordinates — the strongest detection per image. A score below the
//! threshold means the frame has no usable face.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use ndarray::{Array4, Ix2};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use crate::backend::{build_session, is_memory_exhaustion, ComputeDevice, SessionConfig};
use crate::error::DetectError;
use crate::locator::{FaceDetector, RawBox};
use crate::types::Frame;

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;

pub struct OrtFaceDetector {
    session: Arc<Mutex<Session>>,
    input_name: String,
    output_name: String,
    score_threshold: f32,
}

impl OrtFaceDetector {
    pub fn load(model_path: &Path, device: ComputeDevice, score_threshold: f32) -> Result<Self> {
        let session = build_session(&SessionConfig { model_path, device })?;
        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();

        debug!(
            model = %model_path.display(),
            %input_name, %output_name, score_threshold,
            "Loaded face-detection model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            input_name,
            output_name,
            score_threshold,
        })
    }

    /// Interleaved u8 frames to a normalized (N, 3, H, W) batch tensor.
    fn batch_tensor(batch: &[&Frame]) -> Result<Array4<f32>> {
        let (w, h) = (batch[0].width as usize, batch[0].height as usize);
        for frame in batch {
            if frame.width as usize != w || frame.height as usize != h {
                return Err(anyhow!(
                    "detection batch mixes frame sizes: {}x{} vs {w}x{h}",
                    frame.width,
                    frame.height
                ));
            }
        }

        let mut tensor = Array4::zeros((batch.len(), 3, h, w));
        for (n, frame) in batch.iter().enumerate() {
            for y in 0..h {
                for x in 0..w {
                    for c in 0..3 {
                        tensor[[n, c, y, x]] = frame.data[(y * w + x) * 3 + c] as f32 / 255.0;
                    }
                }
            }
        }
        Ok(tensor)
    }
}

impl FaceDetector for OrtFaceDetector {
    fn detect(&self, batch: &[&Frame]) -> Result<Vec<Option<RawBox>>, DetectError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let input = Self::batch_tensor(batch)?;
        let input_tensor = Tensor::from_array(input).map_err(anyhow::Error::from)?;

        let detections = {
            let mut session = self.session.lock().unwrap();
            let outputs = session
                .run(ort::inputs![self.input_name.as_str() => &input_tensor])
                .map_err(classify_run_error)?;
            outputs[self.output_name.as_str()]
                .try_extract_array::<f32>()
                .map_err(anyhow::Error::from)?
                .to_owned()
        };

        let detections = detections
            .into_dimensionality::<Ix2>()
            .context("detector output is not an (N, 5) tensor")
            .map_err(DetectError::Other)?;
        if detections.nrows() != batch.len() || detections.ncols() != 5 {
            return Err(DetectError::Other(anyhow!(
                "detector output shape ({}, {}) does not match batch of {}",
                detections.nrows(),
                detections.ncols(),
                batch.len()
            )));
        }

        Ok(detections
            .rows()
            .into_iter()
            .map(|row| {
                if row[4] < self.score_threshold {
                    None
                } else {
                    Some(RawBox {
                        x1: row[0].round() as i64,
                        y1: row[1].round() as i64,
                        x2: row[2].round() as i64,
                        y2: row[3].round() as i64,
                    })
                }
            })
            .collect())
    }
}

/// Map a session failure to the retryable exhaustion signal when the runtime
/// reports device allocation failure.
fn classify_run_error(error: ort::Error) -> DetectError {
    if is_memory_exhaustion(&error.to_string()) {
        DetectError::ResourceExhausted
    } else {
        DetectError::Other(error.into())
    }
}
