//! Audio feature alignment: slices the (F, T) feature map into one
//! fixed-width window per output video frame.

use anyhow::{bail, Result};
use ndarray::{s, Array2};

use crate::error::PipelineError;
use crate::types::AudioFeatureWindow;

/// Feature-map columns produced per second of audio by the extraction
/// collaborator (mel hop of 200 samples at 16 kHz).
pub const DEFAULT_FEATURE_RATE: f64 = 80.0;
/// Columns of audio context the model consumes per frame.
pub const DEFAULT_WINDOW_WIDTH: usize = 16;

/// Time-frequency representation of the driving audio, shape (F, T).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFeatureMap {
    data: Array2<f32>,
}

impl AudioFeatureMap {
    pub fn new(data: Array2<f32>) -> Self {
        Self { data }
    }

    /// Build from a row-major buffer of `bins * steps` values.
    pub fn from_raw(values: Vec<f32>, bins: usize, steps: usize) -> Result<Self> {
        if values.len() != bins * steps {
            bail!(
                "feature map length mismatch: expected {} ({bins}x{steps}), got {}",
                bins * steps,
                values.len()
            );
        }
        Ok(Self {
            data: Array2::from_shape_vec((bins, steps), values)?,
        })
    }

    /// Number of feature bins (F).
    pub fn bins(&self) -> usize {
        self.data.nrows()
    }

    /// Number of time steps (T).
    pub fn steps(&self) -> usize {
        self.data.ncols()
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.data
    }
}

/// Slice the feature map into ordered windows, one per output frame.
///
/// Window i starts at column `floor(i * feature_rate / fps)`. The final window
/// is the last `window_width` columns of the map and deliberately overlaps its
/// predecessor; it is the only window that is not frame-aligned.
pub fn align_windows(
    map: &AudioFeatureMap,
    fps: f64,
    feature_rate: f64,
    window_width: usize,
) -> Result<Vec<AudioFeatureWindow>> {
    if fps <= 0.0 {
        bail!("fps must be positive, got {fps}");
    }
    if feature_rate <= 0.0 {
        bail!("feature_rate must be positive, got {feature_rate}");
    }
    if window_width == 0 {
        bail!("window_width must be positive");
    }

    let steps = map.steps();
    if steps < window_width {
        return Err(PipelineError::InvalidAudioLength {
            time_steps: steps,
            window_width,
        }
        .into());
    }

    let stride = feature_rate / fps;
    let mut windows = Vec::new();
    let mut i = 0usize;
    loop {
        let start = (i as f64 * stride) as usize;
        if start + window_width > steps {
            windows.push(AudioFeatureWindow {
                data: map.as_array().slice(s![.., steps - window_width..]).to_owned(),
                frame_index: i,
            });
            break;
        }
        windows.push(AudioFeatureWindow {
            data: map
                .as_array()
                .slice(s![.., start..start + window_width])
                .to_owned(),
            frame_index: i,
        });
        i += 1;
    }

    Ok(windows)
}
