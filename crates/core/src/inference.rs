//! Lip-sync inference collaborator: trait boundary plus the ONNX-backed
//! implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use ndarray::{Array4, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use crate::backend::{build_session, strip_export_prefix, ComputeDevice, SessionConfig};

/// Inference collaborator: maps a masked-face batch and an audio-feature batch
/// to a synthesized mouth-crop batch.
///
/// The output batch dimension must match the inputs 1:1; no side effects are
/// assumed, so callers may retry a whole run after a failure.
pub trait LipSyncModel: Send + Sync {
    /// `mel`: (N, 1, F, W) audio windows; `faces`: (N, 6, S, S) masked+
    /// unmasked crops in [0, 1]. Returns (N, 3, S, S) crops in [0, 1].
    fn infer(&self, mel: Array4<f32>, faces: Array4<f32>) -> Result<Array4<f32>>;
}

/// `ort`-backed lip-sync model.
///
/// The session holds exclusive device state; batches are submitted under a
/// mutex so concurrent callers serialize rather than contend for device
/// memory.
pub struct OrtLipSyncModel {
    session: Arc<Mutex<Session>>,
    mel_input: String,
    face_input: String,
    output_name: String,
}

impl OrtLipSyncModel {
    pub fn load(model_path: &Path, device: ComputeDevice) -> Result<Self> {
        let session = build_session(&SessionConfig { model_path, device })?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect();
        if input_names.len() != 2 {
            bail!(
                "lip-sync model must have exactly 2 inputs (audio, face), found {}: {input_names:?}",
                input_names.len()
            );
        }

        let (mel_input, face_input) = resolve_input_roles(&input_names);
        let output_name = session.outputs()[0].name().to_string();

        debug!(
            model = %model_path.display(),
            %mel_input, %face_input, %output_name,
            "Loaded lip-sync model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            mel_input,
            face_input,
            output_name,
        })
    }
}

/// Pick which graph input is the audio window and which is the face tensor.
///
/// Matches on the prefix-stripped names; falls back to the export argument
/// order (audio first, face second) when the names are uninformative.
fn resolve_input_roles(names: &[String]) -> (String, String) {
    let is_audio = |name: &str| {
        let n = strip_export_prefix(name).to_ascii_lowercase();
        n.contains("mel") || n.contains("audio")
    };
    let is_face = |name: &str| {
        let n = strip_export_prefix(name).to_ascii_lowercase();
        n.contains("face") || n.contains("img") || n.contains("video")
    };

    if is_audio(&names[1]) || is_face(&names[0]) {
        (names[1].clone(), names[0].clone())
    } else {
        (names[0].clone(), names[1].clone())
    }
}

impl LipSyncModel for OrtLipSyncModel {
    fn infer(&self, mel: Array4<f32>, faces: Array4<f32>) -> Result<Array4<f32>> {
        let batch = faces.shape()[0];
        if mel.shape()[0] != batch {
            bail!(
                "audio batch {} does not match face batch {batch}",
                mel.shape()[0]
            );
        }

        let mel_tensor = Tensor::from_array(mel)?;
        let face_tensor = Tensor::from_array(faces)?;

        let output = {
            let mut session = self.session.lock().unwrap();
            let outputs = session.run(ort::inputs![
                self.mel_input.as_str() => &mel_tensor,
                self.face_input.as_str() => &face_tensor
            ])?;
            outputs[self.output_name.as_str()]
                .try_extract_array::<f32>()?
                .to_owned()
        };

        let output = output
            .into_dimensionality::<Ix4>()
            .context("lip-sync model output is not a 4-D tensor")?;
        if output.shape()[0] != batch {
            bail!(
                "model returned batch of {}, expected {batch}",
                output.shape()[0]
            );
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(a: &str, b: &str) -> Vec<String> {
        vec![a.to_string(), b.to_string()]
    }

    #[test]
    fn test_resolve_input_roles_by_name() {
        let (mel, face) = resolve_input_roles(&names("mel_spectrogram", "face_sequences"));
        assert_eq!(mel, "mel_spectrogram");
        assert_eq!(face, "face_sequences");

        let (mel, face) = resolve_input_roles(&names("img_batch", "audio_window"));
        assert_eq!(mel, "audio_window");
        assert_eq!(face, "img_batch");
    }

    #[test]
    fn test_resolve_input_roles_strips_export_prefix() {
        let (mel, face) = resolve_input_roles(&names("module.face_in", "module.mel_in"));
        assert_eq!(mel, "module.mel_in");
        assert_eq!(face, "module.face_in");
    }

    #[test]
    fn test_resolve_input_roles_positional_fallback() {
        let (mel, face) = resolve_input_roles(&names("input_0", "input_1"));
        assert_eq!(mel, "input_0");
        assert_eq!(face, "input_1");
    }
}
