//! File formats at the pipeline boundary: binary PPM frames in and out, the
//! raw audio feature map from the extraction collaborator, and the output
//! manifest for the muxer.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use synclip_core::mel::AudioFeatureMap;
use synclip_core::sequencer::FrameSequence;
use synclip_core::types::Frame;

/// Sidecar describing the shape of a raw little-endian f32 feature map file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureMapShape {
    pub bins: usize,
    pub steps: usize,
}

/// Manifest written next to the output frames; the muxer samples from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputManifest {
    pub fps: f64,
    pub frame_count: usize,
    pub duration_secs: f64,
    pub frame_pattern: String,
}

/// Load an (F, T) feature map from `<path>` (row-major f32 LE) with its
/// `<path>.json` shape sidecar.
pub fn read_feature_map(path: &Path) -> Result<AudioFeatureMap> {
    let sidecar_path = sidecar_path(path);
    let sidecar = fs::read_to_string(&sidecar_path)
        .with_context(|| format!("failed to read feature sidecar: {}", sidecar_path.display()))?;
    let shape: FeatureMapShape = serde_json::from_str(&sidecar)
        .with_context(|| format!("failed to parse feature sidecar: {}", sidecar_path.display()))?;

    let raw = fs::read(path)
        .with_context(|| format!("failed to read feature map: {}", path.display()))?;
    if raw.len() != shape.bins * shape.steps * 4 {
        bail!(
            "feature map {} holds {} bytes, expected {} for {}x{} f32",
            path.display(),
            raw.len(),
            shape.bins * shape.steps * 4,
            shape.bins,
            shape.steps
        );
    }

    let values: Vec<f32> = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    AudioFeatureMap::from_raw(values, shape.bins, shape.steps)
}

pub fn write_feature_map(path: &Path, map: &AudioFeatureMap) -> Result<()> {
    let shape = FeatureMapShape {
        bins: map.bins(),
        steps: map.steps(),
    };
    fs::write(
        sidecar_path(path),
        serde_json::to_string_pretty(&shape).context("failed to serialize feature sidecar")?,
    )?;

    let mut raw = Vec::with_capacity(shape.bins * shape.steps * 4);
    for value in map.as_array().iter() {
        raw.extend_from_slice(&value.to_le_bytes());
    }
    fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))
}

fn sidecar_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".json");
    std::path::PathBuf::from(os)
}

/// Read a binary (P6, 8-bit) PPM frame.
pub fn read_ppm(path: &Path) -> Result<Frame> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (header, pixels) = split_ppm_header(&raw)
        .with_context(|| format!("malformed PPM header in {}", path.display()))?;

    let mut fields = header.split_ascii_whitespace();
    let magic = fields.next().unwrap_or_default();
    if magic != "P6" {
        bail!("{} is not a binary PPM (magic {magic:?})", path.display());
    }
    let width: u32 = fields.next().context("missing width")?.parse()?;
    let height: u32 = fields.next().context("missing height")?.parse()?;
    let maxval: u32 = fields.next().context("missing maxval")?.parse()?;
    if maxval != 255 {
        bail!("{}: only 8-bit PPM is supported, maxval {maxval}", path.display());
    }

    let expected = width as usize * height as usize * 3;
    if pixels.len() < expected {
        bail!(
            "{}: truncated pixel data ({} of {expected} bytes)",
            path.display(),
            pixels.len()
        );
    }

    Frame::new(pixels[..expected].to_vec(), width, height)
}

/// Write a frame as binary PPM.
pub fn write_ppm(path: &Path, frame: &Frame) -> Result<()> {
    let mut file =
        fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write!(file, "P6\n{} {}\n255\n", frame.width, frame.height)?;
    file.write_all(&frame.data)?;
    Ok(())
}

/// Write every frame of the sequence as `frame_NNNNNN.ppm` plus
/// `manifest.json`, returning the manifest.
pub fn write_sequence(output_dir: &Path, sequence: &FrameSequence) -> Result<OutputManifest> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output dir: {}", output_dir.display()))?;

    for (index, frame) in sequence.iter().enumerate() {
        write_ppm(&output_dir.join(format!("frame_{index:06}.ppm")), frame)?;
    }

    let manifest = OutputManifest {
        fps: sequence.fps(),
        frame_count: sequence.len(),
        duration_secs: sequence.duration(),
        frame_pattern: "frame_%06d.ppm".to_string(),
    };
    fs::write(
        output_dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).context("failed to serialize manifest")?,
    )?;

    Ok(manifest)
}

/// Split the three whitespace-delimited header fields (after the magic) from
/// the pixel payload, skipping `#` comments.
fn split_ppm_header(raw: &[u8]) -> Result<(String, &[u8])> {
    let mut header = String::new();
    let mut fields = 0usize;
    let mut i = 0usize;

    while i < raw.len() && fields < 4 {
        match raw[i] {
            b'#' => {
                while i < raw.len() && raw[i] != b'\n' {
                    i += 1;
                }
            }
            c if c.is_ascii_whitespace() => {
                i += 1;
            }
            _ => {
                let start = i;
                while i < raw.len() && !raw[i].is_ascii_whitespace() {
                    i += 1;
                }
                header.push_str(std::str::from_utf8(&raw[start..i])?);
                header.push(' ');
                fields += 1;
            }
        }
    }

    if fields < 4 || i >= raw.len() {
        bail!("incomplete header ({fields} of 4 fields)");
    }
    // Exactly one whitespace byte separates the header from the payload.
    Ok((header, &raw[i + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use synclip_core::types::CompositedFrame;
    use tempfile::tempdir;

    fn gradient_frame(w: u32, h: u32) -> Frame {
        let mut data = vec![0u8; w as usize * h as usize * 3];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }
        Frame::new(data, w, h).unwrap()
    }

    #[test]
    fn test_ppm_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.ppm");
        let frame = gradient_frame(7, 5);

        write_ppm(&path, &frame).unwrap();
        let loaded = read_ppm(&path).unwrap();
        assert_eq!(loaded, frame);
    }

    #[test]
    fn test_ppm_with_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.ppm");
        let mut raw = b"P6\n# exported frame\n2 1\n# depth\n255\n".to_vec();
        raw.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        fs::write(&path, raw).unwrap();

        let frame = read_ppm(&path).unwrap();
        assert_eq!(frame.width, 2);
        assert_eq!(frame.height, 1);
        assert_eq!(frame.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_ppm_rejects_wrong_magic_and_truncation() {
        let dir = tempdir().unwrap();
        let p5 = dir.path().join("gray.ppm");
        fs::write(&p5, b"P5\n2 2\n255\n\x00\x00\x00\x00").unwrap();
        assert!(read_ppm(&p5).is_err());

        let short = dir.path().join("short.ppm");
        fs::write(&short, b"P6\n2 2\n255\n\x00\x00\x00").unwrap();
        assert!(read_ppm(&short).is_err());
    }

    #[test]
    fn test_feature_map_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("features.f32");
        let map = AudioFeatureMap::new(Array2::from_shape_fn((4, 6), |(r, c)| {
            r as f32 * 10.0 + c as f32
        }));

        write_feature_map(&path, &map).unwrap();
        let loaded = read_feature_map(&path).unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_feature_map_shape_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("features.f32");
        fs::write(&path, [0u8; 12]).unwrap();
        fs::write(
            sidecar_path(&path),
            serde_json::to_string(&FeatureMapShape { bins: 4, steps: 4 }).unwrap(),
        )
        .unwrap();
        assert!(read_feature_map(&path).is_err());
    }

    #[test]
    fn test_write_sequence_emits_frames_and_manifest() {
        let dir = tempdir().unwrap();
        let composited = (0..3)
            .map(|index| CompositedFrame {
                index,
                frame: gradient_frame(4, 4),
            })
            .collect();
        let sequence = FrameSequence::assemble(composited, 25.0).unwrap();

        let manifest = write_sequence(dir.path(), &sequence).unwrap();
        assert_eq!(manifest.frame_count, 3);
        assert_eq!(manifest.fps, 25.0);
        assert!(dir.path().join("frame_000000.ppm").exists());
        assert!(dir.path().join("frame_000002.ppm").exists());

        let parsed: OutputManifest = serde_json::from_str(
            &fs::read_to_string(dir.path().join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(parsed, manifest);
    }
}
