//! End-to-end orchestration: align audio, locate faces, assemble batches, run
//! inference with a per-batch timeout, composite, and sequence the output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::assembler::{assemble_batches, AssemblerOptions, DEFAULT_BATCH_CAPACITY, DEFAULT_IMG_SIZE};
use crate::compositor::composite_batch;
use crate::error::PipelineError;
use crate::inference::LipSyncModel;
use crate::locator::{locate_faces, FaceDetector, LocatorOptions};
use crate::mel::{align_windows, AudioFeatureMap, DEFAULT_FEATURE_RATE, DEFAULT_WINDOW_WIDTH};
use crate::sequencer::FrameSequence;
use crate::types::{CompositedFrame, Frame, SourceMode, SynthesizedCrop};

pub const DEFAULT_FPS: f64 = 25.0;
pub const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub fps: f64,
    pub feature_rate: f64,
    pub window_width: usize,
    pub img_size: usize,
    pub batch_capacity: usize,
    pub mode: SourceMode,
    pub locator: LocatorOptions,
    /// Upper bound on a single inference submission; the model is the dominant
    /// latency source, so a hung device call must not stall the run forever.
    pub inference_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            feature_rate: DEFAULT_FEATURE_RATE,
            window_width: DEFAULT_WINDOW_WIDTH,
            img_size: DEFAULT_IMG_SIZE,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            mode: SourceMode::Static,
            locator: LocatorOptions::default(),
            inference_timeout: Duration::from_secs(DEFAULT_INFERENCE_TIMEOUT_SECS),
        }
    }
}

/// One synthesis run over injected collaborators. The struct holds no
/// per-run state: every `run` call re-seeds the detection batch size and
/// other knobs from its options, so independent invocations cannot leak
/// state into each other.
pub struct Pipeline {
    detector: Arc<dyn FaceDetector>,
    model: Arc<dyn LipSyncModel>,
    opts: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        model: Arc<dyn LipSyncModel>,
        opts: PipelineOptions,
    ) -> Self {
        Self {
            detector,
            model,
            opts,
        }
    }

    /// Synthesize the full output sequence.
    ///
    /// Cancellation is cooperative and checked between batches, never
    /// mid-batch. Detection and inference run on blocking threads; batches are
    /// submitted sequentially because the model holds exclusive device state.
    pub async fn run(
        &self,
        feature_map: &AudioFeatureMap,
        frames: Vec<Frame>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<FrameSequence> {
        let started = Instant::now();
        let windows = align_windows(
            feature_map,
            self.opts.fps,
            self.opts.feature_rate,
            self.opts.window_width,
        )?;
        info!(
            windows = windows.len(),
            fps = self.opts.fps,
            mode = ?self.opts.mode,
            "audio aligned"
        );

        let mut frames: Vec<Arc<Frame>> = frames.into_iter().map(Arc::new).collect();
        if self.opts.mode == SourceMode::Moving && frames.len() > windows.len() {
            frames.truncate(windows.len());
        }

        // Static mode detects on the reference frame only.
        let detect_count = match self.opts.mode {
            SourceMode::Static => 1.min(frames.len()),
            SourceMode::Moving => frames.len(),
        };
        let detect_frames: Vec<Arc<Frame>> = frames[..detect_count].to_vec();
        let detector = Arc::clone(&self.detector);
        let locator_opts = self.opts.locator.clone();
        let crops = task::spawn_blocking(move || {
            locate_faces(detector.as_ref(), &detect_frames, &locator_opts)
        })
        .await
        .context("face detection task panicked")??;
        debug!(
            crops = crops.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "face localization complete"
        );

        let assembler_opts = AssemblerOptions {
            img_size: self.opts.img_size,
            batch_capacity: self.opts.batch_capacity,
            mode: self.opts.mode,
        };
        let source_frames = match self.opts.mode {
            SourceMode::Static => &frames[..detect_count],
            SourceMode::Moving => &frames[..],
        };
        let batches = assemble_batches(&crops, source_frames, &windows, &assembler_opts)?;
        let total_batches = batches.len();

        let mut composited: Vec<CompositedFrame> = Vec::with_capacity(windows.len());
        for batch in batches {
            if let Some(rx) = &cancel {
                if *rx.borrow() {
                    return Err(PipelineError::Cancelled.into());
                }
            }

            let batch_started = Instant::now();
            let mel = batch.mel_tensor()?;
            let faces = batch.face_tensor()?;
            let model = Arc::clone(&self.model);
            let inference = task::spawn_blocking(move || model.infer(mel, faces));

            let predictions = match timeout(self.opts.inference_timeout, inference).await {
                Err(_) => {
                    return Err(PipelineError::InferenceTimeout {
                        batch_index: batch.index,
                        timeout_secs: self.opts.inference_timeout.as_secs(),
                    }
                    .into());
                }
                Ok(joined) => joined
                    .context("inference task panicked")?
                    .map_err(|source| PipelineError::ModelInference {
                        batch_index: batch.index,
                        source,
                    })?,
            };

            let crops: Vec<SynthesizedCrop> = predictions
                .outer_iter()
                .map(|item| SynthesizedCrop {
                    data: item.to_owned(),
                })
                .collect();
            composited.extend(composite_batch(&batch, &crops)?);

            info!(
                batch = batch.index + 1,
                total_batches,
                items = batch.len(),
                elapsed_ms = batch_started.elapsed().as_millis() as u64,
                "batch synthesized"
            );
        }

        let sequence = FrameSequence::assemble(composited, self.opts.fps)?;
        info!(
            frames = sequence.len(),
            duration_secs = sequence.duration(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "synthesis complete"
        );
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectError;
    use crate::locator::RawBox;
    use ndarray::{s, Array2, Array4};
    use std::sync::Mutex;

    /// Always finds the same face; counts chunk sizes of the first pass of
    /// every run to show batch size re-seeding.
    struct FixedDetector {
        first_chunk_sizes: Mutex<Vec<usize>>,
    }

    impl FixedDetector {
        fn new() -> Self {
            Self {
                first_chunk_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    impl FaceDetector for FixedDetector {
        fn detect(&self, batch: &[&Frame]) -> Result<Vec<Option<RawBox>>, DetectError> {
            self.first_chunk_sizes.lock().unwrap().push(batch.len());
            Ok(batch
                .iter()
                .map(|_| {
                    Some(RawBox {
                        x1: 4,
                        y1: 4,
                        x2: 12,
                        y2: 12,
                    })
                })
                .collect())
        }
    }

    /// Returns the unmasked input channels untouched — a perfect
    /// reconstruction of the face crop.
    struct IdentityModel;

    impl LipSyncModel for IdentityModel {
        fn infer(&self, mel: Array4<f32>, faces: Array4<f32>) -> Result<Array4<f32>> {
            assert_eq!(mel.shape()[0], faces.shape()[0]);
            Ok(faces.slice(s![.., 3.., .., ..]).to_owned())
        }
    }

    struct FailingModel;

    impl LipSyncModel for FailingModel {
        fn infer(&self, _mel: Array4<f32>, _faces: Array4<f32>) -> Result<Array4<f32>> {
            anyhow::bail!("device fault")
        }
    }

    fn gradient_frame(w: u32, h: u32, seed: u8) -> Frame {
        let mut data = vec![0u8; w as usize * h as usize * 3];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = ((i + seed as usize) % 251) as u8;
        }
        Frame::new(data, w, h).unwrap()
    }

    /// Feature map sized to produce exactly `frames` windows at 25 fps /
    /// feature rate 80: frames-1 aligned windows plus the overlapping tail.
    fn feature_map_for_frames(frames: usize) -> AudioFeatureMap {
        // Window i starts at floor(3.2 i); the run ends once start + 16 > T.
        let last_aligned = ((frames - 2) as f64 * 3.2) as usize;
        AudioFeatureMap::new(Array2::zeros((80, last_aligned + 16)))
    }

    fn options(mode: SourceMode) -> PipelineOptions {
        PipelineOptions {
            img_size: 8,
            batch_capacity: 4,
            mode,
            locator: LocatorOptions {
                smooth: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_end_to_end_static_reference() {
        // 25 fps, 10 output frames, duration 0.4s.
        let pipeline = Pipeline::new(
            Arc::new(FixedDetector::new()),
            Arc::new(IdentityModel),
            options(SourceMode::Static),
        );
        let map = feature_map_for_frames(10);
        let frame = gradient_frame(16, 16, 0);

        let sequence = pipeline.run(&map, vec![frame], None).await.unwrap();
        assert_eq!(sequence.len(), 10);
        assert_eq!(sequence.duration(), 10.0 / 25.0);
        assert!(sequence.frame_at(0.39).is_some());
        assert!(sequence.frame_at(0.4).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_identity_model_with_square_box_reproduces_source() {
        // Box extent equals the model size, so the identity model's output
        // composites back pixel-for-pixel.
        let mut opts = options(SourceMode::Static);
        opts.locator.pads = crate::locator::Padding {
            top: 0,
            bottom: 0,
            left: 0,
            right: 0,
        };
        let pipeline = Pipeline::new(Arc::new(FixedDetector::new()), Arc::new(IdentityModel), opts);
        let map = feature_map_for_frames(3);
        let frame = gradient_frame(16, 16, 7);

        let sequence = pipeline.run(&map, vec![frame.clone()], None).await.unwrap();
        for i in 0..sequence.len() {
            assert_eq!(sequence.frame_by_index(i).unwrap(), &frame);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_moving_source_truncated_to_audio() {
        let detector = Arc::new(FixedDetector::new());
        let pipeline = Pipeline::new(
            detector.clone(),
            Arc::new(IdentityModel),
            options(SourceMode::Moving),
        );
        let map = feature_map_for_frames(6);
        let frames: Vec<Frame> = (0..20).map(|i| gradient_frame(16, 16, i)).collect();

        let sequence = pipeline.run(&map, frames, None).await.unwrap();
        assert_eq!(sequence.len(), 6);
        // Detection only saw the truncated sequence.
        let sizes = detector.first_chunk_sizes.lock().unwrap();
        assert_eq!(sizes.iter().sum::<usize>(), 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_between_batches() {
        let (tx, rx) = watch::channel(true);
        let pipeline = Pipeline::new(
            Arc::new(FixedDetector::new()),
            Arc::new(IdentityModel),
            options(SourceMode::Static),
        );
        let map = feature_map_for_frames(10);

        let err = pipeline
            .run(&map, vec![gradient_frame(16, 16, 0)], Some(rx))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Cancelled)
        ));
        drop(tx);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_model_failure_is_fatal_and_tagged() {
        let pipeline = Pipeline::new(
            Arc::new(FixedDetector::new()),
            Arc::new(FailingModel),
            options(SourceMode::Static),
        );
        let map = feature_map_for_frames(4);

        let err = pipeline
            .run(&map, vec![gradient_frame(16, 16, 0)], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ModelInference { batch_index: 0, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_short_audio_aborts_before_detection() {
        let detector = Arc::new(FixedDetector::new());
        let pipeline = Pipeline::new(detector.clone(), Arc::new(IdentityModel), options(SourceMode::Static));
        let map = AudioFeatureMap::new(Array2::zeros((80, 5)));

        let err = pipeline
            .run(&map, vec![gradient_frame(16, 16, 0)], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidAudioLength { time_steps: 5, .. })
        ));
        assert!(detector.first_chunk_sizes.lock().unwrap().is_empty());
    }
}
