//! Frame sequencing: reorders index-tagged composited frames into a
//! contiguous sequence and exposes timestamp-based random access for the
//! downstream muxer.

use anyhow::{bail, Result};

use crate::types::{CompositedFrame, Frame};

/// Completed output: every frame in ascending index order plus the playback
/// rate. Restartable and random-access; the muxer samples by timestamp, not
/// by index.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSequence {
    frames: Vec<Frame>,
    fps: f64,
}

impl FrameSequence {
    /// Assemble from frames arriving in any order. Fails unless the indices
    /// form exactly 0..n with no gaps or duplicates.
    pub fn assemble(mut composited: Vec<CompositedFrame>, fps: f64) -> Result<Self> {
        if fps <= 0.0 {
            bail!("fps must be positive, got {fps}");
        }
        if composited.is_empty() {
            bail!("cannot assemble an empty frame sequence");
        }

        composited.sort_by_key(|f| f.index);
        for (position, frame) in composited.iter().enumerate() {
            if frame.index != position {
                bail!(
                    "frame index {} arrived where {} was expected (missing or duplicate frame)",
                    frame.index,
                    position
                );
            }
        }

        Ok(Self {
            frames: composited.into_iter().map(|f| f.frame).collect(),
            fps,
        })
    }

    /// Frame covering timestamp `t` seconds: `frames[floor(t * fps)]`, or
    /// `None` outside `[0, duration)`.
    pub fn frame_at(&self, t: f64) -> Option<&Frame> {
        if !t.is_finite() || t < 0.0 {
            return None;
        }
        self.frames.get((t * self.fps) as usize)
    }

    pub fn frame_by_index(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn duration(&self) -> f64 {
        self.frames.len() as f64 / self.fps
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged_frame(index: usize) -> CompositedFrame {
        CompositedFrame {
            index,
            frame: Frame::new(vec![index as u8; 4 * 4 * 3], 4, 4).unwrap(),
        }
    }

    #[test]
    fn test_assemble_orders_unordered_arrival() {
        let composited = vec![
            tagged_frame(2),
            tagged_frame(0),
            tagged_frame(3),
            tagged_frame(1),
        ];
        let seq = FrameSequence::assemble(composited, 25.0).unwrap();
        assert_eq!(seq.len(), 4);
        for i in 0..4 {
            assert_eq!(seq.frame_by_index(i).unwrap().data[0], i as u8);
        }
    }

    #[test]
    fn test_assemble_rejects_gap_and_duplicate() {
        let err =
            FrameSequence::assemble(vec![tagged_frame(0), tagged_frame(2)], 25.0).unwrap_err();
        assert!(err.to_string().contains("missing or duplicate"));

        let err =
            FrameSequence::assemble(vec![tagged_frame(1), tagged_frame(1)], 25.0).unwrap_err();
        assert!(err.to_string().contains("missing or duplicate"));
    }

    #[test]
    fn test_frame_at_floors_timestamp() {
        let seq =
            FrameSequence::assemble((0..10).map(tagged_frame).collect(), 25.0).unwrap();
        assert_eq!(seq.duration(), 0.4);

        // t = 0 and anything below one frame period map to frame 0.
        assert_eq!(seq.frame_at(0.0).unwrap().data[0], 0);
        assert_eq!(seq.frame_at(0.039).unwrap().data[0], 0);
        assert_eq!(seq.frame_at(0.04).unwrap().data[0], 1);
        assert_eq!(seq.frame_at(0.399).unwrap().data[0], 9);
        assert!(seq.frame_at(0.4).is_none());
        assert!(seq.frame_at(-0.1).is_none());
        assert!(seq.frame_at(f64::NAN).is_none());
    }

    #[test]
    fn test_random_access_is_restartable() {
        let seq = FrameSequence::assemble((0..5).map(tagged_frame).collect(), 10.0).unwrap();
        // Sampling out of order and repeatedly returns the same frames.
        let a = seq.frame_at(0.35).unwrap().clone();
        let b = seq.frame_at(0.05).unwrap().clone();
        assert_eq!(seq.frame_at(0.35).unwrap(), &a);
        assert_eq!(seq.frame_at(0.05).unwrap(), &b);
        assert_eq!(a.data[0], 3);
        assert_eq!(b.data[0], 0);
    }

    #[test]
    fn test_empty_and_bad_fps_rejected() {
        assert!(FrameSequence::assemble(vec![], 25.0).is_err());
        assert!(FrameSequence::assemble(vec![tagged_frame(0)], 0.0).is_err());
    }
}
