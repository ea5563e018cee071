use thiserror::Error;

/// Fatal failures of the synthesis pipeline.
///
/// Detector memory exhaustion is retried inside the face locator's
/// batch-halving loop and only surfaces here once the floor of one image per
/// call has been reached. Everything else aborts the run immediately.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot process image at minimum batch size")]
    ResourceExhausted,

    #[error("no face detected in frame {frame_index}; every frame must contain a face")]
    FaceNotDetected { frame_index: usize },

    #[error("audio feature map has {time_steps} time steps, need at least {window_width}")]
    InvalidAudioLength {
        time_steps: usize,
        window_width: usize,
    },

    #[error("model inference failed on batch {batch_index}")]
    ModelInference {
        batch_index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("inference timed out after {timeout_secs}s on batch {batch_index}")]
    InferenceTimeout {
        batch_index: usize,
        timeout_secs: u64,
    },

    #[error("pipeline run cancelled")]
    Cancelled,
}

/// Failures of the face-detection collaborator.
///
/// `ResourceExhausted` is the signal the locator's halving retry keys on; any
/// other failure is fatal.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detection device out of memory")]
    ResourceExhausted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_identify_context() {
        let err = PipelineError::FaceNotDetected { frame_index: 42 };
        assert!(err.to_string().contains("frame 42"));

        let err = PipelineError::InvalidAudioLength {
            time_steps: 7,
            window_width: 16,
        };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains("16"));
    }

    #[test]
    fn test_exhaustion_message_matches_contract() {
        assert_eq!(
            PipelineError::ResourceExhausted.to_string(),
            "cannot process image at minimum batch size"
        );
    }
}
