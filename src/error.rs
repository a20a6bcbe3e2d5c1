use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open {
        uri: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("video source read failed")]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// An external collaborator failed or returned malformed output.
    #[error("{stage} inference failed")]
    Inference {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to encode frame")]
    Encode(#[source] anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn inference(stage: &'static str, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::Inference {
            stage,
            source: source.into(),
        }
    }

    pub fn is_inference(&self) -> bool {
        matches!(self, PipelineError::Inference { .. })
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
