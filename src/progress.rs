//! Progress events reported to a caller-supplied sink.

use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompressionStage {
    Probing,
    EncodingPass1,
    EncodingPass2,
    Finalizing,
}

impl CompressionStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Probing => "Probing",
            Self::EncodingPass1 => "Encoding pass 1",
            Self::EncodingPass2 => "Encoding pass 2",
            Self::Finalizing => "Finalizing",
        }
    }
}

/// One progress report. `progress` is None on a stage transition and the
/// fraction of the running pass (0..=1) otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionProgress {
    pub stage: CompressionStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

pub type ProgressSink = Arc<dyn Fn(CompressionProgress) + Send + Sync>;

pub(crate) fn emit_stage(sink: Option<&ProgressSink>, stage: CompressionStage) {
    if let Some(sink) = sink {
        sink(CompressionProgress {
            stage,
            progress: None,
        });
    }
}

pub(crate) fn emit_fraction(sink: Option<&ProgressSink>, stage: CompressionStage, fraction: f64) {
    if let Some(sink) = sink {
        sink(CompressionProgress {
            stage,
            progress: Some(fraction),
        });
    }
}
