pub mod bitrate;
pub mod config;
pub mod dimensions;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod orchestrator;
pub mod progress;
pub mod server;
pub mod workspace;

pub use config::CompressorConfig;
pub use error::CompressionError;
pub use orchestrator::{CompressedArtifact, CompressionOrchestrator, CompressionRequest, SourceMedia};
pub use progress::{CompressionProgress, CompressionStage, ProgressSink};
