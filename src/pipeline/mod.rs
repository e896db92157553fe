//! Frame processing pipeline: batch scheduling, key frames, compression.

pub mod compress;
mod keyframe;
mod scheduler;

pub use compress::{
    frame_to_rgb, BlurHook, CompressError, Compressor, EncodedThumbnail, ThumbnailCodec,
    THUMBNAIL_HEIGHT, THUMBNAIL_WIDTH,
};
pub use keyframe::{KeyFrameGate, KeyFramePipeline};
pub use scheduler::{BatchScheduler, PipelineCounters};
