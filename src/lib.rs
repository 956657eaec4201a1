mod buffer;
mod codec;
mod context;
mod frame;
mod pipeline;
mod progress;
mod util;
mod worker;

#[cfg(test)]
mod tests;

pub use buffer::{CallbackPolicy, Callbacks, FormatNegotiator, FrameAllocator, FrameParams};
pub use codec::{Codec, CodecCaps};
pub use context::{
    CodecContext, ColorRange, ColorSpace, HwAccelDesc, HwAccelState, PixelFormat, Rational,
    SkipMode,
};
pub use frame::{Frame, FrameBuffer, Packet};
pub use pipeline::{DecodeOutput, FramePipeline, Options};
pub use progress::Progress;
pub use worker::DecodeScope;

pub fn init() {
    util::log::init();
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Resolved thread count is <= 1; the caller should decode inline instead.
    #[error("frame threading disabled (thread_count <= 1)")]
    ThreadingDisabled,

    #[error("decoder init failed: {0}")]
    Init(anyhow::Error),

    #[error("thread context update failed: {0}")]
    Context(anyhow::Error),

    #[error("decode failed: {0}")]
    Decode(anyhow::Error),

    #[error("frame buffer allocation failed: {0}")]
    Alloc(anyhow::Error),

    #[error("{0} called after setup finished")]
    InvalidCallOrder(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
