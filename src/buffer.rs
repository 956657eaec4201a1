use std::sync::Arc;

use crate::{
    context::PixelFormat,
    frame::{Frame, FrameBuffer},
};

/// Whether user callbacks may be invoked from worker threads, or must be
/// reflected back to the caller thread. An explicit policy instead of
/// sniffing the callbacks at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackPolicy {
    /// Callbacks run on whichever worker needs them, serialised by the
    /// buffer mutex.
    ThreadSafe,
    /// Callbacks run only on the caller thread; workers park and the
    /// coordinator relays the call during submission.
    CallerOnly,
}

/// What the allocator needs to know, snapshotted from the requesting
/// worker's context.
#[derive(Debug, Clone, Copy)]
pub struct FrameParams {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

pub trait FrameAllocator: Send + Sync {
    fn alloc(&self, params: &FrameParams, frame: &mut Frame) -> anyhow::Result<()>;
}

pub trait FormatNegotiator: Send + Sync {
    fn pick(&self, params: &FrameParams, candidates: &[PixelFormat]) -> PixelFormat;
}

/// The user's buffer allocator and pixel-format negotiator, plus the policy
/// that decides whether they may run on worker threads.
#[derive(Clone)]
pub struct Callbacks {
    pub allocator: Arc<dyn FrameAllocator>,
    pub negotiator: Arc<dyn FormatNegotiator>,
    pub policy: CallbackPolicy,
}

impl Default for Callbacks {
    fn default() -> Callbacks {
        Callbacks {
            allocator: Arc::new(DefaultAllocator),
            negotiator: Arc::new(DefaultNegotiator),
            policy: CallbackPolicy::ThreadSafe,
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("policy", &self.policy)
            .finish()
    }
}

fn frame_size(params: &FrameParams) -> usize {
    let pixels = params.width as usize * params.height as usize;
    match params.format {
        PixelFormat::None | PixelFormat::HwSurface => 0,
        PixelFormat::Yuv420p | PixelFormat::Nv12 => pixels * 3 / 2,
        PixelFormat::Yuv422p => pixels * 2,
        PixelFormat::Yuv444p | PixelFormat::Rgb24 => pixels * 3,
    }
}

/// Plain heap storage, no release hook.
struct DefaultAllocator;

impl FrameAllocator for DefaultAllocator {
    fn alloc(&self, params: &FrameParams, frame: &mut Frame) -> anyhow::Result<()> {
        frame.width = params.width;
        frame.height = params.height;
        frame.format = params.format;
        frame.set_buf(FrameBuffer::new(vec![0; frame_size(params)]));
        Ok(())
    }
}

/// Picks the first offered format, preferring a software one.
struct DefaultNegotiator;

impl FormatNegotiator for DefaultNegotiator {
    fn pick(&self, _params: &FrameParams, candidates: &[PixelFormat]) -> PixelFormat {
        candidates
            .iter()
            .copied()
            .find(|format| *format != PixelFormat::HwSurface)
            .or_else(|| candidates.first().copied())
            .unwrap_or(PixelFormat::None)
    }
}
