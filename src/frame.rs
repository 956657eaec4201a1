use std::sync::Arc;

use crate::{context::PixelFormat, progress::Progress};

/// One compressed input packet. An empty packet signals end-of-stream and
/// makes the pipeline drain its tail.
///
/// Referencing a packet is an `Arc` clone, so a packet can be owned by the
/// caller and by the worker currently decoding it at the same time.
#[derive(Clone)]
pub struct Packet {
    data: Arc<[u8]>,
    pub dts: Option<i64>,
}

impl Packet {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Packet {
        Packet {
            data: data.into(),
            dts: None,
        }
    }

    pub fn with_dts(data: impl Into<Arc<[u8]>>, dts: i64) -> Packet {
        Packet {
            data: data.into(),
            dts: Some(dts),
        }
    }

    pub fn empty() -> Packet {
        Packet::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for Packet {
    fn default() -> Packet {
        Packet {
            data: Arc::new([]),
            dts: None,
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.data.len())
            .field("dts", &self.dts)
            .finish()
    }
}

/// Pixel storage of a decoded frame, allocated through the user's allocator.
///
/// The optional release hook is invoked with the storage when the buffer is
/// dropped; the deferred-release path (`DecodeScope::release_buffer`) makes
/// sure that happens on the caller thread when the allocator is not
/// thread-safe.
pub struct FrameBuffer {
    data: Box<[u8]>,
    release: Option<Box<dyn FnOnce(Box<[u8]>) + Send + Sync>>,
}

impl FrameBuffer {
    pub fn new(data: impl Into<Box<[u8]>>) -> FrameBuffer {
        FrameBuffer {
            data: data.into(),
            release: None,
        }
    }

    pub fn with_release(
        data: impl Into<Box<[u8]>>,
        release: impl FnOnce(Box<[u8]>) + Send + Sync + 'static,
    ) -> FrameBuffer {
        FrameBuffer {
            data: data.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Drop the release hook so the storage is freed without notifying the
    /// allocator. Used when the deferred-release queue overflows.
    pub(crate) fn forget_release(&mut self) {
        self.release = None;
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("size", &self.data.len())
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// One decoded output frame.
///
/// A frame moves by value: the worker fills it, harvest moves it into the
/// caller's frame, `unref` resets it to the empty state (running the buffer
/// release hook if a buffer is still attached).
#[derive(Debug, Default)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: Option<i64>,
    /// DTS of the packet this frame was decoded from, copied at harvest.
    pub pkt_dts: Option<i64>,
    buf: Option<FrameBuffer>,
    progress: Option<Arc<Progress>>,
}

impl Frame {
    pub fn has_buf(&self) -> bool {
        self.buf.is_some()
    }

    pub fn buf(&self) -> Option<&FrameBuffer> {
        self.buf.as_ref()
    }

    pub fn buf_mut(&mut self) -> Option<&mut FrameBuffer> {
        self.buf.as_mut()
    }

    pub fn set_buf(&mut self, buf: FrameBuffer) {
        self.buf = Some(buf);
    }

    pub fn take_buf(&mut self) -> Option<FrameBuffer> {
        self.buf.take()
    }

    pub fn progress(&self) -> Option<&Arc<Progress>> {
        self.progress.as_ref()
    }

    pub(crate) fn set_progress(&mut self, progress: Arc<Progress>) {
        self.progress = Some(progress);
    }

    pub(crate) fn clear_progress(&mut self) {
        self.progress = None;
    }

    /// Announce that all rows up to `n` of `field` are final. No-op when the
    /// frame has no progress channel.
    pub fn report_progress(&self, n: i32, field: usize) {
        if let Some(progress) = &self.progress {
            progress.report(n, field);
        }
    }

    /// Block until the producing worker has reported row `n` of `field`.
    /// No-op when the frame has no progress channel.
    pub fn await_progress(&self, n: i32, field: usize) {
        if let Some(progress) = &self.progress {
            progress.wait(n, field);
        }
    }

    /// Reset to the empty state, dropping the buffer (and running its release
    /// hook on the current thread) and detaching the progress channel.
    pub fn unref(&mut self) {
        *self = Frame::default();
    }

    /// Drop the buffer storage without running its release hook, keeping the
    /// rest of the frame empty. Logged by the caller; better than crashing.
    pub(crate) fn leak_buf(&mut self) {
        if let Some(buf) = &mut self.buf {
            buf.forget_release();
        }
        self.unref();
    }
}
