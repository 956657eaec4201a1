use std::{
    mem,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use crossbeam::queue::ArrayQueue;
use tracing::{error, warn};

use crate::{
    buffer::{CallbackPolicy, FrameParams},
    codec::{Codec, CodecCaps},
    context::{CodecContext, DerivedState, PixelFormat},
    frame::{Frame, Packet},
    pipeline::PipelineShared,
    progress::{Monitor, Phase, Progress, ReflectedCall, ReflectedReply},
    Error,
};

/// Deferred-release backlog per worker. Overflow logs and leaks instead of
/// blocking a worker mid-decode.
pub(crate) const RELEASED_QUEUE_CAPACITY: usize = 32;

/// Everything a worker owns for its current round. The slot mutex is the
/// submit lock: the worker holds it for the whole round and only releases it
/// while parked on the input condvar, which is exactly when the coordinator
/// may refill it.
pub(crate) struct Slot<C: Codec> {
    pub ctx: CodecContext,
    pub decoder: C::Decoder,
    pub packet: Packet,
    pub frame: Frame,
    pub got_frame: bool,
    pub result: Option<anyhow::Error>,
    pub die: bool,
    pub hwaccel_serializing: bool,
    pub async_serializing: bool,
}

/// Reference state published at setup-complete for the next submission.
pub(crate) struct Published<C: Codec> {
    pub derived: DerivedState,
    pub shared: C::Shared,
}

impl<C: Codec> Default for Published<C> {
    fn default() -> Published<C> {
        Published {
            derived: DerivedState::default(),
            shared: C::Shared::default(),
        }
    }
}

pub(crate) struct WorkerShared<C: Codec> {
    pub slot: Mutex<Slot<C>>,
    /// Wakes the worker when a packet has been placed in the slot.
    pub input_cond: Condvar,
    pub monitor: Arc<Monitor>,
    pub published: Mutex<Published<C>>,
    /// Frames whose unref must happen on the caller thread; drained by the
    /// coordinator before the next submission to this worker.
    pub released: ArrayQueue<Frame>,
}

/// The pipeline services a back-end may call during [`Codec::decode`].
pub struct DecodeScope<'a, C: Codec> {
    /// This worker's private decoder context. The back-end stores derived
    /// state (dimensions, formats) here during setup.
    pub ctx: &'a mut CodecContext,
    pub(crate) caps: CodecCaps,
    pub(crate) pipeline: &'a PipelineShared,
    pub(crate) worker: &'a WorkerShared<C>,
    pub(crate) hwaccel_guard: Option<MutexGuard<'a, ()>>,
    pub(crate) hwaccel_serializing: &'a mut bool,
    pub(crate) async_serializing: &'a mut bool,
}

impl<'a, C: Codec> DecodeScope<'a, C> {
    fn frame_params(&self) -> FrameParams {
        FrameParams {
            width: self.ctx.width,
            height: self.ctx.height,
            format: self.ctx.pix_fmt,
        }
    }

    /// Declare setup complete: publish the hand-off state, stash serialised
    /// hwaccel state for the next worker, and unblock the next submission.
    ///
    /// Must be called before any hwaccel work. A second call warns and does
    /// nothing.
    pub fn finish_setup(&mut self, shared: C::Shared) {
        if !self.ctx.frame_threading {
            return;
        }
        if self.worker.monitor.phase() == Phase::SetupDone {
            warn!("finish_setup called more than once");
            return;
        }

        if let Some(hwaccel) = &self.ctx.hwaccel {
            if !hwaccel.desc.mt_safe && !*self.hwaccel_serializing {
                self.hwaccel_guard = Some(self.pipeline.hwaccel_mutex.lock().unwrap());
                *self.hwaccel_serializing = true;
            }
            if !hwaccel.desc.async_safe && !*self.async_serializing {
                *self.async_serializing = true;
                self.pipeline.async_lock.lock();
            }
            if !hwaccel.desc.mt_safe {
                // ownership hand-off to the next submission; at most one
                // worker is in setup, so the stash must be empty here
                let mut stash = self.pipeline.hwaccel_stash.lock().unwrap();
                debug_assert!(stash.is_none());
                *stash = self.ctx.hwaccel.clone();
            }
        }

        {
            let mut published = self.worker.published.lock().unwrap();
            published.derived = self.ctx.derived();
            published.shared = shared;
        }

        let monitor = &self.worker.monitor;
        let _mailbox = monitor.lock.lock().unwrap();
        monitor.set_phase(Phase::SetupDone);
        monitor.progress_cond.notify_all();
    }

    /// Whether the back-end may begin deriving state for a new frame.
    pub fn can_start_frame(&self) -> bool {
        !(self.ctx.frame_threading
            && self.worker.monitor.phase() != Phase::SettingUp
            && (self.caps.update_thread_context
                || self.ctx.callbacks.policy == CallbackPolicy::CallerOnly))
    }

    /// Request an output buffer for `frame` from the user's allocator,
    /// attaching a progress channel first when the back-end asked for one.
    pub fn get_buffer(&mut self, frame: &mut Frame) -> Result<(), Error> {
        let params = self.frame_params();

        if !self.ctx.frame_threading {
            return self
                .ctx
                .callbacks
                .allocator
                .alloc(&params, frame)
                .map_err(Error::Alloc);
        }

        if self.worker.monitor.phase() != Phase::SettingUp
            && (self.caps.update_thread_context
                || self.ctx.callbacks.policy == CallbackPolicy::CallerOnly)
        {
            error!("get_buffer called after setup finished");
            return Err(Error::InvalidCallOrder("get_buffer"));
        }

        if self.caps.allocate_progress {
            frame.set_progress(Arc::new(Progress::new(self.worker.monitor.clone())));
        }

        let result = {
            let _buffers = self.pipeline.buffer_mutex.lock().unwrap();
            match self.ctx.callbacks.policy {
                CallbackPolicy::ThreadSafe => {
                    self.ctx.callbacks.allocator.alloc(&params, frame)
                }
                CallbackPolicy::CallerOnly => self.reflect_get_buffer(params, frame),
            }
        };

        if self.ctx.callbacks.policy == CallbackPolicy::CallerOnly
            && !self.caps.update_thread_context
        {
            self.finish_setup(C::Shared::default());
        }

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                frame.clear_progress();
                Err(Error::Alloc(e))
            }
        }
    }

    /// Move the frame to the caller thread, let it run the allocator, take
    /// the frame back. The buffer mutex is held across the whole wait.
    fn reflect_get_buffer(&self, params: FrameParams, frame: &mut Frame) -> anyhow::Result<()> {
        let monitor = &self.worker.monitor;
        let mut mailbox = monitor.lock.lock().unwrap();
        mailbox.call = Some(ReflectedCall::Buffer {
            params,
            frame: mem::take(frame),
        });
        monitor.set_phase(Phase::AwaitingBuffer);
        monitor.progress_cond.notify_all();

        while monitor.phase() != Phase::SettingUp {
            mailbox = monitor.progress_cond.wait(mailbox).unwrap();
        }

        match mailbox.reply.take() {
            Some(ReflectedReply::Buffer {
                frame: filled,
                result,
            }) => {
                *frame = filled;
                result
            }
            _ => unreachable!("buffer reflection completed without a reply"),
        }
    }

    /// Negotiate the pixel format with the user, reflecting the call to the
    /// caller thread when the negotiator is not thread-safe.
    pub fn get_format(&mut self, candidates: &[PixelFormat]) -> Result<PixelFormat, Error> {
        let params = self.frame_params();

        if !self.ctx.frame_threading
            || self.ctx.callbacks.policy == CallbackPolicy::ThreadSafe
        {
            return Ok(self.ctx.callbacks.negotiator.pick(&params, candidates));
        }

        if self.worker.monitor.phase() != Phase::SettingUp {
            error!("get_format called after setup finished");
            return Err(Error::InvalidCallOrder("get_format"));
        }

        let monitor = &self.worker.monitor;
        let mut mailbox = monitor.lock.lock().unwrap();
        mailbox.call = Some(ReflectedCall::Format {
            params,
            candidates: candidates.to_vec(),
        });
        monitor.set_phase(Phase::AwaitingFormat);
        monitor.progress_cond.notify_all();

        while monitor.phase() != Phase::SettingUp {
            mailbox = monitor.progress_cond.wait(mailbox).unwrap();
        }

        match mailbox.reply.take() {
            Some(ReflectedReply::Format { format }) => Ok(format),
            _ => unreachable!("format reflection completed without a reply"),
        }
    }

    /// Release an output buffer. When the allocator is thread-affine the
    /// unref is queued and performed by the coordinator on the caller thread.
    pub fn release_buffer(&self, frame: &mut Frame) {
        if !frame.has_buf() {
            frame.unref();
            return;
        }

        frame.clear_progress();

        let direct = !self.ctx.frame_threading
            || self.ctx.callbacks.policy == CallbackPolicy::ThreadSafe;
        if direct {
            frame.unref();
            return;
        }

        let queued = mem::take(frame);
        if let Err(mut rejected) = self.worker.released.push(queued) {
            warn!("deferred-release queue is full, leaking a frame buffer");
            rejected.leak_buf();
        }
    }

    /// End-of-round cleanup: wipe serialised hwaccel state (its ownership
    /// moved to the stash in `finish_setup`) and drop the serialisation
    /// locks.
    fn release_serialization(&mut self) {
        if *self.hwaccel_serializing {
            self.ctx.hwaccel = None;
            *self.hwaccel_serializing = false;
            self.hwaccel_guard = None;
        }
        debug_assert!(self
            .ctx
            .hwaccel
            .as_ref()
            .map_or(true, |hwaccel| hwaccel.desc.mt_safe));

        if *self.async_serializing {
            *self.async_serializing = false;
            self.pipeline.async_lock.unlock();
        }
    }
}

/// Worker thread body. Parks on the input condvar, decodes one packet per
/// round, and signals setup-done itself if the back-end never did.
pub(crate) fn run<C: Codec>(
    codec: Arc<C>,
    shared: Arc<WorkerShared<C>>,
    pipeline: Arc<PipelineShared>,
) {
    let caps = codec.caps();
    let mut guard = shared.slot.lock().unwrap();

    loop {
        while shared.monitor.phase() == Phase::Idle && !guard.die {
            guard = shared.input_cond.wait(guard).unwrap();
        }
        if guard.die {
            break;
        }

        let slot = &mut *guard;
        let mut cx = DecodeScope {
            ctx: &mut slot.ctx,
            caps,
            pipeline: &pipeline,
            worker: &shared,
            hwaccel_guard: None,
            hwaccel_serializing: &mut slot.hwaccel_serializing,
            async_serializing: &mut slot.async_serializing,
        };

        // A back-end that neither propagates state nor reflects callbacks is
        // stateless between packets for our purposes; setup is complete
        // before decoding even starts.
        if !caps.update_thread_context
            && cx.ctx.callbacks.policy == CallbackPolicy::ThreadSafe
        {
            cx.finish_setup(C::Shared::default());
        }

        // A serialised hwaccel binding handed over by the previous worker
        // keeps the whole decode call under the hwaccel mutex.
        debug_assert!(!*cx.hwaccel_serializing);
        if let Some(hwaccel) = &cx.ctx.hwaccel {
            if !hwaccel.desc.mt_safe {
                cx.hwaccel_guard = Some(pipeline.hwaccel_mutex.lock().unwrap());
                *cx.hwaccel_serializing = true;
            }
        }

        let frame = &mut slot.frame;
        frame.unref();
        slot.got_frame = false;
        match codec.decode(&mut slot.decoder, &mut cx, frame, &slot.packet) {
            Ok(got_frame) => {
                slot.got_frame = got_frame;
                slot.result = None;
            }
            Err(e) => {
                slot.got_frame = false;
                slot.result = Some(e);
            }
        }

        if (slot.result.is_some() || !slot.got_frame) && frame.has_buf() {
            if caps.allocate_progress {
                error!(
                    "frame-threaded decoder left a buffer attached on failure, \
                     this is a codec bug"
                );
            }
            frame.unref();
        }

        if shared.monitor.phase() == Phase::SettingUp {
            cx.finish_setup(C::Shared::default());
        }

        cx.release_serialization();
        drop(cx);

        shared.monitor.finish_round();
    }
}
