use std::{
    mem,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

use crate::{
    buffer::CallbackPolicy,
    codec::{Codec, CodecCaps},
    context::{CodecContext, HwAccelState},
    frame::{Frame, Packet},
    progress::{Phase, ReflectedCall, ReflectedReply},
    worker::{self, Published, Slot, WorkerShared, RELEASED_QUEUE_CAPACITY},
    Error,
};

const MAX_AUTO_THREADS: usize = 16;

/// Recognised pipeline options, applied onto a [`CodecContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Options {
    /// 0 = auto (cores + 1, capped at 16), 1 = disable, else fixed.
    pub thread_count: usize,
    /// Per-event diagnostics logging.
    pub debug_threads: bool,
}

impl Options {
    pub fn apply(&self, ctx: &mut CodecContext) {
        ctx.thread_count = self.thread_count;
        ctx.debug_threads = self.debug_threads;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutput {
    pub got_frame: bool,
    /// Bytes of the input packet consumed (its full size on success).
    pub consumed: usize,
}

/// The "some setup is in flight" gate for non-async-safe hwaccel: a logical
/// lock whose hold spans from one worker's `finish_setup` to the end of its
/// decode, released by the caller while it sits inside the decode entry
/// point.
pub(crate) struct AsyncLock {
    held: Mutex<bool>,
    cond: Condvar,
}

impl AsyncLock {
    fn new(held: bool) -> AsyncLock {
        AsyncLock {
            held: Mutex::new(held),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cond.wait(held).unwrap();
        }
        *held = true;
    }

    pub fn unlock(&self) {
        let mut held = self.held.lock().unwrap();
        assert!(*held);
        *held = false;
        self.cond.notify_all();
    }
}

/// Locks and hand-off state shared between the coordinator and all workers.
pub(crate) struct PipelineShared {
    /// Serialises user buffer-allocator callbacks.
    pub buffer_mutex: Mutex<()>,
    /// Serialises non-MT-safe hwaccel callbacks to one worker at a time.
    pub hwaccel_mutex: Mutex<()>,
    pub async_lock: AsyncLock,
    /// Hand-off slot between the worker that finished setup and the next
    /// submission. Non-empty only in that window (at most one setup owner,
    /// so the lock is never contended).
    pub hwaccel_stash: Mutex<Option<HwAccelState>>,
}

struct Worker<C: Codec> {
    shared: Arc<WorkerShared<C>>,
    join: Option<JoinHandle<()>>,
}

/// The frame-parallel decoder pipeline: N workers, each with a private
/// decoder instance, fed round-robin and harvested in submission order.
///
/// Exactly one thread (the owner of this value) may call
/// [`FramePipeline::decode`]; the pipeline is the caller-facing coordinator,
/// not itself a thread.
pub struct FramePipeline<C: Codec> {
    codec: Arc<C>,
    caps: CodecCaps,
    shared: Arc<PipelineShared>,
    workers: Vec<Worker<C>>,
    /// The worker that most recently received a packet; source of decoder
    /// state for the next submission.
    prev: Option<usize>,
    next_submit: usize,
    next_output: usize,
    /// Packets accepted since init/flush; no output while fewer than
    /// `thread_count - priming_latency` have been taken in.
    submitted: usize,
    priming: bool,
    thread_count: usize,
}

fn resolve_thread_count(requested: usize) -> usize {
    if requested != 0 {
        return requested;
    }
    let ncpu = thread::available_parallelism().map_or(1, |n| n.get());
    if ncpu > 1 {
        (ncpu + 1).min(MAX_AUTO_THREADS)
    } else {
        1
    }
}

impl<C: Codec> FramePipeline<C> {
    /// Build the pipeline: duplicate the decoder context per worker, open a
    /// private decoder on each copy, spawn the worker threads. On failure the
    /// partially built pipeline is unwound.
    #[instrument(skip_all, err)]
    pub fn new(codec: C, ctx: &mut CodecContext) -> Result<FramePipeline<C>, Error> {
        let thread_count = resolve_thread_count(ctx.thread_count);
        if thread_count <= 1 {
            return Err(Error::ThreadingDisabled);
        }
        ctx.thread_count = thread_count;
        ctx.frame_threading = true;
        ctx.delay = thread_count - 1;

        let codec = Arc::new(codec);
        let caps = codec.caps();
        let shared = Arc::new(PipelineShared {
            buffer_mutex: Mutex::new(()),
            hwaccel_mutex: Mutex::new(()),
            // held while the pipeline is at rest, released inside `decode`
            async_lock: AsyncLock::new(true),
            hwaccel_stash: Mutex::new(None),
        });

        let mut pipeline = FramePipeline {
            codec: codec.clone(),
            caps,
            shared: shared.clone(),
            workers: Vec::with_capacity(thread_count),
            prev: None,
            next_submit: 0,
            next_output: 0,
            submitted: 0,
            priming: true,
            thread_count,
        };

        for i in 0..thread_count {
            let worker_ctx = ctx.clone();
            let decoder = match codec.open(&worker_ctx) {
                Ok(decoder) => decoder,
                Err(e) => {
                    pipeline.teardown();
                    return Err(Error::Init(e));
                }
            };

            let worker_shared = Arc::new(WorkerShared {
                slot: Mutex::new(Slot {
                    ctx: worker_ctx,
                    decoder,
                    packet: Packet::default(),
                    frame: Frame::default(),
                    got_frame: false,
                    result: None,
                    die: false,
                    hwaccel_serializing: false,
                    async_serializing: false,
                }),
                input_cond: Condvar::new(),
                monitor: Arc::new(crate::progress::Monitor::new(ctx.debug_threads)),
                published: Mutex::new(Published::default()),
                released: crossbeam::queue::ArrayQueue::new(RELEASED_QUEUE_CAPACITY),
            });

            if i == 0 {
                // the first copy's derived fields flow straight back to the
                // caller, the way a single-threaded open would
                let slot = worker_shared.slot.lock().unwrap();
                ctx.apply_derived(&slot.ctx.derived());
            }

            let spawned = {
                let codec = codec.clone();
                let worker_shared = worker_shared.clone();
                let pipeline_shared = shared.clone();
                thread::Builder::new()
                    .name(format!("frame-decode-{i}"))
                    .spawn(move || worker::run(codec, worker_shared, pipeline_shared))
            };
            match spawned {
                Ok(join) => pipeline.workers.push(Worker {
                    shared: worker_shared,
                    join: Some(join),
                }),
                Err(e) => {
                    pipeline.workers.push(Worker {
                        shared: worker_shared,
                        join: None,
                    });
                    pipeline.teardown();
                    return Err(Error::Init(e.into()));
                }
            }
        }

        Ok(pipeline)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Feed one packet and harvest the oldest completed frame, preserving
    /// submission order. During priming no frame is produced; with an empty
    /// packet the pipeline drains its tail instead of accepting input.
    ///
    /// A decode error from the back-end surfaces here in submission order
    /// and is non-fatal: the pipeline keeps running.
    pub fn decode(
        &mut self,
        ctx: &mut CodecContext,
        frame: &mut Frame,
        packet: &Packet,
    ) -> Result<DecodeOutput, Error> {
        // let blocked hwaccel setups progress while we are in here
        self.shared.async_lock.unlock();
        let result = self.decode_inner(ctx, frame, packet);
        self.shared.async_lock.lock();
        result
    }

    fn decode_inner(
        &mut self,
        ctx: &mut CodecContext,
        frame: &mut Frame,
        packet: &Packet,
    ) -> Result<DecodeOutput, Error> {
        self.submit(ctx, packet)?;

        if self.priming && !packet.is_empty() {
            return Ok(DecodeOutput {
                got_frame: false,
                consumed: packet.size(),
            });
        }

        // Harvest the oldest worker. At end-of-stream, skip workers that
        // produced neither frame nor error so an empty round is not mistaken
        // for the end of the tail.
        let draining = packet.is_empty();
        let mut finished = self.next_output;
        let mut producer;
        let mut got_frame;
        let mut result;
        loop {
            let worker = &self.workers[finished];
            let monitor = &worker.shared.monitor;
            if monitor.phase() != Phase::Idle {
                let mut mailbox = monitor.lock.lock().unwrap();
                while monitor.phase() != Phase::Idle {
                    mailbox = monitor.output_cond.wait(mailbox).unwrap();
                }
            }

            let mut slot = worker.shared.slot.lock().unwrap();
            *frame = mem::take(&mut slot.frame);
            frame.pkt_dts = slot.packet.dts;
            got_frame = slot.got_frame;
            result = slot.result.take();
            // a later drain pass must not return this outcome again
            slot.got_frame = false;
            drop(slot);

            producer = finished;
            finished = (finished + 1) % self.thread_count;

            if !(draining && !got_frame && result.is_none() && finished != self.next_output) {
                break;
            }
        }

        // the caller sees the producing worker's dimensions etc.
        {
            let slot = self.workers[producer].shared.slot.lock().unwrap();
            ctx.apply_derived(&slot.ctx.derived());
        }
        self.next_output = finished;

        match result {
            Some(e) => Err(Error::Decode(e)),
            None => Ok(DecodeOutput {
                got_frame,
                consumed: packet.size(),
            }),
        }
    }

    /// Hand `packet` to the worker at the submit cursor.
    fn submit(&mut self, ctx: &CodecContext, packet: &Packet) -> Result<(), Error> {
        if packet.is_empty() && !self.caps.delay {
            return Ok(());
        }

        let k = self.next_submit;
        let worker = &self.workers[k];
        let mut slot = worker.shared.slot.lock().unwrap();

        slot.ctx.update_from_user(ctx);
        worker
            .shared
            .monitor
            .debug
            .store(slot.ctx.debug_threads, std::sync::atomic::Ordering::Relaxed);

        self.drain_released(worker);

        if let Some(prev) = self.prev {
            let prev_shared = &self.workers[prev].shared;
            // the upstream worker must publish its derived state before we
            // copy it; at most one worker is ever in setup
            if prev_shared.monitor.phase() == Phase::SettingUp {
                let monitor = &prev_shared.monitor;
                let mut mailbox = monitor.lock.lock().unwrap();
                while monitor.phase() == Phase::SettingUp {
                    mailbox = monitor.progress_cond.wait(mailbox).unwrap();
                }
            }

            if prev != k && self.caps.update_thread_context {
                let published = prev_shared.published.lock().unwrap();
                slot.ctx.apply_derived(&published.derived);
                self.codec
                    .update_thread_context(&mut slot.decoder, &published.shared)
                    .map_err(Error::Context)?;
            }
        }

        // transfer the stashed hwaccel state, if any
        debug_assert!(slot
            .ctx
            .hwaccel
            .as_ref()
            .map_or(true, |hwaccel| hwaccel.desc.mt_safe));
        if let Some(hwaccel) = self.shared.hwaccel_stash.lock().unwrap().take() {
            slot.ctx.hwaccel = Some(hwaccel);
        }

        slot.packet = packet.clone();

        worker.shared.monitor.set_phase(Phase::SettingUp);
        worker.shared.input_cond.notify_one();
        drop(slot);

        if ctx.callbacks.policy == CallbackPolicy::CallerOnly {
            self.reflect_callbacks(k, ctx);
        }

        self.prev = Some(k);
        self.next_submit = (k + 1) % self.thread_count;
        self.submitted += 1;
        if self.submitted + self.caps.priming_latency >= self.thread_count {
            self.priming = false;
        }
        Ok(())
    }

    /// Relay the worker's buffer/format requests to the user callbacks on
    /// this (the caller's) thread, until its setup is over.
    fn reflect_callbacks(&self, k: usize, user_ctx: &CodecContext) {
        let monitor = &self.workers[k].shared.monitor;
        loop {
            if let Phase::SetupDone | Phase::Idle = monitor.phase() {
                return;
            }

            let mut mailbox = monitor.lock.lock().unwrap();
            while monitor.phase() == Phase::SettingUp {
                mailbox = monitor.progress_cond.wait(mailbox).unwrap();
            }

            match monitor.phase() {
                Phase::AwaitingBuffer => match mailbox.call.take() {
                    Some(ReflectedCall::Buffer { params, mut frame }) => {
                        let result = user_ctx.callbacks.allocator.alloc(&params, &mut frame);
                        mailbox.reply = Some(ReflectedReply::Buffer { frame, result });
                        monitor.set_phase(Phase::SettingUp);
                        monitor.progress_cond.notify_all();
                    }
                    _ => unreachable!("worker awaiting a buffer without a request"),
                },
                Phase::AwaitingFormat => match mailbox.call.take() {
                    Some(ReflectedCall::Format { params, candidates }) => {
                        let format = user_ctx.callbacks.negotiator.pick(&params, &candidates);
                        mailbox.reply = Some(ReflectedReply::Format { format });
                        monitor.set_phase(Phase::SettingUp);
                        monitor.progress_cond.notify_all();
                    }
                    _ => unreachable!("worker awaiting a format without a request"),
                },
                Phase::SetupDone | Phase::Idle => return,
                Phase::SettingUp => {}
            }
        }
    }

    /// Unref frames this worker queued for release, on this (the caller's)
    /// thread, under the buffer mutex.
    fn drain_released(&self, worker: &Worker<C>) {
        while let Some(mut frame) = worker.shared.released.pop() {
            let _buffers = self.shared.buffer_mutex.lock().unwrap();
            frame.unref();
        }
    }

    /// Wait until every worker is parked.
    fn park_workers(&self) {
        self.shared.async_lock.unlock();

        for worker in &self.workers {
            let monitor = &worker.shared.monitor;
            if monitor.phase() != Phase::Idle {
                let mut mailbox = monitor.lock.lock().unwrap();
                while monitor.phase() != Phase::Idle {
                    mailbox = monitor.output_cond.wait(mailbox).unwrap();
                }
            }
            worker.shared.slot.lock().unwrap().got_frame = false;
        }

        self.shared.async_lock.lock();
    }

    /// Reset to the primed state: park everything, make worker 0 the new
    /// reference point, clear cursors and stale outcomes, flush each private
    /// decoder. Idempotent.
    #[instrument(skip_all)]
    pub fn flush(&mut self) {
        self.park_workers();

        if let Some(prev) = self.prev {
            if prev != 0 {
                self.propagate_to_first(prev);
            }
        }

        self.next_submit = 0;
        self.next_output = 0;
        self.submitted = 0;
        self.priming = true;
        self.prev = None;

        for worker in &self.workers {
            let mut slot = worker.shared.slot.lock().unwrap();
            slot.got_frame = false;
            slot.result = None;
            slot.frame.unref();
            self.codec.flush(&mut slot.decoder);
            drop(slot);
            self.drain_released(worker);
        }
    }

    fn propagate_to_first(&self, prev: usize) {
        if !self.caps.update_thread_context {
            return;
        }
        let src = self.workers[prev].shared.slot.lock().unwrap();
        let mut dst = self.workers[0].shared.slot.lock().unwrap();
        dst.ctx.apply_derived(&src.ctx.derived());
        drop(src);
        let published = self.workers[prev].shared.published.lock().unwrap();
        if let Err(e) = self
            .codec
            .update_thread_context(&mut dst.decoder, &published.shared)
        {
            error!(%e, "final thread context update failed");
        }
    }

    /// Tear the pipeline down, propagating the final decoder state (and any
    /// stashed hwaccel state) back to the user context so it survives close.
    #[instrument(skip_all)]
    pub fn shutdown(mut self, ctx: &mut CodecContext) {
        if self.workers.is_empty() {
            return;
        }
        self.park_workers();

        if let Some(prev) = self.prev {
            let slot = self.workers[prev].shared.slot.lock().unwrap();
            ctx.apply_derived(&slot.ctx.derived());
        }

        self.teardown();

        if let Some(hwaccel) = self.shared.hwaccel_stash.lock().unwrap().take() {
            ctx.hwaccel = Some(hwaccel);
        }
        ctx.frame_threading = false;
        ctx.delay = 0;
    }

    /// Stop and join every worker, close the private decoders, run the
    /// remaining deferred releases. Safe to call more than once.
    fn teardown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.park_workers();

        for worker in &self.workers {
            worker.shared.slot.lock().unwrap().die = true;
            worker.shared.input_cond.notify_one();
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
        for worker in &self.workers {
            let mut slot = worker.shared.slot.lock().unwrap();
            self.codec.close(&mut slot.decoder);
            drop(slot);
            self.drain_released(worker);
        }
        self.workers.clear();
    }
}

impl<C: Codec> Drop for FramePipeline<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}
