use std::{
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering::SeqCst},
        Arc, Mutex,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use anyhow::bail;

use super::*;

fn packet(i: i64) -> Packet {
    Packet::with_dts(vec![1u8; 8], i)
}

fn context(thread_count: usize) -> CodecContext {
    let mut ctx = CodecContext::default();
    ctx.thread_count = thread_count;
    ctx
}

/// Feed empty packets until the pipeline reports its tail is gone.
fn drain<C: Codec>(pipeline: &mut FramePipeline<C>, ctx: &mut CodecContext) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        let mut frame = Frame::default();
        let output = pipeline
            .decode(ctx, &mut frame, &Packet::empty())
            .expect("drain should not error");
        if !output.got_frame {
            break;
        }
        frames.push(frame);
    }
    frames
}

/// Stateless back-end: one packet in, one frame out, pts = packet dts.
struct CounterCodec;

impl Codec for CounterCodec {
    type Decoder = ();
    type Shared = ();

    fn caps(&self) -> CodecCaps {
        CodecCaps::default()
    }

    fn open(&self, _ctx: &CodecContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(
        &self,
        _decoder: &mut (),
        _cx: &mut DecodeScope<'_, Self>,
        frame: &mut Frame,
        packet: &Packet,
    ) -> anyhow::Result<bool> {
        if packet.is_empty() {
            return Ok(false);
        }
        frame.pts = packet.dts;
        Ok(true)
    }
}

#[test]
fn test_fifo_order() {
    crate::init();
    let mut ctx = context(4);
    let mut pipeline = FramePipeline::new(CounterCodec, &mut ctx).unwrap();
    assert_eq!(pipeline.thread_count(), 4);
    assert_eq!(ctx.delay, 3);

    let mut outputs = Vec::new();
    for i in 0..10 {
        let mut frame = Frame::default();
        let output = pipeline.decode(&mut ctx, &mut frame, &packet(i)).unwrap();
        assert_eq!(output.consumed, 8);
        if output.got_frame {
            assert_eq!(frame.pkt_dts, frame.pts);
            outputs.push(frame.pts.unwrap());
        } else {
            // only the priming window may hold frames back
            assert!(i < 3, "output missing outside the priming window");
        }
    }
    outputs.extend(drain(&mut pipeline, &mut ctx).iter().map(|f| f.pts.unwrap()));

    assert_eq!(outputs, (0..10).collect::<Vec<_>>());
    pipeline.shutdown(&mut ctx);
}

#[test]
fn test_priming_latency_shortens_window() {
    struct EagerCodec;
    impl Codec for EagerCodec {
        type Decoder = ();
        type Shared = ();
        fn caps(&self) -> CodecCaps {
            CodecCaps {
                priming_latency: 1,
                ..CodecCaps::default()
            }
        }
        fn open(&self, _ctx: &CodecContext) -> anyhow::Result<()> {
            Ok(())
        }
        fn decode(
            &self,
            _decoder: &mut (),
            _cx: &mut DecodeScope<'_, Self>,
            frame: &mut Frame,
            packet: &Packet,
        ) -> anyhow::Result<bool> {
            frame.pts = packet.dts;
            Ok(!packet.is_empty())
        }
    }

    crate::init();
    let mut ctx = context(3);
    let mut pipeline = FramePipeline::new(EagerCodec, &mut ctx).unwrap();

    let mut frame = Frame::default();
    let output = pipeline.decode(&mut ctx, &mut frame, &packet(0)).unwrap();
    assert!(!output.got_frame);
    // one packet less in flight than the thread count
    let output = pipeline.decode(&mut ctx, &mut frame, &packet(1)).unwrap();
    assert!(output.got_frame);
    assert_eq!(frame.pts, Some(0));
    pipeline.shutdown(&mut ctx);
}

const ROWS: i32 = 16;

/// Back-end whose frame k references frame k-1: it blocks until the previous
/// worker has reported its last row, the way real inter-frame prediction
/// does.
struct ChainCodec {
    in_setup: Arc<AtomicI32>,
    overlap: Arc<AtomicBool>,
}

#[derive(Default)]
struct ChainDecoder {
    prev: Option<Arc<Progress>>,
}

impl Codec for ChainCodec {
    type Decoder = ChainDecoder;
    type Shared = Option<Arc<Progress>>;

    fn caps(&self) -> CodecCaps {
        CodecCaps {
            allocate_progress: true,
            update_thread_context: true,
            ..CodecCaps::default()
        }
    }

    fn open(&self, _ctx: &CodecContext) -> anyhow::Result<ChainDecoder> {
        Ok(ChainDecoder::default())
    }

    fn decode(
        &self,
        decoder: &mut ChainDecoder,
        cx: &mut DecodeScope<'_, Self>,
        frame: &mut Frame,
        packet: &Packet,
    ) -> anyhow::Result<bool> {
        if packet.is_empty() {
            return Ok(false);
        }

        // I1: never two workers deriving setup state at once
        if self.in_setup.fetch_add(1, SeqCst) != 0 {
            self.overlap.store(true, SeqCst);
        }
        assert!(cx.can_start_frame());
        cx.ctx.width = 64;
        cx.ctx.height = ROWS as u32;
        cx.ctx.pix_fmt = PixelFormat::Yuv420p;
        cx.get_buffer(frame)?;
        let progress = frame.progress().unwrap().clone();
        self.in_setup.fetch_sub(1, SeqCst);
        cx.finish_setup(Some(progress));
        assert!(!cx.can_start_frame());

        if let Some(prev) = decoder.prev.take() {
            prev.wait(ROWS, 0);
        }
        frame.report_progress(ROWS / 2, 0);
        thread::sleep(Duration::from_millis(1));
        frame.report_progress(ROWS, 0);

        frame.pts = packet.dts;
        Ok(true)
    }

    fn update_thread_context(
        &self,
        dst: &mut ChainDecoder,
        src: &Option<Arc<Progress>>,
    ) -> anyhow::Result<()> {
        dst.prev = src.clone();
        Ok(())
    }
}

#[test]
fn test_progress_chained_references() {
    crate::init();
    let overlap = Arc::new(AtomicBool::new(false));
    let codec = ChainCodec {
        in_setup: Arc::new(AtomicI32::new(0)),
        overlap: overlap.clone(),
    };
    let mut ctx = context(2);
    let mut pipeline = FramePipeline::new(codec, &mut ctx).unwrap();

    let mut outputs = Vec::new();
    for i in 0..6 {
        let mut frame = Frame::default();
        let output = pipeline.decode(&mut ctx, &mut frame, &packet(i)).unwrap();
        if output.got_frame {
            assert_eq!(frame.progress().unwrap().current(0), ROWS);
            outputs.push(frame.pts.unwrap());
        }
    }
    outputs.extend(drain(&mut pipeline, &mut ctx).iter().map(|f| f.pts.unwrap()));

    assert_eq!(outputs, (0..6).collect::<Vec<_>>());
    assert!(!overlap.load(SeqCst), "two workers were in setup at once");

    // decoded dimensions made it back to the caller
    assert_eq!((ctx.width, ctx.height), (64, ROWS as u32));
    pipeline.shutdown(&mut ctx);
    assert_eq!((ctx.width, ctx.height), (64, ROWS as u32));
    assert!(!ctx.frame_threading);
}

struct RecordingAllocator {
    ids: Mutex<Vec<ThreadId>>,
    release_ids: Arc<Mutex<Vec<ThreadId>>>,
}

impl FrameAllocator for RecordingAllocator {
    fn alloc(&self, params: &FrameParams, frame: &mut Frame) -> anyhow::Result<()> {
        self.ids.lock().unwrap().push(thread::current().id());
        frame.width = params.width;
        frame.height = params.height;
        frame.format = params.format;
        let release_ids = self.release_ids.clone();
        frame.set_buf(FrameBuffer::with_release(vec![0; 64], move |_| {
            release_ids.lock().unwrap().push(thread::current().id());
        }));
        Ok(())
    }
}

struct PassNegotiator;

impl FormatNegotiator for PassNegotiator {
    fn pick(&self, _params: &FrameParams, candidates: &[PixelFormat]) -> PixelFormat {
        candidates[0]
    }
}

/// Back-end that allocates its output through `get_buffer` every packet.
struct ReflectCodec;

impl Codec for ReflectCodec {
    type Decoder = ();
    type Shared = ();

    fn caps(&self) -> CodecCaps {
        CodecCaps::default()
    }

    fn open(&self, _ctx: &CodecContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(
        &self,
        _decoder: &mut (),
        cx: &mut DecodeScope<'_, Self>,
        frame: &mut Frame,
        packet: &Packet,
    ) -> anyhow::Result<bool> {
        if packet.is_empty() {
            return Ok(false);
        }
        cx.ctx.width = 8;
        cx.ctx.height = 8;
        cx.ctx.pix_fmt = PixelFormat::Rgb24;
        let format = cx.get_format(&[PixelFormat::Rgb24, PixelFormat::Yuv420p])?;
        assert_eq!(format, PixelFormat::Rgb24);
        cx.get_buffer(frame)?;
        frame.buf_mut().unwrap().data_mut()[0] = packet.dts.unwrap() as u8;
        frame.pts = packet.dts;
        Ok(true)
    }
}

#[test]
fn test_caller_only_callbacks_run_on_caller_thread() {
    crate::init();
    let release_ids = Arc::new(Mutex::new(Vec::new()));
    let allocator = Arc::new(RecordingAllocator {
        ids: Mutex::new(Vec::new()),
        release_ids: release_ids.clone(),
    });
    let mut ctx = context(3);
    ctx.callbacks = Callbacks {
        allocator: allocator.clone(),
        negotiator: Arc::new(PassNegotiator),
        policy: CallbackPolicy::CallerOnly,
    };

    let mut pipeline = FramePipeline::new(ReflectCodec, &mut ctx).unwrap();
    let mut outputs = Vec::new();
    for i in 0..6 {
        let mut frame = Frame::default();
        let output = pipeline.decode(&mut ctx, &mut frame, &packet(i)).unwrap();
        if output.got_frame {
            assert_eq!(frame.buf().unwrap().data()[0], frame.pts.unwrap() as u8);
            outputs.push(frame.pts.unwrap());
        }
    }
    outputs.extend(drain(&mut pipeline, &mut ctx).iter().map(|f| f.pts.unwrap()));
    pipeline.shutdown(&mut ctx);

    assert_eq!(outputs, (0..6).collect::<Vec<_>>());
    let caller = thread::current().id();
    let ids = allocator.ids.lock().unwrap();
    assert_eq!(ids.len(), 6);
    assert!(ids.iter().all(|id| *id == caller));
}

/// Back-end that keeps a reference frame across packets and releases the old
/// one through the pipeline, so the unref lands on the caller thread.
struct HoldingCodec;

#[derive(Default)]
struct HoldingDecoder {
    held: Option<Frame>,
}

impl Codec for HoldingCodec {
    type Decoder = HoldingDecoder;
    type Shared = ();

    fn caps(&self) -> CodecCaps {
        CodecCaps {
            update_thread_context: true,
            ..CodecCaps::default()
        }
    }

    fn open(&self, _ctx: &CodecContext) -> anyhow::Result<HoldingDecoder> {
        Ok(HoldingDecoder::default())
    }

    fn decode(
        &self,
        decoder: &mut HoldingDecoder,
        cx: &mut DecodeScope<'_, Self>,
        frame: &mut Frame,
        packet: &Packet,
    ) -> anyhow::Result<bool> {
        if packet.is_empty() {
            return Ok(false);
        }
        cx.ctx.width = 8;
        cx.ctx.height = 8;
        cx.ctx.pix_fmt = PixelFormat::Rgb24;
        if let Some(mut held) = decoder.held.take() {
            cx.release_buffer(&mut held);
        }
        cx.get_buffer(frame)?;
        let mut reference = Frame::default();
        cx.get_buffer(&mut reference)?;
        decoder.held = Some(reference);
        cx.finish_setup(());
        frame.pts = packet.dts;
        Ok(true)
    }

    fn close(&self, decoder: &mut HoldingDecoder) {
        // leftover reference dropped by the core's teardown path
        decoder.held = None;
    }
}

#[test]
fn test_deferred_release_runs_on_caller_thread() {
    crate::init();
    let release_ids = Arc::new(Mutex::new(Vec::new()));
    let allocator = Arc::new(RecordingAllocator {
        ids: Mutex::new(Vec::new()),
        release_ids: release_ids.clone(),
    });
    let mut ctx = context(2);
    ctx.callbacks = Callbacks {
        allocator,
        negotiator: Arc::new(PassNegotiator),
        policy: CallbackPolicy::CallerOnly,
    };

    let mut pipeline = FramePipeline::new(HoldingCodec, &mut ctx).unwrap();
    for i in 0..6 {
        let mut frame = Frame::default();
        let _ = pipeline.decode(&mut ctx, &mut frame, &packet(i)).unwrap();
    }
    drain(&mut pipeline, &mut ctx);
    pipeline.shutdown(&mut ctx);

    let caller = thread::current().id();
    let ids = release_ids.lock().unwrap();
    // every queued release was performed, and on the caller thread
    assert!(!ids.is_empty());
    assert!(ids.iter().all(|id| *id == caller));
}

struct Gauge {
    active: AtomicI32,
    violated: AtomicBool,
}

/// Back-end bound to a non-MT-safe, non-async-safe accelerator: each decode
/// enters a driver section that must never run on two workers at once.
struct HwCodec {
    desc: Arc<HwAccelDesc>,
    gauge: Arc<Gauge>,
}

impl Codec for HwCodec {
    type Decoder = ();
    type Shared = ();

    fn caps(&self) -> CodecCaps {
        CodecCaps {
            update_thread_context: true,
            ..CodecCaps::default()
        }
    }

    fn open(&self, _ctx: &CodecContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(
        &self,
        _decoder: &mut (),
        cx: &mut DecodeScope<'_, Self>,
        frame: &mut Frame,
        packet: &Packet,
    ) -> anyhow::Result<bool> {
        if packet.is_empty() {
            return Ok(false);
        }

        if cx.ctx.hwaccel.is_none() {
            // first worker binds the driver; later workers inherit it
            // through the stash hand-off
            cx.ctx.hwaccel = Some(HwAccelState {
                desc: self.desc.clone(),
                context: self.gauge.clone(),
                priv_data: Arc::new(()),
            });
        }
        cx.finish_setup(());

        let gauge = cx
            .ctx
            .hwaccel
            .as_ref()
            .unwrap()
            .context
            .clone()
            .downcast::<Gauge>()
            .unwrap();
        if gauge.active.fetch_add(1, SeqCst) != 0 {
            gauge.violated.store(true, SeqCst);
        }
        thread::sleep(Duration::from_millis(2));
        gauge.active.fetch_sub(1, SeqCst);

        frame.pts = packet.dts;
        Ok(true)
    }
}

#[test]
fn test_hwaccel_serialized_across_workers() {
    crate::init();
    let gauge = Arc::new(Gauge {
        active: AtomicI32::new(0),
        violated: AtomicBool::new(false),
    });
    let codec = HwCodec {
        desc: Arc::new(HwAccelDesc {
            name: "mock",
            mt_safe: false,
            async_safe: false,
        }),
        gauge: gauge.clone(),
    };
    let mut ctx = context(4);
    let mut pipeline = FramePipeline::new(codec, &mut ctx).unwrap();

    let mut outputs = Vec::new();
    for i in 0..8 {
        let mut frame = Frame::default();
        let output = pipeline.decode(&mut ctx, &mut frame, &packet(i)).unwrap();
        if output.got_frame {
            outputs.push(frame.pts.unwrap());
        }
    }
    outputs.extend(drain(&mut pipeline, &mut ctx).iter().map(|f| f.pts.unwrap()));
    assert_eq!(outputs, (0..8).collect::<Vec<_>>());
    assert!(
        !gauge.violated.load(SeqCst),
        "two workers were inside the hwaccel at once"
    );

    // the stash hands the binding back on teardown so the caller can free it
    assert!(ctx.hwaccel.is_none());
    pipeline.shutdown(&mut ctx);
    assert!(ctx.hwaccel.is_some());
}

/// Fails on one specific packet, decodes the rest.
struct FlakyCodec;

impl Codec for FlakyCodec {
    type Decoder = ();
    type Shared = ();

    fn caps(&self) -> CodecCaps {
        CodecCaps::default()
    }

    fn open(&self, _ctx: &CodecContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(
        &self,
        _decoder: &mut (),
        _cx: &mut DecodeScope<'_, Self>,
        frame: &mut Frame,
        packet: &Packet,
    ) -> anyhow::Result<bool> {
        if packet.is_empty() {
            return Ok(false);
        }
        if packet.dts == Some(2) {
            bail!("bad packet");
        }
        frame.pts = packet.dts;
        Ok(true)
    }
}

#[test]
fn test_error_surfaces_in_order_and_pipeline_survives() {
    crate::init();
    let mut ctx = context(3);
    let mut pipeline = FramePipeline::new(FlakyCodec, &mut ctx).unwrap();

    let mut outputs = Vec::new();
    let mut errors = 0;
    for i in 0..5 {
        let mut frame = Frame::default();
        match pipeline.decode(&mut ctx, &mut frame, &packet(i)) {
            Ok(output) => {
                if output.got_frame {
                    outputs.push(frame.pts.unwrap());
                }
            }
            Err(Error::Decode(_)) => {
                errors += 1;
                // the error belongs to packet 2, harvested in order
                assert_eq!(i, 4);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    outputs.extend(drain(&mut pipeline, &mut ctx).iter().map(|f| f.pts.unwrap()));

    assert_eq!(errors, 1);
    assert_eq!(outputs, vec![0, 1, 3, 4]);
    pipeline.shutdown(&mut ctx);
}

#[test]
fn test_flush_reprimes_pipeline() {
    crate::init();
    let mut ctx = context(2);
    let mut pipeline = FramePipeline::new(CounterCodec, &mut ctx).unwrap();

    let mut outputs = Vec::new();
    for i in 0..5 {
        let mut frame = Frame::default();
        if pipeline
            .decode(&mut ctx, &mut frame, &packet(i))
            .unwrap()
            .got_frame
        {
            outputs.push(frame.pts.unwrap());
        }
    }
    outputs.extend(drain(&mut pipeline, &mut ctx).iter().map(|f| f.pts.unwrap()));
    assert_eq!(outputs, vec![0, 1, 2, 3, 4]);

    // flush is idempotent
    pipeline.flush();
    pipeline.flush();

    let mut outputs = Vec::new();
    let mut suppressed = 0;
    for i in 100..103 {
        let mut frame = Frame::default();
        if pipeline
            .decode(&mut ctx, &mut frame, &packet(i))
            .unwrap()
            .got_frame
        {
            outputs.push(frame.pts.unwrap());
        } else {
            suppressed += 1;
        }
    }
    outputs.extend(drain(&mut pipeline, &mut ctx).iter().map(|f| f.pts.unwrap()));

    assert_eq!(suppressed, 1, "priming should re-engage after flush");
    assert_eq!(outputs, vec![100, 101, 102]);
    pipeline.shutdown(&mut ctx);
}

/// Calls `get_buffer` after declaring setup complete, which the pipeline
/// must reject.
struct LateAllocCodec;

impl Codec for LateAllocCodec {
    type Decoder = ();
    type Shared = ();

    fn caps(&self) -> CodecCaps {
        CodecCaps {
            update_thread_context: true,
            ..CodecCaps::default()
        }
    }

    fn open(&self, _ctx: &CodecContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(
        &self,
        _decoder: &mut (),
        cx: &mut DecodeScope<'_, Self>,
        frame: &mut Frame,
        packet: &Packet,
    ) -> anyhow::Result<bool> {
        if packet.is_empty() {
            return Ok(false);
        }
        cx.finish_setup(());
        match cx.get_buffer(frame) {
            Err(Error::InvalidCallOrder(op)) => bail!("{op} rejected as expected"),
            other => bail!("late get_buffer was not rejected: {other:?}"),
        }
    }
}

#[test]
fn test_get_buffer_after_setup_is_rejected() {
    crate::init();
    let mut ctx = context(2);
    let mut pipeline = FramePipeline::new(LateAllocCodec, &mut ctx).unwrap();

    let mut rejected = 0;
    for i in 0..3 {
        let mut frame = Frame::default();
        match pipeline.decode(&mut ctx, &mut frame, &packet(i)) {
            Err(Error::Decode(e)) => {
                assert!(e.to_string().contains("rejected as expected"));
                rejected += 1;
            }
            Ok(_) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(rejected > 0);
    pipeline.shutdown(&mut ctx);
}

#[test]
fn test_threading_disabled_for_single_thread() {
    let mut ctx = context(1);
    match FramePipeline::new(CounterCodec, &mut ctx) {
        Err(Error::ThreadingDisabled) => {}
        _ => panic!("thread_count = 1 must disable frame threading"),
    }
    assert!(!ctx.frame_threading);
}

#[test]
fn test_init_failure_unwinds_partial_pipeline() {
    struct FailingCodec {
        opened: Arc<AtomicI32>,
        closed: Arc<AtomicI32>,
    }
    impl Codec for FailingCodec {
        type Decoder = ();
        type Shared = ();
        fn caps(&self) -> CodecCaps {
            CodecCaps::default()
        }
        fn open(&self, _ctx: &CodecContext) -> anyhow::Result<()> {
            if self.opened.fetch_add(1, SeqCst) == 2 {
                bail!("third instance fails");
            }
            Ok(())
        }
        fn decode(
            &self,
            _decoder: &mut (),
            _cx: &mut DecodeScope<'_, Self>,
            _frame: &mut Frame,
            _packet: &Packet,
        ) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn close(&self, _decoder: &mut ()) {
            self.closed.fetch_add(1, SeqCst);
        }
    }

    crate::init();
    let opened = Arc::new(AtomicI32::new(0));
    let closed = Arc::new(AtomicI32::new(0));
    let codec = FailingCodec {
        opened: opened.clone(),
        closed: closed.clone(),
    };
    let mut ctx = context(4);
    match FramePipeline::new(codec, &mut ctx) {
        Err(Error::Init(_)) => {}
        _ => panic!("init should fail on the third worker"),
    }
    assert_eq!(opened.load(SeqCst), 3);
    // the two successfully opened instances were closed during unwind
    assert_eq!(closed.load(SeqCst), 2);
}
