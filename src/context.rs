use std::{any::Any, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::buffer::Callbacks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PixelFormat {
    #[default]
    None,
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
    Rgb24,
    /// An opaque hardware surface; pixels live behind `hw_frames_ctx`.
    HwSurface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Default for Rational {
    fn default() -> Rational {
        Rational { num: 0, den: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ColorRange {
    #[default]
    Unspecified,
    Limited,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ColorSpace {
    #[default]
    Unspecified,
    Bt601,
    Bt709,
}

/// Decode-skip hint, refreshed from the user context on every submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SkipMode {
    #[default]
    Default,
    NonRef,
    NonKey,
    All,
}

/// Static description of an acceleration driver. The two capability bits
/// decide how much serialisation the pipeline imposes on its callbacks.
#[derive(Debug)]
pub struct HwAccelDesc {
    pub name: &'static str,
    /// Callbacks may run on several workers at once. When false the pipeline
    /// holds the hwaccel mutex across the whole decode call.
    pub mt_safe: bool,
    /// Setup may overlap another worker's setup. When false the async lock
    /// serialises the whole setup window.
    pub async_safe: bool,
}

/// An acceleration driver bound to a decoder context, together with its
/// driver-owned state. Cloning shares the state; ownership of a non-MT-safe
/// binding travels worker to worker through the coordinator's stash.
#[derive(Clone)]
pub struct HwAccelState {
    pub desc: Arc<HwAccelDesc>,
    pub context: Arc<dyn Any + Send + Sync>,
    pub priv_data: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for HwAccelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwAccelState")
            .field("name", &self.desc.name)
            .field("mt_safe", &self.desc.mt_safe)
            .field("async_safe", &self.desc.async_safe)
            .finish()
    }
}

/// The decoder context. The caller owns the canonical one; each worker owns a
/// private copy. User-facing fields flow caller -> worker on every
/// submission, derived fields flow worker -> worker at setup hand-off and
/// worker -> caller at harvest.
#[derive(Clone)]
pub struct CodecContext {
    // configuration
    /// 0 = auto (cores + 1, capped), 1 = threading disabled, else fixed.
    pub thread_count: usize,
    /// Set by the pipeline while frame threading is active.
    pub frame_threading: bool,
    /// Per-event diagnostics without locking.
    pub debug_threads: bool,
    pub callbacks: Callbacks,

    // user-facing, refreshed on every submission
    pub flags: u32,
    pub skip_frame: SkipMode,
    pub slice_offsets: Vec<usize>,
    pub frame_number: u64,
    pub reordered_opaque: i64,

    // derived by the back-end during setup
    pub width: u32,
    pub height: u32,
    pub coded_width: u32,
    pub coded_height: u32,
    pub pix_fmt: PixelFormat,
    pub sw_pix_fmt: PixelFormat,
    pub time_base: Rational,
    pub framerate: Rational,
    pub sample_aspect_ratio: Rational,
    pub color_range: ColorRange,
    pub colorspace: ColorSpace,
    pub has_b_frames: u32,
    pub profile: i32,
    pub level: i32,
    /// Reorder latency the caller should budget for; thread_count - 1 while
    /// frame threading is active.
    pub delay: usize,
    pub hw_frames_ctx: Option<Arc<dyn Any + Send + Sync>>,
    pub hwaccel: Option<HwAccelState>,
}

impl Default for CodecContext {
    fn default() -> CodecContext {
        CodecContext {
            thread_count: 0,
            frame_threading: false,
            debug_threads: false,
            callbacks: Callbacks::default(),
            flags: 0,
            skip_frame: SkipMode::default(),
            slice_offsets: Vec::new(),
            frame_number: 0,
            reordered_opaque: 0,
            width: 0,
            height: 0,
            coded_width: 0,
            coded_height: 0,
            pix_fmt: PixelFormat::default(),
            sw_pix_fmt: PixelFormat::default(),
            time_base: Rational::default(),
            framerate: Rational::default(),
            sample_aspect_ratio: Rational::default(),
            color_range: ColorRange::default(),
            colorspace: ColorSpace::default(),
            has_b_frames: 0,
            profile: 0,
            level: 0,
            delay: 0,
            hw_frames_ctx: None,
            hwaccel: None,
        }
    }
}

impl std::fmt::Debug for CodecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecContext")
            .field("thread_count", &self.thread_count)
            .field("frame_threading", &self.frame_threading)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pix_fmt", &self.pix_fmt)
            .field("hwaccel", &self.hwaccel)
            .finish()
    }
}

impl CodecContext {
    /// Refresh the fields the user may change between packets.
    pub(crate) fn update_from_user(&mut self, user: &CodecContext) {
        self.callbacks = user.callbacks.clone();
        self.debug_threads = user.debug_threads;
        self.flags = user.flags;
        self.skip_frame = user.skip_frame;
        self.frame_number = user.frame_number;
        self.reordered_opaque = user.reordered_opaque;
        self.slice_offsets.clear();
        self.slice_offsets.extend_from_slice(&user.slice_offsets);
    }

    pub(crate) fn derived(&self) -> DerivedState {
        DerivedState {
            width: self.width,
            height: self.height,
            coded_width: self.coded_width,
            coded_height: self.coded_height,
            pix_fmt: self.pix_fmt,
            sw_pix_fmt: self.sw_pix_fmt,
            time_base: self.time_base,
            framerate: self.framerate,
            sample_aspect_ratio: self.sample_aspect_ratio,
            color_range: self.color_range,
            colorspace: self.colorspace,
            has_b_frames: self.has_b_frames,
            profile: self.profile,
            level: self.level,
            hw_frames_ctx: self.hw_frames_ctx.clone(),
            // only an MT-safe binding propagates by sharing; a serialised one
            // travels through the stash instead
            hwaccel: self.hwaccel.clone().filter(|hw| hw.desc.mt_safe),
        }
    }

    pub(crate) fn apply_derived(&mut self, derived: &DerivedState) {
        self.width = derived.width;
        self.height = derived.height;
        self.coded_width = derived.coded_width;
        self.coded_height = derived.coded_height;
        self.pix_fmt = derived.pix_fmt;
        self.sw_pix_fmt = derived.sw_pix_fmt;
        self.time_base = derived.time_base;
        self.framerate = derived.framerate;
        self.sample_aspect_ratio = derived.sample_aspect_ratio;
        self.color_range = derived.color_range;
        self.colorspace = derived.colorspace;
        self.has_b_frames = derived.has_b_frames;
        self.profile = derived.profile;
        self.level = derived.level;
        self.hw_frames_ctx = derived.hw_frames_ctx.clone();
        if let Some(hwaccel) = &derived.hwaccel {
            self.hwaccel = Some(hwaccel.clone());
        }
    }
}

/// Snapshot of the derived context fields, published at setup-complete and
/// applied to the next worker in line (or to the user context at harvest).
#[derive(Clone, Default)]
pub(crate) struct DerivedState {
    pub width: u32,
    pub height: u32,
    pub coded_width: u32,
    pub coded_height: u32,
    pub pix_fmt: PixelFormat,
    pub sw_pix_fmt: PixelFormat,
    pub time_base: Rational,
    pub framerate: Rational,
    pub sample_aspect_ratio: Rational,
    pub color_range: ColorRange,
    pub colorspace: ColorSpace,
    pub has_b_frames: u32,
    pub profile: i32,
    pub level: i32,
    pub hw_frames_ctx: Option<Arc<dyn Any + Send + Sync>>,
    pub hwaccel: Option<HwAccelState>,
}
