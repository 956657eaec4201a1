use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering},
    Arc, Condvar, Mutex,
};

use tracing::debug;

use crate::{
    buffer::FrameParams,
    context::PixelFormat,
    frame::Frame,
};

/// Where a worker is in its current round. Defines who may touch which
/// fields of the worker's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    /// Awaiting a packet; the coordinator may take the slot.
    Idle = 0,
    /// Decoding, setup not yet complete.
    SettingUp = 1,
    /// Parked in `get_buffer`, waiting for the caller to run the allocator.
    AwaitingBuffer = 2,
    /// Parked in `get_format`, waiting for the caller to negotiate.
    AwaitingFormat = 3,
    /// Setup complete; the next submission may copy state.
    SetupDone = 4,
}

impl Phase {
    fn from_u8(x: u8) -> Phase {
        match x {
            0 => Phase::Idle,
            1 => Phase::SettingUp,
            2 => Phase::AwaitingBuffer,
            3 => Phase::AwaitingFormat,
            4 => Phase::SetupDone,
            _ => unreachable!("invalid phase {x}"),
        }
    }
}

/// A callback reflected from a worker to the caller thread.
pub(crate) enum ReflectedCall {
    Buffer { params: FrameParams, frame: Frame },
    Format { params: FrameParams, candidates: Vec<PixelFormat> },
}

pub(crate) enum ReflectedReply {
    Buffer {
        frame: Frame,
        result: anyhow::Result<()>,
    },
    Format {
        format: PixelFormat,
    },
}

/// Request/reply slots for callback reflection, guarded by the progress lock.
#[derive(Default)]
pub(crate) struct Mailbox {
    pub call: Option<ReflectedCall>,
    pub reply: Option<ReflectedReply>,
}

/// The notification side of a worker, shared with every frame it produces.
///
/// `progress_cond` is a multiplexed channel: progress reports, setup-done and
/// reflected-callback transitions all signal it, so every waiter rechecks its
/// own condition after each wakeup.
pub(crate) struct Monitor {
    /// The progress mutex; also carries the reflection mailbox.
    pub lock: Mutex<Mailbox>,
    pub progress_cond: Condvar,
    /// Signalled once per round, when the worker returns to `Idle`.
    pub output_cond: Condvar,
    phase: AtomicU8,
    pub debug: AtomicBool,
}

impl Monitor {
    pub fn new(debug: bool) -> Monitor {
        Monitor {
            lock: Mutex::new(Mailbox::default()),
            progress_cond: Condvar::new(),
            output_cond: Condvar::new(),
            phase: AtomicU8::new(Phase::Idle as u8),
            debug: AtomicBool::new(debug),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// End the worker's round: back to `Idle`, wake frame-local progress
    /// waiters and the coordinator if it is waiting to harvest.
    pub fn finish_round(&self) {
        let _mailbox = self.lock.lock().unwrap();
        self.set_phase(Phase::Idle);
        self.progress_cond.notify_all();
        self.output_cond.notify_one();
    }
}

/// Per-frame row progress: two counters (interlaced content uses both fields,
/// progressive content uses index 0) plus a back-reference to the producing
/// worker's condvar so waiters know whom to listen to.
pub struct Progress {
    rows: [AtomicI32; 2],
    owner: [Arc<Monitor>; 2],
}

impl Progress {
    pub(crate) fn new(owner: Arc<Monitor>) -> Progress {
        Progress {
            rows: [AtomicI32::new(-1), AtomicI32::new(-1)],
            owner: [owner.clone(), owner],
        }
    }

    pub fn current(&self, field: usize) -> i32 {
        self.rows[field].load(Ordering::Acquire)
    }

    /// Store `n` for `field` and wake waiters. Values never decrease; a
    /// report that is not an advance returns without taking the lock.
    pub fn report(&self, n: i32, field: usize) {
        if self.rows[field].load(Ordering::Relaxed) >= n {
            return;
        }

        let owner = &self.owner[field];
        if owner.debug.load(Ordering::Relaxed) {
            debug!(n, field, "reporting progress");
        }

        let _mailbox = owner.lock.lock().unwrap();
        self.rows[field].store(n, Ordering::Release);
        owner.progress_cond.notify_all();
    }

    /// Block until `field` has reached at least `n`. A waiter that returns
    /// observes every write the producer made before the report that
    /// satisfied it.
    pub fn wait(&self, n: i32, field: usize) {
        if self.rows[field].load(Ordering::Acquire) >= n {
            return;
        }

        let owner = &self.owner[field];
        if owner.debug.load(Ordering::Relaxed) {
            debug!(n, field, "awaiting progress");
        }

        let mut mailbox = owner.lock.lock().unwrap();
        while self.rows[field].load(Ordering::Relaxed) < n {
            mailbox = owner.progress_cond.wait(mailbox).unwrap();
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("rows", &self.rows)
            .finish()
    }
}
