//! Thin wrappers over the Linux futex syscall.
//!
//! Three operations are exposed:
//!
//! - [`futex_wait_multiple`]: block until any of several shared words no
//!   longer holds its expected value (operation code
//!   [`FUTEX_WAIT_MULTIPLE`]). Called with no words and a zero timeout it
//!   returns immediately when the kernel supports the operation, which is
//!   how [`wait_multiple_supported`] checks for it.
//! - [`futex_wait`] / [`futex_wake`]: the classic single-word operations.
//!
//! None of these use `FUTEX_PRIVATE_FLAG`: the words live in pages shared
//! between processes, so the kernel must key waiters by physical page.
//!
//! The calls are stateless. The only blocking happens inside the kernel and
//! suspends just the calling thread; cancellation is by timeout or signal.

use std::marker::PhantomData;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use fsync_error::{FsyncError, Result};
use nix::errno::Errno;
use tracing::{trace, warn};

/// Operation code for waiting on several futex words at once.
pub const FUTEX_WAIT_MULTIPLE: libc::c_int = 13;

const FUTEX_WAIT: libc::c_int = 0;
const FUTEX_WAKE: libc::c_int = 1;

// ---------------------------------------------------------------------------
// FutexWaitBlock
// ---------------------------------------------------------------------------

/// One `(address, expected value)` pair for [`futex_wait_multiple`].
///
/// The layout is fixed by the kernel interface: a pointer, 32-bit padding on
/// 32-bit targets, then the expected value, packed to 4-byte alignment.
#[derive(Clone, Copy)]
#[repr(C, packed(4))]
pub struct FutexWaitBlock<'a> {
    addr: *const u32,
    #[cfg(target_pointer_width = "32")]
    pad: i32,
    val: u32,
    _word: PhantomData<&'a AtomicU32>,
}

impl<'a> FutexWaitBlock<'a> {
    /// Wait on `word` while it still equals `expected`.
    #[must_use]
    pub fn new(word: &'a AtomicU32, expected: u32) -> Self {
        Self {
            addr: word.as_ptr().cast_const(),
            #[cfg(target_pointer_width = "32")]
            pad: 0,
            val: expected,
            _word: PhantomData,
        }
    }

    #[must_use]
    pub fn expected(&self) -> u32 {
        self.val
    }
}

impl std::fmt::Debug for FutexWaitBlock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addr = self.addr;
        let val = self.val;
        f.debug_struct("FutexWaitBlock")
            .field("addr", &addr)
            .field("val", &val)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WaitOutcome
// ---------------------------------------------------------------------------

/// How a futex wait ended, when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A wake was delivered. For [`futex_wait_multiple`] `index` names the
    /// pair that was woken; for [`futex_wait`] it is always 0.
    Woken { index: usize },
    /// A word did not hold its expected value when the call started
    /// (`EAGAIN`).
    ValueMismatch,
    /// The timeout elapsed (`ETIMEDOUT`).
    TimedOut,
    /// A signal interrupted the wait (`EINTR`).
    Interrupted,
}

fn timespec_from(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::try_from(timeout.subsec_nanos()).unwrap_or(0),
    }
}

fn classify(ret: libc::c_long, op: libc::c_int) -> Result<WaitOutcome> {
    if ret >= 0 {
        return Ok(WaitOutcome::Woken {
            index: usize::try_from(ret).unwrap_or(0),
        });
    }
    match Errno::last() {
        Errno::EAGAIN => Ok(WaitOutcome::ValueMismatch),
        Errno::ETIMEDOUT => Ok(WaitOutcome::TimedOut),
        Errno::EINTR => Ok(WaitOutcome::Interrupted),
        Errno::ENOSYS => Err(FsyncError::FutexNotImplemented { op }),
        errno => Err(FsyncError::from_errno(errno as i32)),
    }
}

// ---------------------------------------------------------------------------
// Syscall wrappers
// ---------------------------------------------------------------------------

/// Block until any word in `blocks` no longer equals its expected value, the
/// relative `timeout` elapses, or a signal arrives. `None` waits forever.
///
/// # Errors
///
/// Returns [`FsyncError::FutexNotImplemented`] if the kernel lacks the
/// operation, or [`FsyncError::Io`] for any other kernel error (for example
/// `EFAULT` or `EINVAL`).
pub fn futex_wait_multiple(
    blocks: &[FutexWaitBlock<'_>],
    timeout: Option<Duration>,
) -> Result<WaitOutcome> {
    let ts = timeout.map(timespec_from);
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| std::ptr::from_ref(t));
    let list = if blocks.is_empty() {
        std::ptr::null()
    } else {
        blocks.as_ptr()
    };
    let count = libc::c_int::try_from(blocks.len())
        .map_err(|_| FsyncError::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;

    trace!(
        target: "fsync_futex",
        count,
        timeout_ns = timeout.map(|t| t.as_nanos()),
        "futex wait multiple"
    );
    // SAFETY: `list` is null or points at `count` live wait blocks borrowed
    // for the duration of the call; `ts_ptr` is null or points at `ts`, which
    // outlives the call. The kernel only reads through both pointers.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            list,
            FUTEX_WAIT_MULTIPLE,
            count,
            ts_ptr,
            0_usize,
            0_u32,
        )
    };
    classify(ret, FUTEX_WAIT_MULTIPLE)
}

/// Wait on a single shared word while it equals `expected`.
///
/// # Errors
///
/// See [`futex_wait_multiple`].
pub fn futex_wait(
    word: &AtomicU32,
    expected: u32,
    timeout: Option<Duration>,
) -> Result<WaitOutcome> {
    let ts = timeout.map(timespec_from);
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| std::ptr::from_ref(t));
    // SAFETY: `word` is a live atomic for the duration of the call and `ts_ptr`
    // is null or points at `ts`.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_WAIT,
            expected,
            ts_ptr,
            0_usize,
            0_u32,
        )
    };
    classify(ret, FUTEX_WAIT).map(|outcome| match outcome {
        WaitOutcome::Woken { .. } => WaitOutcome::Woken { index: 0 },
        other => other,
    })
}

/// Wake up to `count` threads waiting on `word`, in any process. Returns
/// the number of waiters woken.
///
/// # Errors
///
/// Returns [`FsyncError::Io`] if the kernel rejects the call.
pub fn futex_wake(word: &AtomicU32, count: u32) -> Result<usize> {
    let count = libc::c_int::try_from(count).unwrap_or(libc::c_int::MAX);
    // SAFETY: `word` is a live atomic; FUTEX_WAKE does not dereference the
    // remaining arguments.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            0_usize,
            0_u32,
        )
    };
    if ret < 0 {
        return Err(FsyncError::from_errno(Errno::last_raw()));
    }
    Ok(usize::try_from(ret).unwrap_or(0))
}

/// Whether the kernel implements [`FUTEX_WAIT_MULTIPLE`].
///
/// Issues a wait on zero words with a zero timeout. A supporting kernel
/// returns at once; only "not implemented" counts as unsupported.
///
/// Any other error still reports the operation as available. Kernels from
/// 6.7 on reuse opcode 13 for `FUTEX_LOCK_PI2`, so real waits there fail
/// with `ESRCH`; that case is logged at warn level.
#[must_use]
pub fn wait_multiple_supported() -> bool {
    match futex_wait_multiple(&[], Some(Duration::ZERO)) {
        Ok(outcome) => {
            trace!(target: "fsync_futex", ?outcome, "FUTEX_WAIT_MULTIPLE available");
            true
        }
        Err(FsyncError::FutexNotImplemented { op }) => {
            trace!(target: "fsync_futex", op, "FUTEX_WAIT_MULTIPLE not implemented");
            false
        }
        Err(err) => {
            warn!(
                target: "fsync_futex",
                error = %err,
                "empty FUTEX_WAIT_MULTIPLE failed without ENOSYS; multi-word waits may not work"
            );
            true
        }
    }
}
