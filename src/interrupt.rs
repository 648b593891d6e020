//! SIGINT handling for a profiling session.
//!
//! Delivery of SIGINT only raises an [`InterruptFlag`]. Every phase polls the
//! flag before it commits to work it cannot cancel (forking the recorder,
//! opening the report pipe, reading the next report line). A blocking wait
//! that is already in flight is never preempted.
//!
//! The telemetry agent may have installed its own SIGINT handler before us.
//! On the first delivery that handler is invoked as well, with the same
//! arguments we received; there is no ordering guarantee with respect to its
//! own re-entrancy.

use std::io;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::RelayResult;

/// Shared, set-once cancellation bit.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    raised: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Returns `true` only for the call that set it first.
    pub fn raise(&self) -> bool {
        raise_once(&self.raised)
    }

    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

fn raise_once(raised: &AtomicBool) -> bool {
    !raised.swap(true, Ordering::SeqCst)
}

/// Bit of the installed coordinator's flag; null while none is installed.
static ACTIVE_FLAG: AtomicPtr<AtomicBool> = AtomicPtr::new(ptr::null_mut());

/// Handler found in place at install time, or `SIG_DFL` when there is
/// nothing to call.
static PREVIOUS_HANDLER: AtomicUsize = AtomicUsize::new(libc::SIG_DFL);

/// Whether `PREVIOUS_HANDLER` takes the three-argument `SA_SIGINFO` form.
static PREVIOUS_SIGINFO: AtomicBool = AtomicBool::new(false);

type PlainHandler = extern "C" fn(libc::c_int);
type InfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Owns our SIGINT disposition; the previous one is restored on drop.
pub struct InterruptCoordinator {
    flag: InterruptFlag,
    previous: libc::sigaction,
    chained: bool,
}

impl InterruptCoordinator {
    pub fn install() -> RelayResult<Self> {
        let flag = InterruptFlag::new();

        // SAFETY: sigaction is plain old data; all-zero is a valid value.
        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        // SAFETY: a null `act` only queries the current disposition into `previous`.
        if unsafe { libc::sigaction(libc::SIGINT, ptr::null(), &mut previous) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let chained = is_user_handler(previous.sa_sigaction);
        PREVIOUS_SIGINFO.store(previous.sa_flags & libc::SA_SIGINFO != 0, Ordering::SeqCst);
        PREVIOUS_HANDLER.store(
            if chained { previous.sa_sigaction } else { libc::SIG_DFL },
            Ordering::SeqCst,
        );
        // The pointee lives as long as `flag`, which this coordinator owns.
        ACTIVE_FLAG.store(Arc::as_ptr(&flag.raised).cast_mut(), Ordering::SeqCst);

        // SAFETY: as above.
        let mut ours: libc::sigaction = unsafe { std::mem::zeroed() };
        ours.sa_sigaction = on_sigint as InfoHandler as libc::sighandler_t;
        ours.sa_flags = libc::SA_SIGINFO;
        // SAFETY: `ours.sa_mask` is a valid, owned sigset_t.
        unsafe { libc::sigemptyset(&mut ours.sa_mask) };
        // SAFETY: `on_sigint` has the SA_SIGINFO signature and only touches
        // atomics and, at most once, the previously installed handler.
        if unsafe { libc::sigaction(libc::SIGINT, &ours, ptr::null_mut()) } != 0 {
            let err = io::Error::last_os_error();
            forget_previous();
            return Err(err.into());
        }

        tracing::debug!(chained, "installed SIGINT handler");
        Ok(Self {
            flag,
            previous,
            chained,
        })
    }

    pub fn flag(&self) -> InterruptFlag {
        self.flag.clone()
    }

    /// Whether a pre-existing user handler is notified on the first SIGINT.
    pub fn chains_previous(&self) -> bool {
        self.chained
    }
}

impl Drop for InterruptCoordinator {
    fn drop(&mut self) {
        // SAFETY: `previous` is the disposition sigaction reported at install time.
        if unsafe { libc::sigaction(libc::SIGINT, &self.previous, ptr::null_mut()) } != 0 {
            tracing::warn!(
                "failed to restore previous SIGINT handler: {}",
                io::Error::last_os_error()
            );
        }
        forget_previous();
    }
}

fn forget_previous() {
    ACTIVE_FLAG.store(ptr::null_mut(), Ordering::SeqCst);
    PREVIOUS_HANDLER.store(libc::SIG_DFL, Ordering::SeqCst);
    PREVIOUS_SIGINFO.store(false, Ordering::SeqCst);
}

fn is_user_handler(handler: libc::sighandler_t) -> bool {
    handler != libc::SIG_DFL && handler != libc::SIG_IGN && handler != libc::SIG_ERR
}

extern "C" fn on_sigint(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let active = ACTIVE_FLAG.load(Ordering::SeqCst);
    if active.is_null() {
        return;
    }
    // SAFETY: non-null only while the owning coordinator, and so its flag, is alive.
    if !raise_once(unsafe { &*active }) {
        return;
    }
    let previous = PREVIOUS_HANDLER.load(Ordering::SeqCst);
    if !is_user_handler(previous) {
        return;
    }
    if PREVIOUS_SIGINFO.load(Ordering::SeqCst) {
        // SAFETY: stored with SA_SIGINFO set, so it takes three arguments.
        let handler: InfoHandler = unsafe { std::mem::transmute(previous) };
        handler(sig, info, ctx);
    } else {
        // SAFETY: stored without SA_SIGINFO, so it is a one-argument handler.
        let handler: PlainHandler = unsafe { std::mem::transmute(previous) };
        handler(sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static PLAIN_CALLS: AtomicU32 = AtomicU32::new(0);
    static INFO_CALLS: AtomicU32 = AtomicU32::new(0);

    extern "C" fn plain_agent_handler(_: libc::c_int) {
        PLAIN_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn info_agent_handler(
        _: libc::c_int,
        info: *mut libc::siginfo_t,
        _: *mut libc::c_void,
    ) {
        if !info.is_null() {
            INFO_CALLS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn install_agent(handler: libc::sighandler_t, flags: libc::c_int) -> libc::sigaction {
        // SAFETY: zeroed sigaction values are filled in before use; the
        // handlers only bump atomic counters.
        unsafe {
            let mut act: libc::sigaction = std::mem::zeroed();
            act.sa_sigaction = handler;
            act.sa_flags = flags;
            libc::sigemptyset(&mut act.sa_mask);
            let mut old: libc::sigaction = std::mem::zeroed();
            libc::sigaction(libc::SIGINT, &act, &mut old);
            old
        }
    }

    fn current_handler() -> libc::sighandler_t {
        // SAFETY: query only.
        let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe { libc::sigaction(libc::SIGINT, ptr::null(), &mut current) };
        current.sa_sigaction
    }

    /// Installs over `handler`, raises SIGINT twice and checks that `calls`
    /// moved exactly once and that `handler` is back after drop.
    fn chain_once(handler: libc::sighandler_t, flags: libc::c_int, calls: &AtomicU32) {
        let saved = install_agent(handler, flags);

        let coordinator = InterruptCoordinator::install().expect("install");
        assert!(coordinator.chains_previous());
        let flag = coordinator.flag();
        assert!(!flag.is_set());

        // SAFETY: our handler is installed, so SIGINT only flips the flag.
        unsafe { libc::raise(libc::SIGINT) };
        assert!(flag.is_set());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        unsafe { libc::raise(libc::SIGINT) };
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(coordinator);
        assert_eq!(current_handler(), handler);

        // SAFETY: puts back whatever the test harness had.
        unsafe { libc::sigaction(libc::SIGINT, &saved, ptr::null_mut()) };
    }

    #[test]
    fn flag_reports_first_raise_only() {
        let flag = InterruptFlag::new();
        let seen_by_phase = flag.clone();
        assert!(!seen_by_phase.is_set());
        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(!seen_by_phase.raise());
        assert!(seen_by_phase.is_set());
    }

    // One test, so no two coordinators ever own SIGINT at the same time.
    #[test]
    fn sigint_raises_flag_and_notifies_previous_handler_once() {
        chain_once(
            plain_agent_handler as PlainHandler as libc::sighandler_t,
            0,
            &PLAIN_CALLS,
        );
        chain_once(
            info_agent_handler as InfoHandler as libc::sighandler_t,
            libc::SA_SIGINFO,
            &INFO_CALLS,
        );
        assert_eq!(PLAIN_CALLS.load(Ordering::SeqCst), 1);
    }
}
