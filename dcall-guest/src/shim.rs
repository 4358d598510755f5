//! Guest interception shim
//!
//! Installed once per process by swapping the process-wide generic-dispatch
//! hook slot. The previous hook is retained as the fallback. Every outgoing
//! syscall is classified and routed through a tagged dispatch table: `Fast`
//! transfers control directly into the fast-entry routine, `Generic`
//! forwards to the retained fallback unchanged.
//!
//! Per-thread state (the registration flag and the slow-only marker) is the
//! model of the original's thread-local storage: a read-mostly map keyed by
//! thread id, with atomic fields so steady-state dispatch takes only the
//! map's read lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dcall_api::nr::{SYS_DIRECT_ENTRY, SYS_REGISTER_CONTROL_PAGE, SYSCALL_ARGS, SyscallArgs};
use dcall_host::entry::FastEntry;
use dcall_host::sched::Thread;
use spin::RwLock;

use crate::policy::{Path, classify};

/// A process-wide syscall entry point: the generic dispatcher, or the shim
/// once installed.
pub trait SyscallHook: Send + Sync {
    /// Dispatches one raw syscall for `thread`.
    fn call(&self, thread: &Thread, args: &SyscallArgs) -> isize;
}

/// The process-wide generic-dispatch hook slot.
pub struct HookSlot {
    hook: RwLock<Arc<dyn SyscallHook>>,
}

impl HookSlot {
    /// Creates a slot holding the process's initial (generic) entry.
    pub fn new(hook: Arc<dyn SyscallHook>) -> Self {
        Self {
            hook: RwLock::new(hook),
        }
    }

    /// The currently installed hook.
    pub fn current(&self) -> Arc<dyn SyscallHook> {
        Arc::clone(&self.hook.read())
    }

    fn replace(&self, hook: Arc<dyn SyscallHook>) -> Arc<dyn SyscallHook> {
        core::mem::replace(&mut *self.hook.write(), hook)
    }

    /// Issues one syscall through whatever hook is installed.
    pub fn call(&self, thread: &Thread, args: &SyscallArgs) -> isize {
        self.current().call(thread, args)
    }
}

/// Shim dispatch statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShimStats {
    /// Calls routed through the fast entry
    pub fast_calls: u64,
    /// Calls forwarded to the fallback
    pub slow_calls: u64,
    /// Registration syscalls issued by the shim
    pub registrations: u64,
}

#[derive(Default)]
struct ThreadState {
    /// One registration attempt per thread lifetime.
    initialized: AtomicBool,
    /// Set when registration reported the processor has no fast path.
    slow_only: AtomicBool,
}

enum DispatchTarget<'a> {
    Fast(&'a FastEntry),
    Generic(&'a dyn SyscallHook),
}

/// The interception shim.
pub struct Shim {
    fallback: Arc<dyn SyscallHook>,
    fast: Arc<FastEntry>,
    /// Fast-entry address from the query syscall; 0 = not yet fetched.
    direct_entry: AtomicU64,
    tls: RwLock<BTreeMap<u64, Arc<ThreadState>>>,
    fast_calls: AtomicU64,
    slow_calls: AtomicU64,
    registrations: AtomicU64,
}

impl Shim {
    /// Installs the shim into `slot`: the current hook is read and retained
    /// as the fallback, then the shim replaces it. Returns the installed
    /// shim for inspection.
    pub fn install(slot: &HookSlot, fast: Arc<FastEntry>) -> Arc<Shim> {
        let shim = Arc::new(Shim {
            fallback: slot.current(),
            fast,
            direct_entry: AtomicU64::new(0),
            tls: RwLock::new(BTreeMap::new()),
            fast_calls: AtomicU64::new(0),
            slow_calls: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
        });
        slot.replace(Arc::clone(&shim) as Arc<dyn SyscallHook>);
        #[cfg(feature = "log")]
        log::info!("syscall interception shim installed");
        shim
    }

    /// Current dispatch counters.
    pub fn stats(&self) -> ShimStats {
        ShimStats {
            fast_calls: self.fast_calls.load(Ordering::Relaxed),
            slow_calls: self.slow_calls.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
        }
    }

    fn thread_state(&self, thread: &Thread) -> Arc<ThreadState> {
        if let Some(state) = self.tls.read().get(&thread.id()) {
            return Arc::clone(state);
        }
        let mut tls = self.tls.write();
        Arc::clone(tls.entry(thread.id()).or_default())
    }

    /// One registration attempt, through the fallback path. Reuses an
    /// address the thread already registered explicitly; otherwise maps a
    /// fresh page for the control page overlay.
    fn register(&self, thread: &Thread, state: &ThreadState) {
        let addr = match thread.registration() {
            Some(registration) => registration.addr,
            None => match thread.mm().map_anon_page() {
                Ok(addr) => addr,
                Err(_err) => {
                    #[cfg(feature = "log")]
                    log::warn!(
                        "thread {}: no page for control page overlay: {}",
                        thread.id(),
                        _err
                    );
                    state.slow_only.store(true, Ordering::Release);
                    return;
                }
            },
        };

        let mut args = [0usize; SYSCALL_ARGS];
        args[0] = SYS_REGISTER_CONTROL_PAGE as usize;
        args[1] = addr.as_usize();
        self.registrations.fetch_add(1, Ordering::Relaxed);
        let ret = self.fallback.call(thread, &args);
        if ret != 0 {
            #[cfg(feature = "log")]
            log::warn!(
                "thread {}: control page registration failed ({}), pinning to slow path",
                thread.id(),
                ret
            );
            state.slow_only.store(true, Ordering::Release);
        }
    }

    /// Fast-entry address, queried through the fallback once per process.
    fn direct_entry(&self, thread: &Thread) -> u64 {
        let cached = self.direct_entry.load(Ordering::Acquire);
        if cached != 0 {
            return cached;
        }
        let mut args = [0usize; SYSCALL_ARGS];
        args[0] = SYS_DIRECT_ENTRY as usize;
        let addr = self.fallback.call(thread, &args) as u64;
        self.direct_entry.store(addr, Ordering::Release);
        addr
    }

    fn select(&self, thread: &Thread, nr: u32) -> DispatchTarget<'_> {
        if classify(nr) == Path::Slow {
            return DispatchTarget::Generic(&*self.fallback);
        }

        let state = self.thread_state(thread);
        if !state.initialized.load(Ordering::Acquire) {
            state.initialized.store(true, Ordering::Release);
            self.register(thread, &state);
        }
        if state.slow_only.load(Ordering::Acquire) {
            return DispatchTarget::Generic(&*self.fallback);
        }

        let queried = self.direct_entry(thread);
        if queried != self.fast.address() {
            // A guest jumping to an address the host never stamped cannot
            // be allowed to continue.
            panic!(
                "fast-entry address mismatch: queried {:#x}, host {:#x}",
                queried,
                self.fast.address()
            );
        }
        DispatchTarget::Fast(&*self.fast)
    }
}

impl SyscallHook for Shim {
    fn call(&self, thread: &Thread, args: &SyscallArgs) -> isize {
        let nr = args[0] as u32;
        match self.select(thread, nr) {
            DispatchTarget::Fast(fast) => {
                self.fast_calls.fetch_add(1, Ordering::Relaxed);
                fast.enter(thread, args)
            }
            DispatchTarget::Generic(generic) => {
                self.slow_calls.fetch_add(1, Ordering::Relaxed);
                generic.call(thread, args)
            }
        }
    }
}

/// Fallback hook over the host's generic dispatcher.
pub struct GenericEntryHook {
    dispatcher: Arc<dcall_host::GenericDispatcher>,
}

impl GenericEntryHook {
    /// Wraps the generic dispatcher as the process's initial hook.
    pub fn new(dispatcher: Arc<dcall_host::GenericDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl SyscallHook for GenericEntryHook {
    fn call(&self, thread: &Thread, args: &SyscallArgs) -> isize {
        self.dispatcher.dispatch(thread, args)
    }
}
