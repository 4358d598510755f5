//! Processor and thread model
//!
//! The bridge is per-processor shared state, so the host carries a minimal
//! scheduling model: which processor a thread is currently executing on,
//! migration between processors, and the scoped guard that pins a thread for
//! the remap critical section. General scheduling is out of scope.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dcall_api::{CpuId, Error, Result, VirtAddr};
use spin::Mutex;

use crate::control_page::RFlags;
use crate::mm::AddressSpace;

/// Top of the modeled user stack area.
const USER_STACK_TOP: u64 = 0x7fff_ffff_f000;
/// Base of the modeled user text area.
const USER_TEXT_BASE: u64 = 0x40_0000;
/// Modeled length of the call instruction a dispatch resumes after.
const CALL_INSN_LEN: u64 = 2;

/// A guest thread's designated control page address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Page-aligned virtual address overlaid onto the current processor's
    /// control page entry.
    pub addr: VirtAddr,
}

/// Per-thread execution context.
pub struct Thread {
    id: u64,
    cpu: AtomicU32,
    migrate_disable: AtomicU32,
    registration: Mutex<Option<Registration>>,
    mm: Arc<AddressSpace>,
    user_rsp: AtomicU64,
    rip: AtomicU64,
    eflags: AtomicU32,
}

impl Thread {
    fn new(id: u64, cpu: CpuId, mm: Arc<AddressSpace>) -> Self {
        Self {
            id,
            cpu: AtomicU32::new(cpu),
            migrate_disable: AtomicU32::new(0),
            registration: Mutex::new(None),
            mm,
            user_rsp: AtomicU64::new(USER_STACK_TOP - id * 0x1_0000),
            rip: AtomicU64::new(USER_TEXT_BASE),
            eflags: AtomicU32::new((RFlags::FIXED | RFlags::IF).bits()),
        }
    }

    /// Thread identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The processor this thread is currently executing on.
    pub fn current_cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Acquire)
    }

    /// The owning process's address space.
    pub fn mm(&self) -> &Arc<AddressSpace> {
        &self.mm
    }

    /// The thread's registration record, if it has registered.
    pub fn registration(&self) -> Option<Registration> {
        *self.registration.lock()
    }

    pub(crate) fn set_registration(&self, registration: Option<Registration>) -> Option<Registration> {
        core::mem::replace(&mut *self.registration.lock(), registration)
    }

    /// Whether migration is currently disabled for this thread.
    pub fn migration_disabled(&self) -> bool {
        self.migrate_disable.load(Ordering::Acquire) != 0
    }

    /// Modeled user stack pointer.
    pub fn user_rsp(&self) -> u64 {
        self.user_rsp.load(Ordering::Relaxed)
    }

    /// Modeled flags register.
    pub fn eflags(&self) -> u32 {
        self.eflags.load(Ordering::Relaxed)
    }

    /// Advances the modeled instruction pointer past the call site and
    /// returns the resume address.
    pub(crate) fn advance_rip(&self) -> u64 {
        self.rip.fetch_add(CALL_INSN_LEN, Ordering::Relaxed) + CALL_INSN_LEN
    }
}

/// Scoped migration disable.
///
/// Held around the remap critical section so "the processor I am on right
/// now" cannot change mid-operation. Released on drop on every exit path.
pub struct MigrationGuard<'a> {
    thread: &'a Thread,
}

impl<'a> MigrationGuard<'a> {
    /// Disables migration for `thread` until the guard drops.
    pub fn new(thread: &'a Thread) -> Self {
        thread.migrate_disable.fetch_add(1, Ordering::AcqRel);
        Self { thread }
    }
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.thread.migrate_disable.fetch_sub(1, Ordering::AcqRel);
    }
}

struct CpuState {
    tlb_flushes: AtomicU64,
}

/// Minimal scheduler: thread placement, migration, per-processor TLB
/// bookkeeping.
pub struct Scheduler {
    cpus: Vec<CpuState>,
    next_thread_id: AtomicU64,
}

impl Scheduler {
    /// Creates a scheduler for `cpu_count` logical processors.
    pub fn new(cpu_count: usize) -> Self {
        let cpu_count = core::cmp::max(1, cpu_count);
        let mut cpus = Vec::with_capacity(cpu_count);
        for _ in 0..cpu_count {
            cpus.push(CpuState {
                tlb_flushes: AtomicU64::new(0),
            });
        }
        Self {
            cpus,
            next_thread_id: AtomicU64::new(1),
        }
    }

    /// Number of logical processors.
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Creates a thread in `mm`, placed on `pin` or round-robin.
    pub fn spawn(&self, mm: Arc<AddressSpace>, pin: Option<CpuId>) -> Result<Arc<Thread>> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let cpu = match pin {
            Some(cpu) => {
                self.check_cpu(cpu)?;
                cpu
            }
            None => (id % self.cpus.len() as u64) as CpuId,
        };
        Ok(Arc::new(Thread::new(id, cpu, mm)))
    }

    /// Moves `thread` to `dest`. Fails with `Busy` while a migration guard
    /// is held. Does not refresh an existing control page mapping; see
    /// `Host::refresh_control_page`.
    pub fn migrate(&self, thread: &Thread, dest: CpuId) -> Result<()> {
        self.check_cpu(dest)?;
        if thread.migration_disabled() {
            return Err(Error::Busy(format!(
                "thread {} has migration disabled",
                thread.id()
            )));
        }
        thread.cpu.store(dest, Ordering::Release);
        #[cfg(feature = "log")]
        if thread.registration().is_some() {
            log::warn!(
                "thread {} migrated to cpu {} with a registered control page, mapping is stale until refreshed",
                thread.id(),
                dest
            );
        }
        Ok(())
    }

    /// Invalidates the translation cache entry for `addr` on `cpu`.
    pub(crate) fn flush_tlb_one_user(&self, cpu: CpuId, _addr: VirtAddr) {
        if let Some(state) = self.cpus.get(cpu as usize) {
            state.tlb_flushes.fetch_add(1, Ordering::Relaxed);
        }
        #[cfg(feature = "log")]
        log::trace!("cpu {}: flushed tlb entry for {:#x}", cpu, _addr.as_usize());
    }

    /// Number of single-entry TLB invalidations issued on `cpu`.
    pub fn tlb_flushes(&self, cpu: CpuId) -> u64 {
        self.cpus
            .get(cpu as usize)
            .map(|state| state.tlb_flushes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn check_cpu(&self, cpu: CpuId) -> Result<()> {
        if (cpu as usize) < self.cpus.len() {
            Ok(())
        } else {
            Err(Error::NotFound(format!("no such cpu {}", cpu)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_pins_thread() {
        let sched = Scheduler::new(2);
        let mm = Arc::new(AddressSpace::new());
        let thread = sched.spawn(mm, Some(0)).unwrap();

        {
            let _guard = MigrationGuard::new(&thread);
            assert!(thread.migration_disabled());
            assert!(matches!(sched.migrate(&thread, 1), Err(Error::Busy(_))));
            assert_eq!(thread.current_cpu(), 0);
        }

        assert!(!thread.migration_disabled());
        sched.migrate(&thread, 1).unwrap();
        assert_eq!(thread.current_cpu(), 1);
    }

    #[test]
    fn migrate_to_missing_cpu_fails() {
        let sched = Scheduler::new(2);
        let mm = Arc::new(AddressSpace::new());
        let thread = sched.spawn(mm, None).unwrap();
        assert!(matches!(sched.migrate(&thread, 7), Err(Error::NotFound(_))));
    }

    #[test]
    fn guard_releases_on_nested_exit() {
        let sched = Scheduler::new(1);
        let mm = Arc::new(AddressSpace::new());
        let thread = sched.spawn(mm, Some(0)).unwrap();
        {
            let _outer = MigrationGuard::new(&thread);
            {
                let _inner = MigrationGuard::new(&thread);
                assert!(thread.migration_disabled());
            }
            assert!(thread.migration_disabled());
        }
        assert!(!thread.migration_disabled());
    }
}
