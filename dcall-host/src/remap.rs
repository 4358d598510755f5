//! Page remap service
//!
//! Rebinds a thread's registered virtual page onto the control page entry of
//! the processor the thread is currently pinned to. The caller holds a
//! migration guard for the whole operation and has already validated the
//! address, so any teardown/insert failure past the region lookup is an
//! invariant violation: the execution context halts rather than continuing
//! with an inconsistent mapping.
//!
//! The service is not re-invoked automatically when a thread later migrates;
//! registration is a one-time lazy action per thread, with an explicit
//! refresh operation on the host for callers that migrate afterwards.

use alloc::format;

use dcall_api::{CpuId, Error, PAGE_SIZE, Result, VirtAddr};

use crate::mm::{self, Vma, VmBacking, VmFlags};
use crate::sched::{Registration, Scheduler, Thread};

/// Remaps `thread`'s registered page onto `dest_cpu`'s control page entry.
///
/// `stale` is the thread's previous registration, torn down first when it
/// named a different address so no mapping leaks. Returns `NotFound` when no
/// region exists at the registered address; any later failure is fatal.
pub(crate) fn remap_control_page(
    sched: &Scheduler,
    thread: &Thread,
    dest_cpu: CpuId,
    registration: Registration,
    stale: Option<Registration>,
) -> Result<()> {
    let addr = registration.addr;
    let mm = thread.mm();
    let mut map = mm.lock_write();

    if mm::find_vma(&map, addr).is_none() {
        #[cfg(feature = "log")]
        log::error!(
            "control page vma not found at {:#x} for thread {}",
            addr.as_usize(),
            thread.id()
        );
        return Err(Error::NotFound(format!(
            "no vma at {:#x}",
            addr.as_usize()
        )));
    }

    // A previous registration at another address must not leak its mapping.
    if let Some(stale) = stale {
        if stale.addr != addr {
            let backed = mm::find_vma(&map, stale.addr)
                .is_some_and(|vma| matches!(vma.backing, VmBacking::ControlPage(_)));
            if backed && mm::munmap(&mut map, stale.addr, PAGE_SIZE).is_err() {
                fatal(thread, stale.addr, "failed to tear down stale control page mapping");
            }
        }
    }

    if mm::munmap(&mut map, addr, PAGE_SIZE).is_err() {
        fatal(thread, addr, "failed to unmap control page vma");
    }

    let vma = Vma {
        start: addr,
        end: VirtAddr::new(addr.as_usize() + PAGE_SIZE),
        flags: VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED | VmFlags::DONTEXPAND,
        backing: VmBacking::ControlPage(dest_cpu),
    };
    if mm::insert_vma(&mut map, vma).is_err() {
        fatal(thread, addr, "failed to insert control page vma");
    }

    sched.flush_tlb_one_user(dest_cpu, addr);
    #[cfg(feature = "log")]
    log::debug!(
        "thread {}: control page {:#x} bound to cpu {}",
        thread.id(),
        addr.as_usize(),
        dest_cpu
    );
    Ok(())
}

fn fatal(thread: &Thread, addr: VirtAddr, what: &str) -> ! {
    #[cfg(feature = "log")]
    log::error!("thread {}: {} at {:#x}", thread.id(), what, addr.as_usize());
    panic!(
        "thread {}: {} at {:#x}",
        thread.id(),
        what,
        addr.as_usize()
    )
}
