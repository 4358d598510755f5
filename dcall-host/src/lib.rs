//! DCall Host - privileged side of the direct syscall acceleration bridge
//!
//! This crate provides the host half of the bridge: the per-processor
//! control page store with its fixed layout, fast-path entry setup, the page
//! remap service, the registration and direct-entry-query syscalls, and the
//! fast-entry routine registered guests call into directly.
//!
//! # Architecture
//!
//! - **control_page**: fixed-layout per-processor entry, the host/guest
//!   compatibility surface
//! - **store**: per-processor arena and entry setup
//! - **mm**: address-space model with the address-space-wide lock
//! - **sched**: processor/thread model and the migration guard
//! - **remap**: the page remap service
//! - **syscall**: handler table, generic dispatcher stand-in, bridge
//!   syscalls
//! - **entry**: the fast-entry routine
//!
//! # Usage
//!
//! ```rust,ignore
//! use dcall_host::{Host, HostConfig};
//!
//! let host = Host::new(HostConfig::default());
//! let mm = host.create_address_space();
//! let thread = host.spawn_thread(&mm, Some(0))?;
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod control_page;
pub mod entry;
pub mod mm;
mod remap;
pub mod sched;
pub mod store;
pub mod syscall;

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use dcall_api::{CpuId, Error, Result};

pub use crate::control_page::ControlPageEntry;
pub use crate::entry::FastEntry;
pub use crate::mm::{AddressSpace, VmBacking, VmFlags, Vma};
pub use crate::sched::{MigrationGuard, Registration, Scheduler, Thread};
pub use crate::store::ControlPageStore;
pub use crate::syscall::{DispatchStats, GenericDispatcher, HandlerTable, SyscallHandler};

/// Host bring-up configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Number of logical processors.
    pub cpus: usize,
    /// Processors whose control page allocation is modeled as failed; the
    /// fast path stays off there and guests use generic dispatch only.
    pub fast_path_disabled: Vec<CpuId>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            fast_path_disabled: Vec::new(),
        }
    }
}

/// The assembled host: store, scheduler, handler table, fast entry, and the
/// generic dispatcher stand-in, wired together at bring-up.
pub struct Host {
    store: Arc<ControlPageStore>,
    sched: Arc<Scheduler>,
    table: Arc<HandlerTable>,
    fast: Arc<FastEntry>,
    dispatcher: Arc<GenericDispatcher>,
}

impl Host {
    /// Brings up the host: allocates the control page arena, stamps every
    /// available entry, and registers the bridge syscalls.
    pub fn new(config: HostConfig) -> Self {
        let store = Arc::new(ControlPageStore::bring_up(&config));
        let sched = Arc::new(Scheduler::new(config.cpus));
        let table = Arc::new(HandlerTable::new());
        let fast = Arc::new(FastEntry::new(Arc::clone(&store), Arc::clone(&table)));
        let direct_entry = fast.address();

        for cpu in 0..store.cpu_count() as CpuId {
            store.setup(cpu, direct_entry);
        }
        syscall::register_bridge_handlers(
            &table,
            Arc::clone(&store),
            Arc::clone(&sched),
            direct_entry,
        );

        let dispatcher = Arc::new(GenericDispatcher::new(Arc::clone(&table)));
        Self {
            store,
            sched,
            table,
            fast,
            dispatcher,
        }
    }

    /// The control page store.
    pub fn store(&self) -> &Arc<ControlPageStore> {
        &self.store
    }

    /// The scheduler model.
    pub fn sched(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// The shared handler table.
    pub fn table(&self) -> &Arc<HandlerTable> {
        &self.table
    }

    /// The fast-entry routine.
    pub fn fast_entry(&self) -> &Arc<FastEntry> {
        &self.fast
    }

    /// The generic dispatcher stand-in (the slow path).
    pub fn dispatcher(&self) -> &Arc<GenericDispatcher> {
        &self.dispatcher
    }

    /// Re-stamps processor `cpu`'s entry. Idempotent.
    pub fn setup_cpu(&self, cpu: CpuId) {
        self.store.setup(cpu, self.fast.address());
    }

    /// Creates an empty guest address space.
    pub fn create_address_space(&self) -> Arc<AddressSpace> {
        Arc::new(AddressSpace::new())
    }

    /// Creates a guest thread in `mm`, placed on `pin` or round-robin.
    pub fn spawn_thread(&self, mm: &Arc<AddressSpace>, pin: Option<CpuId>) -> Result<Arc<Thread>> {
        self.sched.spawn(Arc::clone(mm), pin)
    }

    /// Re-runs the remap for an already registered thread against the
    /// processor it is currently executing on. Callers that migrate a
    /// registered thread use this to rebind the mapping.
    pub fn refresh_control_page(&self, thread: &Thread) -> Result<()> {
        let Some(registration) = thread.registration() else {
            return Err(Error::NotFound(format!(
                "thread {} has no control page registration",
                thread.id()
            )));
        };

        let _guard = MigrationGuard::new(thread);
        let cpu = thread.current_cpu();
        if !self.store.fast_path_enabled(cpu) {
            return Err(Error::RemapFailed(format!(
                "fast path unavailable on cpu {}",
                cpu
            )));
        }
        remap::remap_control_page(&self.sched, thread, cpu, registration, None)
    }
}
