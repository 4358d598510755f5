//! Privileged syscall surface
//!
//! The handler trait and table shared by the generic dispatcher and the
//! fast-entry routine, the generic dispatcher stand-in used as the slow
//! path, and the two bridge syscalls: control page registration and the
//! direct-entry query.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;

use dcall_api::nr::{SYS_DIRECT_ENTRY, SYS_REGISTER_CONTROL_PAGE, SyscallArgs};
use dcall_api::{Error, Result, VirtAddr};
use spin::{Mutex, RwLock};

use crate::remap::remap_control_page;
use crate::sched::{MigrationGuard, Registration, Scheduler, Thread};
use crate::store::ControlPageStore;

/// A privileged syscall handler.
pub trait SyscallHandler: Send + Sync {
    /// The syscall number this handler serves.
    fn id(&self) -> u32;

    /// Handler name, for diagnostics.
    fn name(&self) -> &str;

    /// Executes the syscall for `thread` with the raw argument frame.
    fn execute(&self, thread: &Thread, args: &SyscallArgs) -> Result<isize>;
}

/// Number-to-handler table consulted by both the generic dispatcher and the
/// fast-entry routine. Skipping the generic gate never changes which handler
/// runs.
pub struct HandlerTable {
    handlers: RwLock<BTreeMap<u32, Box<dyn SyscallHandler>>>,
}

impl HandlerTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers a handler under its own number.
    pub fn register_handler(&self, handler: Box<dyn SyscallHandler>) {
        self.handlers.write().insert(handler.id(), handler);
    }

    /// Runs the handler for `args[0]`.
    pub fn invoke(&self, thread: &Thread, args: &SyscallArgs) -> Result<isize> {
        let nr = args[0] as u32;
        let handlers = self.handlers.read();
        let handler = handlers
            .get(&nr)
            .ok_or_else(|| Error::NotFound(format!("syscall {} not found", nr)))?;
        handler.execute(thread, args)
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch statistics
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    /// Total number of dispatched calls
    pub total_calls: u64,
    /// Number of calls by syscall number
    pub calls_by_nr: BTreeMap<u32, u64>,
    /// Number of calls that returned an error
    pub error_count: u64,
}

/// Generic syscall dispatcher.
///
/// Stand-in for the external generic dispatch machinery: the fully general
/// entry the guest shim retains as its fallback, and the home of the two
/// bridge handlers. Returns raw negative errno codes at this boundary.
pub struct GenericDispatcher {
    table: Arc<HandlerTable>,
    stats: Mutex<DispatchStats>,
}

impl GenericDispatcher {
    /// Creates a dispatcher over `table`.
    pub fn new(table: Arc<HandlerTable>) -> Self {
        Self {
            table,
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    /// The shared handler table.
    pub fn table(&self) -> &Arc<HandlerTable> {
        &self.table
    }

    /// Dispatches one syscall, returning the result or a negative errno.
    pub fn dispatch(&self, thread: &Thread, args: &SyscallArgs) -> isize {
        let nr = args[0] as u32;
        let result = self.table.invoke(thread, args);

        let mut stats = self.stats.lock();
        stats.total_calls += 1;
        *stats.calls_by_nr.entry(nr).or_insert(0) += 1;
        if result.is_err() {
            stats.error_count += 1;
        }
        drop(stats);

        match result {
            Ok(value) => value,
            Err(err) => {
                #[cfg(feature = "log")]
                log::debug!("thread {}: syscall {} failed: {}", thread.id(), nr, err);
                err.to_errno()
            }
        }
    }

    /// Current dispatch statistics.
    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }
}

/// `register_control_page(virtual_address)` - stores the calling thread's
/// designated control page address and triggers the first remap against the
/// processor the thread is currently executing on.
pub struct RegisterControlPageHandler {
    store: Arc<ControlPageStore>,
    sched: Arc<Scheduler>,
}

impl RegisterControlPageHandler {
    /// Creates the handler over the host's store and scheduler.
    pub fn new(store: Arc<ControlPageStore>, sched: Arc<Scheduler>) -> Self {
        Self { store, sched }
    }
}

impl SyscallHandler for RegisterControlPageHandler {
    fn id(&self) -> u32 {
        SYS_REGISTER_CONTROL_PAGE
    }

    fn name(&self) -> &str {
        "register_control_page"
    }

    fn execute(&self, thread: &Thread, args: &SyscallArgs) -> Result<isize> {
        let addr = VirtAddr::new(args[1]);
        if !addr.is_page_aligned() {
            #[cfg(feature = "log")]
            log::error!(
                "control page address {:#x} is not page aligned",
                addr.as_usize()
            );
            return Err(Error::InvalidArgument(format!(
                "control page address {:#x} is not page aligned",
                addr.as_usize()
            )));
        }

        let registration = Registration { addr };
        let previous = thread.set_registration(Some(registration));

        // The remap targets "the processor I am on right now"; that fact
        // must hold until the mapping is installed.
        let guard = MigrationGuard::new(thread);
        let cpu = thread.current_cpu();

        if !self.store.fast_path_enabled(cpu) {
            drop(guard);
            thread.set_registration(previous);
            return Err(Error::RemapFailed(format!(
                "fast path unavailable on cpu {}",
                cpu
            )));
        }

        match remap_control_page(&self.sched, thread, cpu, registration, previous) {
            Ok(()) => Ok(0),
            Err(err) => {
                drop(guard);
                thread.set_registration(previous);
                Err(err)
            }
        }
    }
}

/// `direct_entry()` - returns the fast-entry address for the guest shim.
pub struct DirectEntryHandler {
    direct_entry: u64,
}

impl DirectEntryHandler {
    /// Creates the handler for a stamped fast-entry address.
    pub fn new(direct_entry: u64) -> Self {
        Self { direct_entry }
    }
}

impl SyscallHandler for DirectEntryHandler {
    fn id(&self) -> u32 {
        SYS_DIRECT_ENTRY
    }

    fn name(&self) -> &str {
        "direct_entry"
    }

    fn execute(&self, _thread: &Thread, _args: &SyscallArgs) -> Result<isize> {
        Ok(self.direct_entry as isize)
    }
}

/// Registers the two bridge handlers.
pub fn register_bridge_handlers(
    table: &HandlerTable,
    store: Arc<ControlPageStore>,
    sched: Arc<Scheduler>,
    direct_entry: u64,
) {
    table.register_handler(Box::new(RegisterControlPageHandler::new(store, sched)));
    table.register_handler(Box::new(DirectEntryHandler::new(direct_entry)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcall_api::nr::SYSCALL_ARGS;

    struct TestHandler {
        nr: u32,
        result: isize,
    }

    impl SyscallHandler for TestHandler {
        fn id(&self) -> u32 {
            self.nr
        }

        fn name(&self) -> &str {
            "test"
        }

        fn execute(&self, _thread: &Thread, _args: &SyscallArgs) -> Result<isize> {
            Ok(self.result)
        }
    }

    #[test]
    fn dispatch_and_stats() {
        use crate::mm::AddressSpace;

        let table = Arc::new(HandlerTable::new());
        table.register_handler(Box::new(TestHandler { nr: 100, result: 42 }));
        let dispatcher = GenericDispatcher::new(table);

        let sched = Scheduler::new(1);
        let thread = sched.spawn(Arc::new(AddressSpace::new()), Some(0)).unwrap();

        let mut args = [0usize; SYSCALL_ARGS];
        args[0] = 100;
        assert_eq!(dispatcher.dispatch(&thread, &args), 42);

        args[0] = 101;
        assert_eq!(dispatcher.dispatch(&thread, &args), -dcall_api::error::ENOENT);

        let stats = dispatcher.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.calls_by_nr.get(&100), Some(&1));
        assert_eq!(stats.error_count, 1);
    }
}
