//! Fast-entry routine
//!
//! The privileged routine the stamped `direct_entry` address denotes. A
//! registered guest thread calls in here directly, skipping the generic
//! gate. The routine saves the direct-call frame into the current
//! processor's control page entry, runs the syscall through the shared
//! handler table, and clears the in-flight marker on leave.
//!
//! Steady-state dispatch takes no locks beyond the table's read lock: a
//! registered thread touches only its own processor's entry.

use alloc::sync::Arc;

use dcall_api::nr::SyscallArgs;

use crate::sched::Thread;
use crate::store::ControlPageStore;
use crate::syscall::HandlerTable;

/// The fast-entry routine and the state it needs.
pub struct FastEntry {
    store: Arc<ControlPageStore>,
    table: Arc<HandlerTable>,
}

impl FastEntry {
    pub(crate) fn new(store: Arc<ControlPageStore>, table: Arc<HandlerTable>) -> Self {
        Self { store, table }
    }

    /// The address stamped into every control page entry and returned by
    /// the direct-entry query. Stable for the lifetime of the host.
    pub fn address(self: &Arc<Self>) -> u64 {
        Arc::as_ptr(self) as usize as u64
    }

    /// Direct-call entry with `a1..a7`, `a1` being the syscall number.
    ///
    /// Reaching this on a processor without a stamped entry means a guest
    /// bypassed registration; that is an invariant violation and halts the
    /// context.
    pub fn enter(&self, thread: &Thread, args: &SyscallArgs) -> isize {
        let cpu = thread.current_cpu();
        let Some(entry) = self.store.entry(cpu) else {
            panic!("direct call on cpu {} without a control page", cpu);
        };
        if !entry.is_initialized() {
            panic!("direct call on cpu {} before entry setup", cpu);
        }

        // Direct-call convention: rcx carries the syscall number, r11 the
        // first argument; rip/rsp are the resume context.
        entry.save_direct_frame(
            thread.advance_rip(),
            thread.user_rsp(),
            args[0] as u64,
            args[1] as u64,
            thread.eflags(),
        );

        let ret = match self.table.invoke(thread, args) {
            Ok(value) => value,
            Err(err) => err.to_errno(),
        };

        entry.finish_direct_frame();
        ret
    }
}
