//! DCall Guest - unprivileged side of the direct syscall acceleration bridge
//!
//! This crate provides the guest half of the bridge: the interception shim
//! that replaces the process-wide generic-dispatch hook, and the
//! classification policy that decides, per syscall number, between the
//! direct fast path and the retained slow path.
//!
//! # Architecture
//!
//! - **policy**: the fast/slow classification table
//! - **shim**: hook slot, per-thread lazy registration, tagged dispatch
//!
//! # Usage
//!
//! ```rust,ignore
//! use dcall_guest::{GenericEntryHook, HookSlot, Shim};
//!
//! let slot = HookSlot::new(Arc::new(GenericEntryHook::new(dispatcher)));
//! let shim = Shim::install(&slot, host.fast_entry().clone());
//! let ret = slot.call(&thread, &args);
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod policy;
pub mod shim;

pub use crate::policy::{DIVERGENT_SYSCALLS, Path, classify};
pub use crate::shim::{GenericEntryHook, HookSlot, Shim, ShimStats, SyscallHook};
