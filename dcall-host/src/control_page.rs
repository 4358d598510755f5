//! Control page entry layout
//!
//! One entry per logical processor, page-aligned, with a fixed byte layout
//! shared between host and guest. Field offsets are a compatibility surface:
//! they are part of the host/guest contract and asserted at compile time, so
//! any layout change fails the build instead of silently skewing the guest's
//! view. All fields are atomics of the contracted width, which keeps
//! concurrent host/guest access well defined without changing the layout.
//!
//! Write discipline: the setup fields (`kernel_gsbase`, `direct_entry`,
//! `initialized`, selectors) are written once by the host at processor
//! bring-up; the exchange fields (`rip`, `rsp`, `rcx`, `r11`, `eflags`,
//! `switch_flags`) are written by whichever side currently holds execution.

use core::mem;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use dcall_api::PAGE_SIZE;
use static_assertions::const_assert_eq;

/// Event flag bit: an event is pending in the entry.
pub const EVENT_FLAGS_EF: u64 = 1 << 0;
/// Event flag bit: interrupts were enabled at delivery.
pub const EVENT_FLAGS_IF: u64 = 1 << 9;

/// Switch flag bit: a direct call is in flight through this entry.
pub const SWITCH_FLAGS_DIRECT: u64 = 1 << 0;

/// Default user code selector stamped at setup.
pub const USER_CS: u16 = 6 * 8 + 3;
/// Default user data selector stamped at setup.
pub const USER_SS: u16 = 5 * 8 + 3;

bitflags! {
    /// Flags-register bits relevant to the direct-call entry/leave masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u32 {
        const CF    = 1 << 0;
        const FIXED = 1 << 1;
        const PF    = 1 << 2;
        const AF    = 1 << 4;
        const ZF    = 1 << 6;
        const SF    = 1 << 7;
        const TF    = 1 << 8;
        const IF    = 1 << 9;
        const DF    = 1 << 10;
        const OF    = 1 << 11;
        const IOPL  = 3 << 12;
        const NT    = 1 << 14;
        const RF    = 1 << 16;
        const AC    = 1 << 18;
        const ID    = 1 << 21;
    }
}

/// Guest flags bits preserved across a direct-call entry.
pub const DIRECTCALL_ENTER_MASK: RFlags = RFlags::CF
    .union(RFlags::PF)
    .union(RFlags::AF)
    .union(RFlags::ZF)
    .union(RFlags::SF)
    .union(RFlags::TF)
    .union(RFlags::IF)
    .union(RFlags::DF)
    .union(RFlags::OF)
    .union(RFlags::IOPL)
    .union(RFlags::NT)
    .union(RFlags::RF)
    .union(RFlags::AC)
    .union(RFlags::ID);

/// Flags state the guest resumes with after a direct call.
pub const DIRECTCALL_LEAVE_MASK: RFlags = RFlags::FIXED.union(RFlags::IF);

/// Flags bits a switch into privileged mode may carry.
pub const SWITCH_ENTER_EFLAGS_ALLOWED: RFlags = DIRECTCALL_ENTER_MASK.union(RFlags::FIXED);

/// Flags bits forced on across a privileged-mode switch.
pub const SWITCH_ENTER_EFLAGS_FIXED: RFlags = RFlags::FIXED.union(RFlags::IF);

/// Per-processor control page entry.
///
/// Exactly one entry is logically owned by a processor at a time; a guest
/// thread's mapping must point at the entry of the processor it is currently
/// executing on.
#[repr(C, align(4096))]
pub struct ControlPageEntry {
    event_flags: AtomicU64,
    event_errcode: AtomicU32,
    event_vector: AtomicU32,
    fault_address: AtomicU64,
    reserved0: [AtomicU64; 5],
    user_cs: AtomicU16,
    user_ss: AtomicU16,
    initialized: AtomicU32,
    reserved2: AtomicU64,
    user_gsbase: AtomicU64,
    eflags: AtomicU32,
    pkru: AtomicU32,
    rip: AtomicU64,
    rsp: AtomicU64,
    rcx: AtomicU64,
    r11: AtomicU64,
    kernel_gsbase: AtomicU64,
    switch_flags: AtomicU64,
    kernel_rflags: AtomicU64,
    kernel_rsp: AtomicU64,
    user_gsbase_direct: AtomicU64,
    user_rsp_direct: AtomicU64,
    dstack: AtomicU64,
    direct_entry: AtomicU64,
}

// Contracted field offsets. A coordinated version bump is required to move
// any of these.
const_assert_eq!(mem::offset_of!(ControlPageEntry, event_flags), 0);
const_assert_eq!(mem::offset_of!(ControlPageEntry, event_errcode), 8);
const_assert_eq!(mem::offset_of!(ControlPageEntry, event_vector), 12);
const_assert_eq!(mem::offset_of!(ControlPageEntry, fault_address), 16);
const_assert_eq!(mem::offset_of!(ControlPageEntry, reserved0), 24);
const_assert_eq!(mem::offset_of!(ControlPageEntry, user_cs), 64);
const_assert_eq!(mem::offset_of!(ControlPageEntry, user_ss), 66);
const_assert_eq!(mem::offset_of!(ControlPageEntry, initialized), 68);
const_assert_eq!(mem::offset_of!(ControlPageEntry, reserved2), 72);
const_assert_eq!(mem::offset_of!(ControlPageEntry, user_gsbase), 80);
const_assert_eq!(mem::offset_of!(ControlPageEntry, eflags), 88);
const_assert_eq!(mem::offset_of!(ControlPageEntry, pkru), 92);
const_assert_eq!(mem::offset_of!(ControlPageEntry, rip), 96);
const_assert_eq!(mem::offset_of!(ControlPageEntry, rsp), 104);
const_assert_eq!(mem::offset_of!(ControlPageEntry, rcx), 112);
const_assert_eq!(mem::offset_of!(ControlPageEntry, r11), 120);
const_assert_eq!(mem::offset_of!(ControlPageEntry, kernel_gsbase), 128);
const_assert_eq!(mem::offset_of!(ControlPageEntry, switch_flags), 136);
const_assert_eq!(mem::offset_of!(ControlPageEntry, kernel_rflags), 144);
const_assert_eq!(mem::offset_of!(ControlPageEntry, kernel_rsp), 152);
const_assert_eq!(mem::offset_of!(ControlPageEntry, user_gsbase_direct), 160);
const_assert_eq!(mem::offset_of!(ControlPageEntry, user_rsp_direct), 168);
const_assert_eq!(mem::offset_of!(ControlPageEntry, dstack), 176);
const_assert_eq!(mem::offset_of!(ControlPageEntry, direct_entry), 184);
const_assert_eq!(mem::size_of::<ControlPageEntry>(), PAGE_SIZE);
const_assert_eq!(mem::align_of::<ControlPageEntry>(), PAGE_SIZE);

impl ControlPageEntry {
    /// Creates a zeroed, not-yet-initialized entry.
    pub fn new() -> Self {
        Self {
            event_flags: AtomicU64::new(0),
            event_errcode: AtomicU32::new(0),
            event_vector: AtomicU32::new(0),
            fault_address: AtomicU64::new(0),
            reserved0: [const { AtomicU64::new(0) }; 5],
            user_cs: AtomicU16::new(0),
            user_ss: AtomicU16::new(0),
            initialized: AtomicU32::new(0),
            reserved2: AtomicU64::new(0),
            user_gsbase: AtomicU64::new(0),
            eflags: AtomicU32::new(0),
            pkru: AtomicU32::new(0),
            rip: AtomicU64::new(0),
            rsp: AtomicU64::new(0),
            rcx: AtomicU64::new(0),
            r11: AtomicU64::new(0),
            kernel_gsbase: AtomicU64::new(0),
            switch_flags: AtomicU64::new(0),
            kernel_rflags: AtomicU64::new(0),
            kernel_rsp: AtomicU64::new(0),
            user_gsbase_direct: AtomicU64::new(0),
            user_rsp_direct: AtomicU64::new(0),
            dstack: AtomicU64::new(0),
            direct_entry: AtomicU64::new(0),
        }
    }

    /// Stamps the setup fields: the privileged segment base for the owning
    /// processor, the fast-entry address, the default user selectors, and
    /// the initialized marker. Idempotent.
    pub fn stamp(&self, kernel_gsbase: u64, direct_entry: u64) {
        self.kernel_gsbase.store(kernel_gsbase, Ordering::Relaxed);
        self.user_cs.store(USER_CS, Ordering::Relaxed);
        self.user_ss.store(USER_SS, Ordering::Relaxed);
        self.direct_entry.store(direct_entry, Ordering::Relaxed);
        // Marker last: a guest that observes it may rely on every other
        // setup field being in place.
        self.initialized.store(1, Ordering::Release);
    }

    /// Whether setup has stamped this entry.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) == 1
    }

    /// Privileged segment base stamped at setup.
    pub fn kernel_gsbase(&self) -> u64 {
        self.kernel_gsbase.load(Ordering::Relaxed)
    }

    /// Fast-entry address stamped at setup.
    pub fn direct_entry(&self) -> u64 {
        self.direct_entry.load(Ordering::Relaxed)
    }

    /// Saved user code/data selectors.
    pub fn user_selectors(&self) -> (u16, u16) {
        (
            self.user_cs.load(Ordering::Relaxed),
            self.user_ss.load(Ordering::Relaxed),
        )
    }

    /// Saves the guest frame on direct-call entry. `eflags` is sanitized
    /// against the enter mask before it is stored.
    pub fn save_direct_frame(&self, rip: u64, rsp: u64, rcx: u64, r11: u64, eflags: u32) {
        self.rip.store(rip, Ordering::Relaxed);
        self.rsp.store(rsp, Ordering::Relaxed);
        self.rcx.store(rcx, Ordering::Relaxed);
        self.r11.store(r11, Ordering::Relaxed);
        let sanitized = RFlags::from_bits_truncate(eflags) & DIRECTCALL_ENTER_MASK;
        self.eflags.store(sanitized.bits(), Ordering::Relaxed);
        self.switch_flags.fetch_or(SWITCH_FLAGS_DIRECT, Ordering::AcqRel);
    }

    /// Clears the in-flight marker on direct-call leave and returns the
    /// flags state the guest resumes with.
    pub fn finish_direct_frame(&self) -> RFlags {
        self.switch_flags.fetch_and(!SWITCH_FLAGS_DIRECT, Ordering::AcqRel);
        DIRECTCALL_LEAVE_MASK
    }

    /// Saved resume instruction pointer.
    pub fn rip(&self) -> u64 {
        self.rip.load(Ordering::Relaxed)
    }

    /// Saved resume stack pointer.
    pub fn rsp(&self) -> u64 {
        self.rsp.load(Ordering::Relaxed)
    }

    /// Saved scratch register (syscall number under the direct-call
    /// convention).
    pub fn rcx(&self) -> u64 {
        self.rcx.load(Ordering::Relaxed)
    }

    /// Saved scratch register (first argument under the direct-call
    /// convention).
    pub fn r11(&self) -> u64 {
        self.r11.load(Ordering::Relaxed)
    }

    /// Saved, sanitized guest flags.
    pub fn eflags(&self) -> RFlags {
        RFlags::from_bits_truncate(self.eflags.load(Ordering::Relaxed))
    }

    /// Current switch-flags word.
    pub fn switch_flags(&self) -> u64 {
        self.switch_flags.load(Ordering::Acquire)
    }

    /// Records a privileged-mode event delivered through this entry.
    pub fn record_event(&self, vector: u32, errcode: u32, fault_address: u64) {
        self.event_vector.store(vector, Ordering::Relaxed);
        self.event_errcode.store(errcode, Ordering::Relaxed);
        self.fault_address.store(fault_address, Ordering::Relaxed);
        self.event_flags.fetch_or(EVENT_FLAGS_EF, Ordering::Release);
    }

    /// Consumes a pending event, if any.
    pub fn take_event(&self) -> Option<(u32, u32, u64)> {
        let flags = self.event_flags.fetch_and(!EVENT_FLAGS_EF, Ordering::AcqRel);
        if flags & EVENT_FLAGS_EF == 0 {
            return None;
        }
        Some((
            self.event_vector.load(Ordering::Relaxed),
            self.event_errcode.load(Ordering::Relaxed),
            self.fault_address.load(Ordering::Relaxed),
        ))
    }
}

impl Default for ControlPageEntry {
    fn default() -> Self {
        Self::new()
    }
}
