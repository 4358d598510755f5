//! Control page store
//!
//! Per-processor arena of control page entries, indexed by processor id.
//! Entries are allocated once at host bring-up and never freed while the
//! processor is online. A processor whose backing page could not be
//! allocated simply never offers the fast path; availability is tracked per
//! processor, not globally.

use alloc::boxed::Box;
use alloc::vec::Vec;

use dcall_api::{CpuId, PAGE_SIZE};

use crate::HostConfig;
use crate::control_page::ControlPageEntry;

/// Base of the per-processor privileged segment area.
pub const KERNEL_GS_BASE: u64 = 0xffff_8880_0000_0000;

/// Privileged segment base stamped into processor `cpu`'s entry. Unique per
/// processor, which also makes it usable as the per-processor marker.
pub const fn kernel_gs_base(cpu: CpuId) -> u64 {
    KERNEL_GS_BASE + (cpu as u64) * (2 * PAGE_SIZE as u64)
}

/// Arena of control page entries, one slot per logical processor.
pub struct ControlPageStore {
    entries: Vec<Option<Box<ControlPageEntry>>>,
}

impl ControlPageStore {
    /// Allocates the arena per the host configuration. Slots named in
    /// `config.fast_path_disabled` model a failed bring-up allocation and
    /// stay empty.
    pub fn bring_up(config: &HostConfig) -> Self {
        let cpu_count = core::cmp::max(1, config.cpus);
        let mut entries = Vec::with_capacity(cpu_count);
        for cpu in 0..cpu_count as CpuId {
            if config.fast_path_disabled.contains(&cpu) {
                #[cfg(feature = "log")]
                log::warn!("control page unavailable on cpu {}, fast path disabled", cpu);
                entries.push(None);
            } else {
                entries.push(Some(Box::new(ControlPageEntry::new())));
            }
        }
        Self { entries }
    }

    /// Number of processor slots in the arena.
    pub fn cpu_count(&self) -> usize {
        self.entries.len()
    }

    /// The entry owned by processor `cpu`, if it was brought up.
    pub fn entry(&self, cpu: CpuId) -> Option<&ControlPageEntry> {
        self.entries.get(cpu as usize).and_then(|slot| slot.as_deref())
    }

    /// Whether processor `cpu` offers the fast path: its entry exists and
    /// setup has stamped it.
    pub fn fast_path_enabled(&self, cpu: CpuId) -> bool {
        self.entry(cpu).is_some_and(|entry| entry.is_initialized())
    }

    /// Stamps processor `cpu`'s entry with its privileged segment base and
    /// the fast-entry address. Must run before any thread is scheduled on
    /// `cpu` with the fast path enabled. Idempotent; no error path - a
    /// missing entry just leaves the fast path unavailable on that
    /// processor.
    pub fn setup(&self, cpu: CpuId, direct_entry: u64) {
        let Some(entry) = self.entry(cpu) else {
            return;
        };
        entry.stamp(kernel_gs_base(cpu), direct_entry);
        #[cfg(feature = "log")]
        log::debug!("cpu {}: control page stamped, direct entry {:#x}", cpu, direct_entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn bring_up_and_setup() {
        let config = HostConfig {
            cpus: 4,
            fast_path_disabled: vec![2],
        };
        let store = ControlPageStore::bring_up(&config);
        assert_eq!(store.cpu_count(), 4);
        assert!(store.entry(2).is_none());
        assert!(store.entry(4).is_none());
        assert!(!store.fast_path_enabled(0));

        store.setup(0, 0x99);
        store.setup(2, 0x99);
        assert!(store.fast_path_enabled(0));
        assert!(!store.fast_path_enabled(2));
        assert_eq!(store.entry(0).unwrap().kernel_gsbase(), kernel_gs_base(0));
    }

    #[test]
    fn gs_base_is_unique_per_cpu() {
        assert_ne!(kernel_gs_base(0), kernel_gs_base(1));
        assert_eq!(kernel_gs_base(3), KERNEL_GS_BASE + 3 * 2 * PAGE_SIZE as u64);
    }
}
