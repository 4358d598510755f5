//! Address-space model
//!
//! Tracks a guest process's virtual memory areas in a map keyed by start
//! address, guarded by the address-space-wide lock. Mutating the map takes
//! the write lock for the duration of the whole unmap/insert sequence, which
//! serializes registration against concurrent mapping changes from any
//! source.

use alloc::vec::Vec;
use alloc::{collections::BTreeMap, format};

use bitflags::bitflags;
use dcall_api::{CpuId, Error, PAGE_SIZE, Result, VirtAddr};
use spin::RwLock;
use spin::rwlock::RwLockWriteGuard;

/// Base address used when the caller lets the model place a mapping.
const MAP_BASE: usize = 0x7f00_0000_0000;

bitflags! {
    /// Memory mapping flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u64 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const SHARED     = 1 << 2;
        const DONTEXPAND = 1 << 3;
    }
}

/// What a virtual memory area resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmBacking {
    /// Plain anonymous memory.
    Anonymous,
    /// Processor `CpuId`'s control page entry.
    ControlPage(CpuId),
}

/// A virtual memory area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vma {
    /// Inclusive start address.
    pub start: VirtAddr,
    /// Exclusive end address.
    pub end: VirtAddr,
    /// Mapping flags.
    pub flags: VmFlags,
    /// Backing object.
    pub backing: VmBacking,
}

impl Vma {
    /// Whether `addr` falls inside this area.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }
}

pub(crate) type VmaMap = BTreeMap<usize, Vma>;

/// A guest process's address space.
pub struct AddressSpace {
    vmas: RwLock<VmaMap>,
    next_map: spin::Mutex<usize>,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new() -> Self {
        Self {
            vmas: RwLock::new(BTreeMap::new()),
            next_map: spin::Mutex::new(MAP_BASE),
        }
    }

    /// Takes the address-space write lock.
    pub(crate) fn lock_write(&self) -> RwLockWriteGuard<'_, VmaMap> {
        self.vmas.write()
    }

    /// Maps `len` bytes of anonymous memory at `addr`.
    pub fn map_anon_at(&self, addr: VirtAddr, len: usize) -> Result<()> {
        if !addr.is_page_aligned() || len == 0 || len % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "bad anonymous mapping {:#x}+{:#x}",
                addr.as_usize(),
                len
            )));
        }
        let vma = Vma {
            start: addr,
            end: VirtAddr::new(addr.as_usize() + len),
            flags: VmFlags::READ | VmFlags::WRITE,
            backing: VmBacking::Anonymous,
        };
        let mut map = self.vmas.write();
        insert_vma(&mut map, vma)
    }

    /// Maps one page of anonymous memory at a model-chosen address.
    pub fn map_anon_page(&self) -> Result<VirtAddr> {
        let mut next = self.next_map.lock();
        let addr = VirtAddr::new(*next);
        *next += PAGE_SIZE;
        drop(next);
        self.map_anon_at(addr, PAGE_SIZE)?;
        Ok(addr)
    }

    /// Unmaps `len` bytes at `addr`.
    pub fn unmap(&self, addr: VirtAddr, len: usize) -> Result<()> {
        let mut map = self.vmas.write();
        munmap(&mut map, addr, len)
    }

    /// The area containing `addr`, if any.
    pub fn vma_at(&self, addr: VirtAddr) -> Option<Vma> {
        let map = self.vmas.read();
        find_vma(&map, addr).cloned()
    }

    /// All areas, ordered by start address. Used to assert that failed
    /// operations leave the address space untouched.
    pub fn snapshot(&self) -> Vec<Vma> {
        self.vmas.read().values().cloned().collect()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// The area containing `addr`, under a held lock.
pub(crate) fn find_vma(map: &VmaMap, addr: VirtAddr) -> Option<&Vma> {
    map.range(..=addr.as_usize())
        .next_back()
        .map(|(_, vma)| vma)
        .filter(|vma| vma.contains(addr))
}

/// Removes the mapping covering `[addr, addr + len)`, under a held write
/// lock. The model only splits on page-multiple boundaries.
pub(crate) fn munmap(map: &mut VmaMap, addr: VirtAddr, len: usize) -> Result<()> {
    if !addr.is_page_aligned() || len == 0 || len % PAGE_SIZE != 0 {
        return Err(Error::InvalidArgument(format!(
            "bad unmap range {:#x}+{:#x}",
            addr.as_usize(),
            len
        )));
    }
    let end = VirtAddr::new(addr.as_usize() + len);
    let Some(vma) = find_vma(map, addr).cloned() else {
        return Err(Error::NotFound(format!(
            "no vma covers {:#x}",
            addr.as_usize()
        )));
    };
    if end > vma.end {
        return Err(Error::InvalidArgument(format!(
            "unmap range {:#x}+{:#x} crosses vma end {:#x}",
            addr.as_usize(),
            len,
            vma.end.as_usize()
        )));
    }
    map.remove(&vma.start.as_usize());
    if vma.start < addr {
        map.insert(
            vma.start.as_usize(),
            Vma {
                end: addr,
                ..vma.clone()
            },
        );
    }
    if end < vma.end {
        map.insert(end.as_usize(), Vma { start: end, ..vma });
    }
    Ok(())
}

/// Inserts `vma`, under a held write lock. Overlap with an existing area is
/// rejected.
pub(crate) fn insert_vma(map: &mut VmaMap, vma: Vma) -> Result<()> {
    let overlaps = map
        .range(..vma.end.as_usize())
        .next_back()
        .is_some_and(|(_, existing)| existing.end > vma.start);
    if overlaps {
        return Err(Error::InvalidArgument(format!(
            "mapping {:#x}..{:#x} overlaps an existing vma",
            vma.start.as_usize(),
            vma.end.as_usize()
        )));
    }
    map.insert(vma.start.as_usize(), vma);
    Ok(())
}
