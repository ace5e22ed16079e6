// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sparse block directory — block index → mapping slot, shared across processes
//! OWNERS: @runtime
//! PUBLIC API (crate): Directory::{create, attach, block, allocated_block, terminate},
//!   BlockInfo atomic slot
//! DEPENDS_ON: sys (named memory object, leaf views), core atomics
//! INVARIANTS: a slot is FREE, RESERVED or a mapping fd of the owning process; slots
//!   only change through atomic compare-and-swap / exchange; leaf views are installed
//!   once and never move

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicIsize, Ordering};

use crate::sys::{self, ALLOCATION_GRANULARITY};
use crate::{Error, Result};

/// Slot value: the block is not reserved.
pub const FREE: isize = 0;
/// Slot value: the block is reserved but carries no mapping.
pub const RESERVED: isize = -1;

/// One directory slot. Positive values are mapping fds, valid in the owning
/// process only (a supervisor sees which blocks exist, not usable handles).
#[repr(transparent)]
pub struct BlockInfo {
    mapping: AtomicIsize,
}

impl BlockInfo {
    pub fn load(&self) -> isize {
        self.mapping.load(Ordering::Acquire)
    }

    pub fn compare_exchange(&self, current: isize, new: isize) -> std::result::Result<isize, isize> {
        self.mapping
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn exchange(&self, new: isize) -> isize {
        self.mapping.swap(new, Ordering::AcqRel)
    }

    pub fn store(&self, value: isize) {
        self.mapping.store(value, Ordering::Release)
    }
}

const ENTRY_SIZE: usize = std::mem::size_of::<BlockInfo>();
/// Entries per second-level leaf (one granularity unit of the backing object).
#[cfg(target_pointer_width = "64")]
const LEAF_ENTRIES: usize = ALLOCATION_GRANULARITY / ENTRY_SIZE;

fn object_name(pid: u32) -> String {
    format!("/nexus-memspace.mmap.{pid:08x}")
}

/// The sparse index from block number to [`BlockInfo`], backed by a pid-named
/// shared memory object so a supervisor can attach to it.
///
/// On 64-bit targets the index is two-level: an anonymous, lazily-backed array
/// of leaf pointers, with each leaf a window of the shared object installed by
/// compare-and-swap on first use. Losers of the install race unmap their
/// speculative view. On 32-bit the whole object is small enough for one flat
/// view.
pub struct Directory {
    shm: OwnedFd,
    name: String,
    owner: bool,
    entries: usize,
    #[cfg(target_pointer_width = "64")]
    level1: *mut LeafPointer,
    #[cfg(target_pointer_width = "64")]
    leaf_count: usize,
    #[cfg(target_pointer_width = "32")]
    flat: *mut BlockInfo,
}

#[cfg(target_pointer_width = "64")]
type LeafPointer = std::sync::atomic::AtomicPtr<BlockInfo>;

unsafe impl Send for Directory {}
unsafe impl Sync for Directory {}

impl Directory {
    fn entry_count() -> usize {
        (sys::MAX_USER_ADDRESS + ALLOCATION_GRANULARITY) / ALLOCATION_GRANULARITY
    }

    /// Creates the directory for the current process.
    pub fn create(pid: u32) -> Result<Self> {
        let entries = Self::entry_count();
        let name = object_name(pid);
        let shm = sys::shm_create(&name, (entries * ENTRY_SIZE) as u64)
            .map_err(|_| Error::Initialize("directory object creation failed"))?;
        Self::with_views(shm, name, true, entries)
    }

    /// Attaches to the directory of another process by name.
    pub fn attach(pid: u32) -> Result<Self> {
        let entries = Self::entry_count();
        let name = object_name(pid);
        let shm = sys::shm_attach(&name)
            .map_err(|_| Error::Initialize("directory object not found"))?;
        Self::with_views(shm, name, false, entries)
    }

    #[cfg(target_pointer_width = "64")]
    fn with_views(shm: OwnedFd, name: String, owner: bool, entries: usize) -> Result<Self> {
        let leaf_count = entries.div_ceil(LEAF_ENTRIES);
        let level1 = sys::map_anon_array(leaf_count * std::mem::size_of::<LeafPointer>())
            .map_err(|_| Error::Initialize("directory index reservation failed"))?;
        Ok(Self {
            shm,
            name,
            owner,
            entries,
            level1: level1 as *mut LeafPointer,
            leaf_count,
        })
    }

    #[cfg(target_pointer_width = "32")]
    fn with_views(shm: OwnedFd, name: String, owner: bool, entries: usize) -> Result<Self> {
        let flat = sys::map_object_anywhere(shm.as_raw_fd(), entries * ENTRY_SIZE, 0)
            .map_err(|_| Error::Initialize("directory view failed"))?;
        Ok(Self {
            shm,
            name,
            owner,
            entries,
            flat: flat as *mut BlockInfo,
        })
    }

    /// One past the highest address the directory can index.
    pub fn end(&self) -> usize {
        self.entries * ALLOCATION_GRANULARITY
    }

    fn index(&self, address: usize) -> Result<usize> {
        let idx = address / ALLOCATION_GRANULARITY;
        if idx >= self.entries {
            return Err(Error::BadParam);
        }
        Ok(idx)
    }

    /// Committing lookup: makes the slot for `address` addressable, installing
    /// the containing leaf view if this is its first use.
    #[cfg(target_pointer_width = "64")]
    pub fn block(&self, address: usize) -> Result<&BlockInfo> {
        let idx = self.index(address)?;
        let (i0, i1) = (idx / LEAF_ENTRIES, idx % LEAF_ENTRIES);
        let slot = unsafe { &*self.level1.add(i0) };
        let mut leaf = slot.load(Ordering::Acquire);
        if leaf.is_null() {
            let view = sys::map_object_anywhere(
                self.shm.as_raw_fd(),
                ALLOCATION_GRANULARITY,
                i0 * ALLOCATION_GRANULARITY,
            )
            .map_err(Error::from_os)? as *mut BlockInfo;
            match slot.compare_exchange(
                std::ptr::null_mut(),
                view,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => leaf = view,
                Err(winner) => {
                    let _ = sys::release(view as usize, ALLOCATION_GRANULARITY);
                    leaf = winner;
                }
            }
        }
        Ok(unsafe { &*leaf.add(i1) })
    }

    #[cfg(target_pointer_width = "32")]
    pub fn block(&self, address: usize) -> Result<&BlockInfo> {
        let idx = self.index(address)?;
        Ok(unsafe { &*self.flat.add(idx) })
    }

    /// Non-committing lookup: `None` when the slot's leaf was never installed
    /// or the block is not allocated.
    #[cfg(target_pointer_width = "64")]
    pub fn allocated_block(&self, address: usize) -> Option<&BlockInfo> {
        let idx = self.index(address).ok()?;
        let (i0, i1) = (idx / LEAF_ENTRIES, idx % LEAF_ENTRIES);
        let leaf = unsafe { &*self.level1.add(i0) }.load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        let info = unsafe { &*leaf.add(i1) };
        (info.load() != FREE).then_some(info)
    }

    #[cfg(target_pointer_width = "32")]
    pub fn allocated_block(&self, address: usize) -> Option<&BlockInfo> {
        let idx = self.index(address).ok()?;
        let info = unsafe { &*self.flat.add(idx) };
        (info.load() != FREE).then_some(info)
    }

    /// Tears the directory down. For the owning process every live mapping is
    /// unmapped and closed and every bare reservation released; a foreign
    /// attach only discards its own views.
    pub fn terminate(self, current_process: bool) {
        #[cfg(target_pointer_width = "64")]
        {
            for i0 in 0..self.leaf_count {
                let leaf = unsafe { &*self.level1.add(i0) }.load(Ordering::Acquire);
                if leaf.is_null() {
                    continue;
                }
                if current_process && self.owner {
                    for i1 in 0..LEAF_ENTRIES {
                        let value = unsafe { &*leaf.add(i1) }.exchange(FREE);
                        let address = (i0 * LEAF_ENTRIES + i1) * ALLOCATION_GRANULARITY;
                        release_slot(value, address);
                    }
                }
                let _ = sys::release(leaf as usize, ALLOCATION_GRANULARITY);
            }
            let _ = sys::release(
                self.level1 as usize,
                self.leaf_count * std::mem::size_of::<LeafPointer>(),
            );
        }
        #[cfg(target_pointer_width = "32")]
        {
            if current_process && self.owner {
                for idx in 0..self.entries {
                    let value = unsafe { &*self.flat.add(idx) }.exchange(FREE);
                    release_slot(value, idx * ALLOCATION_GRANULARITY);
                }
            }
            let _ = sys::release(self.flat as usize, self.entries * ENTRY_SIZE);
        }
        if self.owner {
            sys::shm_unlink(&self.name);
        }
        log::debug!("directory {} torn down", self.name);
    }
}

fn release_slot(value: isize, address: usize) {
    match value {
        FREE => {}
        RESERVED => {
            let _ = sys::release(address, ALLOCATION_GRANULARITY);
        }
        fd => {
            let _ = sys::release(address, ALLOCATION_GRANULARITY);
            drop(unsafe { OwnedFd::from_raw_fd(fd as i32) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_transitions_are_atomic() {
        let info = BlockInfo {
            mapping: AtomicIsize::new(FREE),
        };
        assert!(info.compare_exchange(FREE, RESERVED).is_ok());
        assert!(info.compare_exchange(FREE, RESERVED).is_err());
        assert_eq!(info.exchange(FREE), RESERVED);
        assert_eq!(info.load(), FREE);
    }

    #[test]
    fn lookup_and_teardown() {
        // A distinct pid-style tag keeps this independent from any address
        // space the integration suite may have created.
        let dir = Directory::create(std::process::id() ^ 0x5a5a_0000).unwrap();
        let probe = 0x7000_0000usize;
        assert!(dir.allocated_block(probe).is_none());
        let info = dir.block(probe).unwrap();
        assert_eq!(info.load(), FREE);
        assert!(dir.allocated_block(probe).is_none());
        info.store(RESERVED);
        assert!(dir.allocated_block(probe).is_some());
        info.store(FREE);
        assert!(dir.end() > sys::MAX_USER_ADDRESS);
        dir.terminate(false);
    }
}
