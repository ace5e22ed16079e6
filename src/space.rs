// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Range-level orchestrator — splits arbitrary ranges into per-block operations
//! OWNERS: @runtime
//! PUBLIC API: AddressSpace::{current, attach, terminate, reserve, release, is_readable,
//!   is_writable, is_private, is_copy}; crate-level fan-out helpers
//! DEPENDS_ON: directory, block, sys
//! INVARIANTS: reservation claims every directory slot it covers or rolls back fully;
//!   multi-block operations are not atomic (callers own overlap discipline)

use std::fs::File;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};

use crate::block::Block;
use crate::directory::{self, Directory};
use crate::sys::{self, ViewKind, ALLOCATION_GRANULARITY, PAGES_PER_BLOCK, PAGE_SIZE};
use crate::{Error, Flags, Result};

/// Logical address space of one process.
///
/// For the current process this is the full manager; a foreign attach (a
/// supervisor inspecting a supervised process) supports introspection only,
/// since the kernel offers no way to rewire mappings of another process.
pub struct AddressSpace {
    pid: u32,
    current: bool,
    directory: Directory,
    pagemap: File,
}

impl AddressSpace {
    /// Sets the manager up for the current process.
    pub fn current() -> Result<Self> {
        let pid = std::process::id();
        let directory = Directory::create(pid)?;
        let pagemap =
            sys::open_pagemap(pid).map_err(|_| Error::Initialize("pagemap unavailable"))?;
        log::debug!("address space initialized for pid {pid}");
        Ok(Self {
            pid,
            current: true,
            directory,
            pagemap,
        })
    }

    /// Attaches to the directory of a supervised process.
    pub fn attach(pid: u32) -> Result<Self> {
        let directory = Directory::attach(pid)?;
        let pagemap =
            sys::open_pagemap(pid).map_err(|_| Error::Initialize("pagemap unavailable"))?;
        Ok(Self {
            pid,
            current: false,
            directory,
            pagemap,
        })
    }

    /// Tears down the directory; for the owning process this releases every
    /// block still tracked in it.
    pub fn terminate(self) {
        self.directory.terminate(self.current);
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// One past the highest manageable address.
    pub fn end(&self) -> usize {
        self.directory.end()
    }

    pub(crate) fn directory(&self) -> &Directory {
        &self.directory
    }

    pub(crate) fn query(&self, addr: usize) -> std::io::Result<Option<sys::VmRegion>> {
        sys::query(self.pid, addr)
    }

    pub(crate) fn private_copy_mask(&self, addr: usize) -> std::io::Result<u16> {
        sys::private_copy_mask(&self.pagemap, addr, PAGES_PER_BLOCK)
    }

    fn require_current(&self) -> Result<()> {
        if self.current {
            Ok(())
        } else {
            Err(Error::Unsupported("mutation of a foreign address space"))
        }
    }

    fn range_end(&self, ptr: usize, size: usize) -> Result<usize> {
        let end = ptr.checked_add(size).ok_or(Error::BadParam)?;
        if end > self.directory.end() {
            return Err(Error::BadParam);
        }
        Ok(end)
    }

    /// Reserves `size` bytes of address space and claims every covered
    /// directory slot. A lost claim rolls everything back and retries after
    /// yielding. With `EXACTLY` and a destination, failure returns 0 instead
    /// of raising.
    pub fn reserve(&self, size: usize, flags: Flags, dst: usize) -> Result<usize> {
        self.require_current()?;
        if size == 0 {
            return Err(Error::BadParam);
        }
        let exact = dst != 0 && flags.contains(Flags::EXACTLY);
        loop {
            let (base, length, ret) = if exact {
                let base = sys::round_down(dst, ALLOCATION_GRANULARITY);
                let end = sys::round_up(self.range_end(dst, size)?, ALLOCATION_GRANULARITY);
                match sys::reserve_at(base, end - base) {
                    Ok(true) => (base, end - base, dst),
                    // Occupied, or the kernel refused: the caller asked for
                    // exactly this spot, so answer with null.
                    Ok(false) | Err(_) => return Ok(0),
                }
            } else {
                let length = sys::round_up(size, ALLOCATION_GRANULARITY);
                let hint = sys::round_down(dst, ALLOCATION_GRANULARITY);
                let base =
                    sys::reserve_anywhere(length, hint).map_err(|_| Error::NoMemory)?;
                (base, length, base)
            };

            let end = base + length;
            let mut claimed = base;
            let mut won = true;
            while claimed < end {
                let info = self.directory.block(claimed)?;
                if info
                    .compare_exchange(directory::FREE, directory::RESERVED)
                    .is_err()
                {
                    won = false;
                    break;
                }
                claimed += ALLOCATION_GRANULARITY;
            }
            if won {
                log::trace!("reserved {length:#x} bytes at {base:#x}");
                return Ok(ret);
            }
            // Another thread holds a claim in this range; undo ours and try a
            // different spot.
            let mut p = base;
            while p < claimed {
                self.directory.block(p)?.store(directory::FREE);
                p += ALLOCATION_GRANULARITY;
            }
            sys::release(base, length).map_err(Error::from_os)?;
            std::thread::yield_now();
        }
    }

    /// Releases every block of `[ptr, ptr + size)`. The whole range must be
    /// allocated; mappings are unmapped and closed, bare reservations
    /// unreserved. Reservations extending beyond the range survive outside it.
    pub fn release(&self, ptr: usize, size: usize) -> Result<()> {
        self.require_current()?;
        if ptr == 0 || size == 0 {
            return Ok(());
        }
        let begin = sys::round_down(ptr, ALLOCATION_GRANULARITY);
        let end = sys::round_up(self.range_end(ptr, size)?, ALLOCATION_GRANULARITY);

        let mut p = begin;
        while p < end {
            if self.directory.allocated_block(p).is_none() {
                return Err(Error::BadParam);
            }
            p += ALLOCATION_GRANULARITY;
        }

        let mut p = begin;
        while p < end {
            if let Some(info) = self.directory.allocated_block(p) {
                match info.exchange(directory::FREE) {
                    // Lost to a concurrent release of the same range.
                    directory::FREE => {}
                    directory::RESERVED => {
                        sys::release(p, ALLOCATION_GRANULARITY).map_err(Error::from_os)?;
                    }
                    fd => {
                        sys::release(p, ALLOCATION_GRANULARITY).map_err(Error::from_os)?;
                        drop(unsafe { OwnedFd::from_raw_fd(fd as i32) });
                    }
                }
            }
            p += ALLOCATION_GRANULARITY;
        }
        log::trace!("released {:#x}..{:#x}", begin, end);
        Ok(())
    }

    /// Maps a view of `fd` at a fresh granularity-aligned address and claims
    /// the covering slot. `owned` handles are closed on every failure path.
    pub(crate) fn map_anywhere(&self, fd: isize, kind: ViewKind, owned: bool) -> Result<usize> {
        debug_assert!(self.current);
        let close = |fd: isize| {
            if owned {
                drop(unsafe { OwnedFd::from_raw_fd(fd as i32) });
            }
        };
        loop {
            let addr = match sys::reserve_anywhere(ALLOCATION_GRANULARITY, 0) {
                Ok(addr) => addr,
                Err(_) => {
                    close(fd);
                    return Err(Error::NoMemory);
                }
            };
            let info = match self.directory.block(addr) {
                Ok(info) => info,
                Err(err) => {
                    let _ = sys::release(addr, ALLOCATION_GRANULARITY);
                    close(fd);
                    return Err(err);
                }
            };
            if info.compare_exchange(directory::FREE, fd).is_ok() {
                if let Err(err) = sys::map_view(
                    fd as i32,
                    addr,
                    ALLOCATION_GRANULARITY,
                    libc::PROT_NONE,
                    kind,
                    0,
                ) {
                    info.store(directory::FREE);
                    let _ = sys::release(addr, ALLOCATION_GRANULARITY);
                    close(fd);
                    return Err(Error::from_os(err));
                }
                return Ok(addr);
            }
            // A stale slot shadows this fresh range; pick another one.
            let _ = sys::release(addr, ALLOCATION_GRANULARITY);
            std::thread::yield_now();
        }
    }

    /// Quick copy of a sub-range of one source block to a fresh address.
    /// Rewires the source's mapping directly for a same-process move,
    /// otherwise duplicates it; the block-level copy then applies page states
    /// and source teardown.
    pub(crate) fn copy(
        &self,
        src: &mut Block<'_>,
        offset: usize,
        size: usize,
        flags: Flags,
    ) -> Result<usize> {
        let mv = src.can_move(offset, size, flags)?;
        let addr = if !mv || !self.current {
            let dup = sys::duplicate_mapping(src.mapping() as i32).map_err(|_| Error::NoMemory)?;
            let kind = if mv { ViewKind::Direct } else { ViewKind::Cow };
            self.map_anywhere(dup.into_raw_fd() as isize, kind, true)?
        } else {
            self.map_anywhere(src.mapping(), ViewKind::Direct, false)?
        };
        let mut dst = Block::new(self, addr)?;
        if let Err(err) = dst.copy_inner(false, mv, src, offset, size, flags) {
            let _ = self.release(addr, size);
            return Err(err);
        }
        Ok(addr)
    }

    /// Every block of the range must be allocated.
    pub fn check_allocated(&self, ptr: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if ptr == 0 {
            return Err(Error::BadParam);
        }
        let end = self.range_end(ptr, size)?;
        let mut p = sys::round_down(ptr, ALLOCATION_GRANULARITY);
        while p < end {
            if self.directory.allocated_block(p).is_none() {
                return Err(Error::BadParam);
            }
            p += ALLOCATION_GRANULARITY;
        }
        Ok(())
    }

    /// Every page of the range must be accessible; returns the OR of the page
    /// states of every touched block.
    pub fn check_committed(&self, ptr: usize, size: usize) -> Result<u8> {
        if size == 0 {
            return Ok(0);
        }
        if ptr == 0 {
            return Err(Error::BadParam);
        }
        let end = self.range_end(ptr, size)?;
        let mut bits = 0u8;
        let mut p = ptr;
        while p < end {
            let mut block = Block::new(self, p)?;
            let block_end = (block.address() + ALLOCATION_GRANULARITY).min(end);
            bits |= block.check_committed(p - block.address(), block_end - p)?;
            p = block_end;
        }
        Ok(bits)
    }

    pub(crate) fn change_protection(&self, ptr: usize, size: usize, flags: Flags) -> Result<()> {
        self.require_current()?;
        if size == 0 {
            return Ok(());
        }
        if ptr == 0 {
            return Err(Error::BadParam);
        }
        let end = self.range_end(ptr, size)?;
        let mut p = ptr;
        while p < end {
            let mut block = Block::new(self, p)?;
            let block_end = (block.address() + ALLOCATION_GRANULARITY).min(end);
            block.change_protection(p - block.address(), block_end - p, flags)?;
            p = block_end;
        }
        Ok(())
    }

    pub(crate) fn decommit(&self, ptr: usize, size: usize) -> Result<()> {
        self.require_current()?;
        if size == 0 {
            return Ok(());
        }
        self.check_allocated(ptr, size)?;
        let end = self.range_end(ptr, size)?;
        let mut p = ptr;
        while p < end {
            let mut block = Block::new(self, p)?;
            let block_end = (block.address() + ALLOCATION_GRANULARITY).min(end);
            block.decommit(p - block.address(), block_end - p)?;
            p = block_end;
        }
        Ok(())
    }

    /// Every page of the range is mapped with read access.
    pub fn is_readable(&self, ptr: usize, size: usize) -> Result<bool> {
        self.walk_regions(ptr, size, |region| region.read)
    }

    /// Every page of the range is mapped with write access.
    pub fn is_writable(&self, ptr: usize, size: usize) -> Result<bool> {
        self.walk_regions(ptr, size, |region| region.write)
    }

    fn walk_regions(
        &self,
        ptr: usize,
        size: usize,
        accept: impl Fn(&sys::VmRegion) -> bool,
    ) -> Result<bool> {
        let end = self.range_end(ptr, size)?;
        let mut p = ptr;
        while p < end {
            match self.query(p).map_err(Error::from_os)? {
                Some(region) if accept(&region) => p = region.end,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// No page of the range is in a sharable (copy-on-write armed, still
    /// connected) state. Privately copied and never-shared pages are private.
    pub fn is_private(&self, ptr: usize, size: usize) -> Result<bool> {
        let end = self.range_end(ptr, size)?;
        let mut p = ptr;
        while p < end {
            let Some(region) = self.query(p).map_err(Error::from_os)? else {
                break;
            };
            if region.read && region.private && region.file_backed {
                let first = sys::round_down(p.max(region.start), PAGE_SIZE);
                let last = sys::round_up(end.min(region.end), PAGE_SIZE);
                if sys::has_connected_page(&self.pagemap, first, (last - first) / PAGE_SIZE)
                    .map_err(Error::from_os)?
                {
                    return Ok(false);
                }
            }
            p = region.end;
        }
        Ok(true)
    }

    /// The ranges are block-aligned copies of each other: same intra-block
    /// offset, same backing object per block, every page accessible and still
    /// connected on both sides.
    pub fn is_copy(&self, p: usize, plocal: usize, size: usize) -> bool {
        if p % ALLOCATION_GRANULARITY != plocal % ALLOCATION_GRANULARITY {
            return false;
        }
        let walk = || -> Result<bool> {
            let end = self.range_end(p, size)?;
            let mut a = p;
            let mut b = plocal;
            while a < end {
                let mut first = Block::new(self, a)?;
                let mut second = Block::new(self, b)?;
                let block_end = (first.address() + ALLOCATION_GRANULARITY).min(end);
                if !first.is_copy(&mut second, a - first.address(), block_end - a)? {
                    return Ok(false);
                }
                b += block_end - a;
                a = block_end;
            }
            Ok(true)
        };
        walk().unwrap_or(false)
    }

    /// The error an embedder's fault handler should surface for a hardware
    /// fault at `addr`.
    pub fn classify_fault(&self, addr: usize, write: bool) -> Error {
        if self.directory.allocated_block(addr).is_none() {
            return Error::BadParam;
        }
        match self.query(addr).ok().flatten() {
            Some(region) if region.read => {
                if write && !region.write {
                    Error::NoPermission
                } else {
                    Error::Internal("no fault pending at address")
                }
            }
            _ => Error::MemNotCommitted,
        }
    }
}

