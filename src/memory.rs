// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Public memory facade — flag validation, quick paths, share/copy decision tree
//! OWNERS: @runtime
//! PUBLIC API: initialize/terminate, allocate/release/commit/decommit, copy,
//!   change_protection, is_*, query, classify_fault
//! DEPENDS_ON: space, block, sys; parking_lot singleton
//! INVARIANTS: the singleton address space outlives every operation; `EXACTLY`
//!   converts `NoMemory` into a null return at this boundary and nowhere else

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use parking_lot::RwLock;

use crate::block::{Block, BlockState, PageState};
use crate::directory::RESERVED;
use crate::space::AddressSpace;
use crate::sys::{self, ViewKind, ALLOCATION_GRANULARITY, PAGE_SIZE};
use crate::{Capabilities, Error, Flags, QueryParam, Result};

static SPACE: RwLock<Option<AddressSpace>> = RwLock::new(None);

/// Sets up the process-wide address space. Every other entry point requires it.
pub fn initialize() -> Result<()> {
    let mut guard = SPACE.write();
    if guard.is_some() {
        return Err(Error::Initialize("already initialized"));
    }
    *guard = Some(AddressSpace::current()?);
    Ok(())
}

/// Tears the process-wide address space down, releasing everything it still
/// tracks.
pub fn terminate() {
    if let Some(space) = SPACE.write().take() {
        space.terminate();
    }
}

fn with_space<R>(f: impl FnOnce(&AddressSpace) -> Result<R>) -> Result<R> {
    let guard = SPACE.read();
    match guard.as_ref() {
        Some(space) => f(space),
        None => Err(Error::Initialize("not initialized")),
    }
}

/// Allocates `size` bytes. With a null `dst` the manager picks the address;
/// otherwise `dst` is a hint, honored exactly under `EXACTLY`. `RESERVED`
/// skips the commit. Accepted flags: `RESERVED | EXACTLY | ZERO_INIT`.
pub fn allocate(dst: *mut u8, size: usize, flags: Flags) -> Result<*mut u8> {
    if size == 0 {
        return Err(Error::BadParam);
    }
    if !(Flags::RESERVED | Flags::EXACTLY | Flags::ZERO_INIT).contains(flags) {
        return Err(Error::InvFlag);
    }
    with_space(|space| {
        let attempt = || -> Result<usize> {
            if dst.is_null() && size <= ALLOCATION_GRANULARITY && !flags.contains(Flags::RESERVED)
            {
                // Quick allocate: fresh mapping, fresh block, commit the range.
                let fd = sys::create_mapping().map_err(|_| Error::NoMemory)?;
                let addr =
                    space.map_anywhere(fd.into_raw_fd() as isize, ViewKind::Direct, true)?;
                let mut block = ManagedBlock::new(space, addr)?;
                if let Err(err) = block.commit(0, size) {
                    let _ = space.release(addr, size);
                    return Err(err);
                }
                return Ok(addr);
            }
            let ret = space.reserve(size, flags, dst as usize)?;
            if ret == 0 {
                return Ok(0);
            }
            if !flags.contains(Flags::RESERVED) {
                if let Err(err) = commit_no_check(space, ret, size) {
                    let _ = space.release(ret, size);
                    return Err(err);
                }
            }
            Ok(ret)
        };
        match attempt() {
            Ok(addr) => Ok(addr as *mut u8),
            Err(Error::NoMemory) if flags.contains(Flags::EXACTLY) => Ok(std::ptr::null_mut()),
            Err(err) => Err(err),
        }
    })
}

/// Releases `[dst, dst + size)`; the whole range must be allocated.
pub fn release(dst: *mut u8, size: usize) -> Result<()> {
    with_space(|space| space.release(dst as usize, size))
}

/// Commits every page of the range read-write. Idempotent.
pub fn commit(ptr: *mut u8, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    if ptr.is_null() {
        return Err(Error::BadParam);
    }
    with_space(|space| {
        space.check_allocated(ptr as usize, size)?;
        commit_no_check(space, ptr as usize, size).map(|_| ())
    })
}

/// Decommits whole pages of the range; the reservation stays. Idempotent.
pub fn decommit(ptr: *mut u8, size: usize) -> Result<()> {
    with_space(|space| space.decommit(ptr as usize, size))
}

/// Toggles the range between read-write and read-only. Accepted flags:
/// `READ_ONLY` (or none for read-write).
pub fn change_protection(ptr: *mut u8, size: usize, flags: Flags) -> Result<()> {
    if !Flags::READ_ONLY.contains(flags) {
        return Err(Error::InvFlag);
    }
    if size == 0 {
        return Ok(());
    }
    if ptr.is_null() {
        return Err(Error::BadParam);
    }
    with_space(|space| space.change_protection(ptr as usize, size, flags))
}

/// Every page of the range is mapped readable.
pub fn is_readable(p: *const u8, size: usize) -> Result<bool> {
    with_space(|space| space.is_readable(p as usize, size))
}

/// Every page of the range is mapped writable.
pub fn is_writable(p: *const u8, size: usize) -> Result<bool> {
    with_space(|space| space.is_writable(p as usize, size))
}

/// No page of the range is currently sharable copy-on-write state.
pub fn is_private(p: *const u8, size: usize) -> Result<bool> {
    with_space(|space| space.is_private(p as usize, size))
}

/// The two ranges are copies: fully committed, same backing object per block,
/// no page privately disconnected on either side.
pub fn is_copy(p1: *const u8, p2: *const u8, size: usize) -> Result<bool> {
    with_space(|space| Ok(space.is_copy(p1 as usize, p2 as usize, size)))
}

/// Answers the platform constants and capabilities the embedder needs.
pub fn query(_p: *const u8, param: QueryParam) -> Result<usize> {
    match param {
        QueryParam::AllocationSpaceBegin => Ok(sys::MIN_USER_ADDRESS),
        QueryParam::AllocationSpaceEnd => with_space(|space| Ok(space.end())),
        QueryParam::AllocationUnit => Ok(ALLOCATION_GRANULARITY),
        QueryParam::CommitUnit | QueryParam::ProtectionUnit => Ok(PAGE_SIZE),
        QueryParam::Flags => Ok((Capabilities::ACCESS_CHECK
            | Capabilities::HARDWARE_PROTECTION
            | Capabilities::COPY_ON_WRITE
            | Capabilities::SPACE_RESERVATION)
            .bits() as usize),
    }
}

/// The error an embedder's fault handler should surface for a hardware fault
/// at `addr`: `MemNotCommitted` for an inaccessible page of an allocated
/// range, `NoPermission` for a write to a read-only page, `BadParam` for an
/// unmanaged address.
pub fn classify_fault(addr: *const u8, write: bool) -> Error {
    match with_space(|space| Ok(space.classify_fault(addr as usize, write))) {
        Ok(err) => err,
        Err(err) => err,
    }
}

/// A range in flight through `copy`, used to subtract already-owned or
/// already-released spans before acting on the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Region {
    ptr: usize,
    size: usize,
}

impl Region {
    /// Removes `[begin, end)` from the region, keeping the leading part when
    /// the cut would split it. Returns the remaining size.
    fn subtract(&mut self, begin: usize, end: usize) -> usize {
        if begin >= end || self.size == 0 {
            return self.size;
        }
        let my_end = self.ptr + self.size;
        if begin <= self.ptr {
            if end >= my_end {
                self.size = 0;
            } else if end > self.ptr {
                self.size = my_end - end;
                self.ptr = end;
            }
        } else if begin < my_end {
            self.size = begin - self.ptr;
        }
        self.size
    }
}

/// Facade-level view of one block: the core state machine plus commit and the
/// share-preparation protocol.
struct ManagedBlock<'a> {
    space: &'a AddressSpace,
    block: Block<'a>,
}

impl<'a> ManagedBlock<'a> {
    fn new(space: &'a AddressSpace, addr: usize) -> Result<Self> {
        Ok(Self {
            space,
            block: Block::new(space, addr)?,
        })
    }

    fn address(&self) -> usize {
        self.block.address()
    }

    fn mapped_pages(&mut self) -> Result<[PageState; sys::PAGES_PER_BLOCK]> {
        match self.block.state()? {
            BlockState::Mapped { pages, .. } => Ok(pages),
            BlockState::Reserved { .. } => Err(Error::Internal("mapped block expected")),
        }
    }

    /// Commits `[offset, offset + size)` read-write, creating and wiring a
    /// fresh mapping if the block is still a bare reservation. Returns the OR
    /// of the block's page states after the commit.
    fn commit(&mut self, offset: usize, size: usize) -> Result<u8> {
        if self.block.mapping() == RESERVED {
            let fd = sys::create_mapping().map_err(|_| Error::NoMemory)?;
            let raw = fd.into_raw_fd() as isize;
            match self.block.install_view(raw, ViewKind::Direct, true) {
                Ok(true) => {}
                // Lost the commit race; the winner's mapping serves the block.
                Ok(false) => drop(unsafe { OwnedFd::from_raw_fd(raw as i32) }),
                Err(err) => {
                    drop(unsafe { OwnedFd::from_raw_fd(raw as i32) });
                    return Err(err);
                }
            }
        }
        let pages = self.mapped_pages()?;
        let first = offset / PAGE_SIZE;
        let last = (offset + size + PAGE_SIZE - 1) / PAGE_SIZE;
        let mut page = first;
        let mut changed = false;
        while page < last {
            if pages[page].intersects(PageState::MASK_ACCESS) {
                page += 1;
                continue;
            }
            let start = page;
            while page < last && !pages[page].intersects(PageState::MASK_ACCESS) {
                page += 1;
            }
            sys::protect(
                self.address() + start * PAGE_SIZE,
                (page - start) * PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            )
            .map_err(Error::from_os)?;
            changed = true;
        }
        if changed {
            self.block.invalidate();
        }
        match self.block.state()? {
            BlockState::Mapped { bits, .. } => Ok(bits),
            BlockState::Reserved { .. } => Err(Error::Internal("commit left block reserved")),
        }
    }

    /// Sharing hands out the mapping object, so pages that were privately
    /// copied (disconnected from it) force a rebuild first.
    fn need_remap_to_share(&mut self, offset: usize, size: usize) -> Result<bool> {
        let pages = self.mapped_pages()?;
        for page in offset / PAGE_SIZE..(offset + size + PAGE_SIZE - 1) / PAGE_SIZE {
            if pages[page].intersects(PageState::MASK_UNMAPPED) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Rebuilds the block's mapping object: writes every live page into a
    /// fresh object, rewires the block to it and restores each page's access
    /// class as never-shared.
    fn remap(&mut self) -> Result<()> {
        let pages = self.mapped_pages()?;
        let fd = sys::create_mapping().map_err(|_| Error::NoMemory)?;
        let mut page = 0;
        while page < sys::PAGES_PER_BLOCK {
            if !pages[page].intersects(PageState::MASK_ACCESS) {
                page += 1;
                continue;
            }
            let start = page;
            while page < sys::PAGES_PER_BLOCK && pages[page].intersects(PageState::MASK_ACCESS) {
                page += 1;
            }
            let offset = start * PAGE_SIZE;
            let len = (page - start) * PAGE_SIZE;
            let data =
                unsafe { std::slice::from_raw_parts((self.address() + offset) as *const u8, len) };
            sys::write_mapping(fd.as_raw_fd(), offset, data).map_err(Error::from_os)?;
        }
        let mut desired = [PageState::NOT_COMMITTED; sys::PAGES_PER_BLOCK];
        for (i, state) in pages.iter().enumerate() {
            if state.intersects(PageState::MASK_ACCESS) {
                desired[i] = PageState::mapped(state.intersects(PageState::MASK_RO), false);
            }
        }
        let raw = fd.into_raw_fd() as isize;
        if let Err(err) = self.block.install_view(raw, ViewKind::Direct, false) {
            drop(unsafe { OwnedFd::from_raw_fd(raw as i32) });
            return Err(err);
        }
        log::debug!("block {:#x}: remapped to a fresh object", self.address());
        self.block.apply_page_states(&desired)
    }

    /// Prepares `[offset, offset + size)` for sharing: consolidates private
    /// copies back into an exclusively-owned object if needed, then arms the
    /// in-range pages copy-on-write. A move skips the arming; the source is
    /// torn down as part of the copy.
    fn prepare_to_share(&mut self, offset: usize, size: usize, flags: Flags) -> Result<()> {
        if self.need_remap_to_share(offset, size)? {
            self.remap()?;
        }
        if !flags.contains(Flags::DECOMMIT) {
            self.prepare_to_share_no_remap(offset, size)?;
        }
        Ok(())
    }

    fn prepare_to_share_no_remap(&mut self, offset: usize, size: usize) -> Result<()> {
        let pages = self.mapped_pages()?;
        let mut desired = pages;
        for page in offset / PAGE_SIZE..(offset + size + PAGE_SIZE - 1) / PAGE_SIZE {
            let state = pages[page];
            if state.intersects(PageState::MASK_ACCESS) {
                desired[page] = PageState::mapped(state.intersects(PageState::MASK_RO), true);
            }
        }
        self.block.apply_page_states(&desired)
    }

    /// Copies `size` bytes from `src` (same intra-block offset, same space)
    /// into this block at `offset`, preparing the source block for the share.
    fn copy_range(&mut self, offset: usize, src: usize, size: usize, flags: Flags) -> Result<()> {
        let mut source = ManagedBlock::new(self.space, src)?;
        let src_offset = src - source.address();
        debug_assert_eq!(src_offset, offset);
        source.prepare_to_share(src_offset, size, flags)?;
        self.block.copy(&mut source.block, offset, size, flags)
    }
}

fn commit_no_check(space: &AddressSpace, ptr: usize, size: usize) -> Result<u8> {
    let end = ptr + size;
    let mut bits = 0u8;
    let mut p = ptr;
    while p < end {
        let mut block = ManagedBlock::new(space, p)?;
        let block_end = (block.address() + ALLOCATION_GRANULARITY).min(end);
        bits |= block.commit(p - block.address(), block_end - p)?;
        p = block_end;
    }
    Ok(bits)
}

/// Copies `size` bytes from `src` to `dst` (null: the manager allocates the
/// destination). Shares copy-on-write whenever the alignment allows it, falls
/// back to a physical copy otherwise. Accepted flags:
/// `READ_ONLY | RELEASE | ALLOCATE | EXACTLY`.
pub fn copy(dst: *mut u8, src: *mut u8, size: usize, flags: Flags) -> Result<*mut u8> {
    if size == 0 {
        return Ok(dst);
    }
    if !(Flags::READ_ONLY | Flags::RELEASE | Flags::ALLOCATE | Flags::EXACTLY).contains(flags) {
        return Err(Error::InvFlag);
    }
    let dst = dst as usize;
    let src = src as usize;
    with_space(|space| {
        // The whole source must be committed.
        let src_bits = space.check_committed(src, size)?;
        let src_align = src % ALLOCATION_GRANULARITY;

        let attempt = || -> Result<usize> {
            if dst == 0
                && !flags.contains(Flags::RELEASE)
                && sys::round_up(src + size, ALLOCATION_GRANULARITY) - src
                    <= ALLOCATION_GRANULARITY
            {
                // Quick copy of one block.
                let mut block = ManagedBlock::new(space, src)?;
                block.prepare_to_share(src_align, size, flags)?;
                let base = space.copy(&mut block.block, src_align, size, flags)?;
                return Ok(base + src_align);
            }

            let mut allocated = Region { ptr: 0, size: 0 };
            let mut ret = 0usize;
            if dst == 0 || flags.contains(Flags::ALLOCATE) {
                if dst != 0 {
                    if dst == src {
                        if flags.contains(Flags::EXACTLY) && !flags.contains(Flags::RELEASE) {
                            return Ok(0);
                        }
                    } else {
                        // Try to reserve exactly at dst. The target may
                        // overlap the source; the overlap is already ours.
                        allocated = Region { ptr: dst, size };
                        let cut = allocated.subtract(
                            sys::round_down(src, ALLOCATION_GRANULARITY),
                            sys::round_up(src + size, ALLOCATION_GRANULARITY),
                        );
                        if cut != 0
                            && space.reserve(
                                allocated.size,
                                flags | Flags::EXACTLY,
                                allocated.ptr,
                            )? != 0
                        {
                            ret = dst;
                        } else if flags.contains(Flags::EXACTLY) {
                            return Ok(0);
                        } else {
                            allocated = Region { ptr: 0, size: 0 };
                        }
                    }
                }
                if ret == 0 {
                    if flags.contains(Flags::RELEASE) {
                        // The source itself becomes the destination.
                        ret = src;
                    } else {
                        let fresh = space.reserve(size + src_align, flags, 0)?;
                        ret = fresh + src_align;
                        allocated = Region { ptr: ret, size };
                    }
                }
            } else {
                space.check_allocated(dst, size)?;
                ret = dst;
            }

            if ret == src {
                if flags.contains(Flags::ALLOCATE) && !flags.contains(Flags::RELEASE) {
                    // A fresh destination was demanded but the source is it.
                    return if flags.contains(Flags::EXACTLY) {
                        Ok(0)
                    } else {
                        Err(Error::BadParam)
                    };
                }
                // In-place: at most a protection change.
                let toggle = if flags.contains(Flags::READ_ONLY) {
                    PageState::MASK_RW
                } else {
                    PageState::MASK_RO
                };
                if src_bits & toggle != 0 {
                    space.change_protection(src, size, flags & Flags::READ_ONLY)?;
                }
                return Ok(src);
            }

            let outcome = if ret % ALLOCATION_GRANULARITY == src_align {
                share_directional(space, ret, src, size, flags)
            } else {
                physical_copy(space, ret, src, size, flags)
            };
            if let Err(err) = outcome {
                if allocated.size != 0 {
                    let _ = space.release(allocated.ptr, allocated.size);
                }
                return Err(err);
            }
            Ok(ret)
        };
        match attempt() {
            Ok(addr) => Ok(addr as *mut u8),
            Err(Error::NoMemory) if flags.contains(Flags::EXACTLY) => Ok(std::ptr::null_mut()),
            Err(err) => Err(err),
        }
    })
}

/// Share-based copy of same-aligned ranges, walking blocks in the direction
/// that keeps an overlap intact. The lead-in that would be clobbered is moved
/// with plain decommit teardown so its reservations stay available as the
/// walk's next destinations.
fn share_directional(
    space: &AddressSpace,
    ret: usize,
    src: usize,
    size: usize,
    flags: Flags,
) -> Result<()> {
    if ret < src {
        let end = ret + size;
        let mut pd = ret;
        let mut ps = src;
        if end > src {
            let first_part_end =
                sys::round_up(end - (src + size - end), ALLOCATION_GRANULARITY);
            debug_assert!(first_part_end < end);
            let lead_flags = flags.difference(Flags::RELEASE) | Flags::DECOMMIT;
            while pd < first_part_end {
                let mut block = ManagedBlock::new(space, pd)?;
                let block_end = block.address() + ALLOCATION_GRANULARITY;
                let cb = block_end - pd;
                block.copy_range(pd - block.address(), ps, cb, lead_flags)?;
                pd = block_end;
                ps += cb;
            }
        }
        while pd < end {
            let mut block = ManagedBlock::new(space, pd)?;
            let block_end = (block.address() + ALLOCATION_GRANULARITY).min(end);
            let cb = block_end - pd;
            block.copy_range(pd - block.address(), ps, cb, flags)?;
            pd = block_end;
            ps += cb;
        }
    } else {
        let src_end = src + size;
        let mut pd = ret + size;
        let mut ps = src_end;
        if ret < src_end {
            let first_part_begin =
                sys::round_down(ret + (ret - src), ALLOCATION_GRANULARITY);
            debug_assert!(first_part_begin > ret);
            let lead_flags = flags.difference(Flags::RELEASE) | Flags::DECOMMIT;
            while pd > first_part_begin {
                let block_begin = sys::round_down(pd - 1, ALLOCATION_GRANULARITY);
                let mut block = ManagedBlock::new(space, block_begin)?;
                let cb = pd - block_begin;
                ps -= cb;
                block.copy_range(block_begin - block.address(), ps, cb, lead_flags)?;
                pd = block_begin;
            }
        }
        while pd > ret {
            let mut block_begin = sys::round_down(pd - 1, ALLOCATION_GRANULARITY);
            if block_begin < ret {
                block_begin = ret;
            }
            let mut block = ManagedBlock::new(space, block_begin)?;
            let cb = pd - block_begin;
            ps -= cb;
            block.copy_range(block_begin - block.address(), ps, cb, flags)?;
            pd = block_begin;
        }
    }
    Ok(())
}

/// Byte-moving fallback when the alignments do not line up: commit the
/// destination, drop read-only protection if present, move, reapply, then
/// release or decommit the source with the destination's span subtracted.
fn physical_copy(
    space: &AddressSpace,
    ret: usize,
    src: usize,
    size: usize,
    flags: Flags,
) -> Result<()> {
    let bits = commit_no_check(space, ret, size)?;
    if bits & PageState::MASK_RO != 0 {
        space.change_protection(ret, size, Flags::READ_WRITE)?;
    }
    unsafe {
        std::ptr::copy(src as *const u8, ret as *mut u8, size);
    }
    if flags.contains(Flags::READ_ONLY) {
        space.change_protection(ret, size, Flags::READ_ONLY)?;
    }
    if flags.contains(Flags::DECOMMIT) && ret != src {
        let mut region = Region { ptr: src, size };
        if flags.releases() {
            if region.subtract(
                sys::round_up(ret, ALLOCATION_GRANULARITY),
                sys::round_down(ret + size, ALLOCATION_GRANULARITY),
            ) != 0
            {
                space.release(region.ptr, region.size)?;
            }
        } else if region.subtract(
            sys::round_up(ret, PAGE_SIZE),
            sys::round_down(ret + size, PAGE_SIZE),
        ) != 0
        {
            space.decommit(region.ptr, region.size)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_keeps_the_leading_part() {
        let mut r = Region { ptr: 0x1000, size: 0x3000 };
        // Cut in the middle: the leading part survives.
        assert_eq!(r.subtract(0x2000, 0x3000), 0x1000);
        assert_eq!(r, Region { ptr: 0x1000, size: 0x1000 });
    }

    #[test]
    fn subtract_trims_the_head() {
        let mut r = Region { ptr: 0x1000, size: 0x3000 };
        assert_eq!(r.subtract(0x0000, 0x2000), 0x2000);
        assert_eq!(r, Region { ptr: 0x2000, size: 0x2000 });
    }

    #[test]
    fn subtract_swallows_the_region() {
        let mut r = Region { ptr: 0x1000, size: 0x1000 };
        assert_eq!(r.subtract(0x0000, 0x4000), 0);
    }

    #[test]
    fn subtract_ignores_disjoint_and_empty_cuts() {
        let mut r = Region { ptr: 0x1000, size: 0x1000 };
        assert_eq!(r.subtract(0x4000, 0x5000), 0x1000);
        assert_eq!(r.subtract(0x3000, 0x2000), 0x1000);
        assert_eq!(r, Region { ptr: 0x1000, size: 0x1000 });
    }
}
