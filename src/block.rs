// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-block state machine — page states, view (re)wiring, copy/share protocol
//! OWNERS: @runtime
//! PUBLIC API (crate): PageState, BlockState, Block
//! DEPENDS_ON: directory (slot atomics), sys (views, kernel queries), space
//! INVARIANTS: a block's slot and its kernel-level view transition together; page
//!   states are recoverable from the kernel alone; snapshots are invalidated on
//!   every mutation and recomputed on next read
//!
//! Page-state encoding. The kernel's own report carries the logical state: the
//! protection class comes from the region permissions, "was shared" from the
//! view kind (copy-on-write pieces are `MAP_PRIVATE` windows of the block's
//! object), and "privately copied" from the pagemap. Each state is a distinct
//! bit so the OR of all page states supports mask queries.
//!
//! State transitions:
//! - prepare to share: `RW_MAPPED_PRIVATE` → `RW_MAPPED_SHARED` (write-through
//!   piece becomes copy-on-write); `*_UNMAPPED` pages force a remap first.
//! - remap: `*_MAPPED_SHARED`, `*_UNMAPPED` → `*_MAPPED_PRIVATE` (fresh object,
//!   reconnected).
//! - write protection: toggles within a column (`private`, `shared`,
//!   `unmapped`), never across.

use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};

use crate::directory::{BlockInfo, FREE, RESERVED};
use crate::space::AddressSpace;
use crate::sys::{self, ViewKind, ALLOCATION_GRANULARITY, PAGES_PER_BLOCK, PAGE_SIZE};
use crate::{Error, Flags, Result};

/// Logical state of one page within a mapped block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageState(u8);

impl PageState {
    /// Page of a write-through piece, never committed (block never shared).
    pub const NOT_COMMITTED: PageState = PageState(0x00);
    /// Decommitted page of a copy-on-write piece.
    pub const DECOMMITTED: PageState = PageState(0x01);
    /// Read-write, write-through: the block was never shared here.
    pub const RW_MAPPED_PRIVATE: PageState = PageState(0x02);
    /// Read-write, copy-on-write armed, still reading the object.
    pub const RW_MAPPED_SHARED: PageState = PageState(0x04);
    /// Read-write, privately copied: no longer backed by the object.
    pub const RW_UNMAPPED: PageState = PageState(0x08);
    /// Read-only, write-through.
    pub const RO_MAPPED_PRIVATE: PageState = PageState(0x10);
    /// Read-only, copy-on-write armed.
    pub const RO_MAPPED_SHARED: PageState = PageState(0x20);
    /// Read-only, privately copied.
    pub const RO_UNMAPPED: PageState = PageState(0x40);

    pub const MASK_RW: u8 = 0x02 | 0x04 | 0x08;
    pub const MASK_RO: u8 = 0x10 | 0x20 | 0x40;
    pub const MASK_ACCESS: u8 = Self::MASK_RW | Self::MASK_RO;
    pub const MASK_UNMAPPED: u8 = 0x08 | 0x40;
    pub const MASK_MAPPED: u8 = 0x02 | 0x04 | 0x10 | 0x20;
    pub const MASK_MAY_BE_SHARED: u8 = 0x04 | 0x20 | Self::MASK_UNMAPPED | 0x01;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn intersects(self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    /// Target state for an accessible mapped page.
    pub(crate) fn mapped(read_only: bool, shared: bool) -> PageState {
        match (read_only, shared) {
            (false, false) => Self::RW_MAPPED_PRIVATE,
            (false, true) => Self::RW_MAPPED_SHARED,
            (true, false) => Self::RO_MAPPED_PRIVATE,
            (true, true) => Self::RO_MAPPED_SHARED,
        }
    }

    fn decode(region: &sys::VmRegion, privately_copied: bool) -> PageState {
        let cow = region.private && region.file_backed;
        if !region.read {
            return if cow {
                Self::DECOMMITTED
            } else {
                Self::NOT_COMMITTED
            };
        }
        match (region.write, cow, privately_copied) {
            (true, false, _) => Self::RW_MAPPED_PRIVATE,
            (true, true, false) => Self::RW_MAPPED_SHARED,
            (true, true, true) => Self::RW_UNMAPPED,
            (false, false, _) => Self::RO_MAPPED_PRIVATE,
            (false, true, false) => Self::RO_MAPPED_SHARED,
            (false, true, true) => Self::RO_UNMAPPED,
        }
    }

    /// Native protection this state is expressed with.
    pub(crate) fn prot(self) -> libc::c_int {
        if self.intersects(Self::MASK_RW) {
            libc::PROT_READ | libc::PROT_WRITE
        } else if self.intersects(Self::MASK_RO) {
            libc::PROT_READ
        } else {
            libc::PROT_NONE
        }
    }

    /// Which view kind carries this state.
    pub(crate) fn view_kind(self) -> ViewKind {
        if self.intersects(Self::MASK_MAY_BE_SHARED) {
            ViewKind::Cow
        } else {
            ViewKind::Direct
        }
    }
}

/// Snapshot of a block, recomputed from the kernel on demand.
#[derive(Clone, Copy, Debug)]
pub enum BlockState {
    /// The block is part of a bare reservation spanning `[begin, end)`.
    Reserved { begin: usize, end: usize },
    /// The block carries a view of its mapping object. `bits` is the OR of all
    /// page states, for "does this block contain any X" checks.
    Mapped {
        pages: [PageState; PAGES_PER_BLOCK],
        bits: u8,
    },
}

/// Short-lived borrow of one directory slot plus cached kernel state.
pub struct Block<'a> {
    space: &'a AddressSpace,
    address: usize,
    info: &'a BlockInfo,
    state: Option<BlockState>,
}

impl<'a> Block<'a> {
    /// Fails with `BadParam` when the block is not allocated.
    pub fn new(space: &'a AddressSpace, address: usize) -> Result<Self> {
        let address = sys::round_down(address, ALLOCATION_GRANULARITY);
        let info = space
            .directory()
            .allocated_block(address)
            .ok_or(Error::BadParam)?;
        Ok(Self {
            space,
            address,
            info,
            state: None,
        })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn mapping(&self) -> isize {
        self.info.load()
    }

    pub fn invalidate(&mut self) {
        self.state = None;
    }

    /// Reads the block snapshot, querying the kernel on a cache miss. A block
    /// whose slot holds a mapping fd while the kernel still reports anonymous
    /// memory is mid-transition on another thread; yield and retry.
    pub fn state(&mut self) -> Result<BlockState> {
        if let Some(state) = self.state {
            return Ok(state);
        }
        let block_end = self.address + ALLOCATION_GRANULARITY;
        let snapshot = 'retry: loop {
            let region = self
                .space
                .query(self.address)
                .map_err(Error::from_os)?
                .ok_or(Error::Internal("allocated block is unmapped"))?;
            if self.mapping() > 0 && !region.file_backed {
                std::thread::yield_now();
                continue;
            }
            if !region.file_backed {
                break BlockState::Reserved {
                    begin: region.start,
                    end: region.end,
                };
            }
            let copies = self
                .space
                .private_copy_mask(self.address)
                .map_err(Error::from_os)?;
            let mut pages = [PageState::NOT_COMMITTED; PAGES_PER_BLOCK];
            let mut bits = 0u8;
            let mut region = region;
            loop {
                let piece_end = region.end.min(block_end);
                let first = (region.start.max(self.address) - self.address) / PAGE_SIZE;
                let last = (piece_end - self.address) / PAGE_SIZE;
                for page in first..last {
                    let state = PageState::decode(&region, copies & (1 << page) != 0);
                    pages[page] = state;
                    bits |= state.bits();
                }
                if piece_end == block_end {
                    break;
                }
                region = match self.space.query(piece_end).map_err(Error::from_os)? {
                    Some(next) if next.file_backed => next,
                    // A piece vanished under us; take the snapshot again.
                    _ => {
                        std::thread::yield_now();
                        continue 'retry;
                    }
                };
            }
            break BlockState::Mapped { pages, bits };
        };
        self.state = Some(snapshot);
        Ok(snapshot)
    }

    fn mapped_pages(&mut self) -> Result<[PageState; PAGES_PER_BLOCK]> {
        match self.state()? {
            BlockState::Mapped { pages, .. } => Ok(pages),
            BlockState::Reserved { .. } => Err(Error::BadParam),
        }
    }

    /// Installs `fd` as this block's mapping and maps its view over the block.
    ///
    /// With `commit_only` the slot must still be sentinel-reserved; losing that
    /// race makes the call a no-op (`Ok(false)`) and the caller keeps the
    /// handle. Otherwise the slot is exchanged unconditionally and a previous
    /// mapping is closed (its view is replaced by the fixed map). On success
    /// the directory owns the fd.
    pub(crate) fn install_view(
        &mut self,
        fd: isize,
        kind: ViewKind,
        commit_only: bool,
    ) -> Result<bool> {
        debug_assert!(fd > 0);
        self.invalidate();
        let previous = if commit_only {
            match self.info.compare_exchange(RESERVED, fd) {
                Ok(previous) => previous,
                Err(_) => return Ok(false),
            }
        } else {
            self.info.exchange(fd)
        };
        match previous {
            RESERVED => {}
            FREE => {
                self.info.store(FREE);
                return Err(Error::Internal("mapping installed into a free block"));
            }
            old => {
                drop(unsafe { OwnedFd::from_raw_fd(old as i32) });
            }
        }
        if let Err(err) = sys::map_view(
            fd as i32,
            self.address,
            ALLOCATION_GRANULARITY,
            libc::PROT_NONE,
            kind,
            0,
        ) {
            // On failure the slot never owns the incoming handle; the caller
            // keeps it. A failed fixed map leaves the previous view intact.
            if previous == RESERVED {
                self.info.store(RESERVED);
                return Err(Error::from_os(err));
            }
            self.info.store(FREE);
            return Err(Error::Internal("view replacement failed"));
        }
        log::trace!("block {:#x}: mapping {fd} wired ({kind:?})", self.address);
        Ok(true)
    }

    /// Atomically replaces the slot with `reserve` (FREE or RESERVED). A real
    /// mapping is unmapped and closed (unless `no_close`); with the sentinel
    /// the block's range is re-reserved in the same stroke.
    pub fn unmap(&mut self, reserve: isize, no_close: bool) -> Result<()> {
        let previous = self.info.exchange(reserve);
        if previous == FREE {
            if reserve != FREE {
                self.info.store(FREE);
            }
            return Err(Error::Internal("unmap of a free block"));
        }
        self.invalidate();
        if previous > 0 {
            if reserve == RESERVED {
                sys::reserve_over(self.address, ALLOCATION_GRANULARITY).map_err(Error::from_os)?;
            } else {
                sys::release(self.address, ALLOCATION_GRANULARITY).map_err(Error::from_os)?;
            }
            if !no_close {
                drop(unsafe { OwnedFd::from_raw_fd(previous as i32) });
            }
        }
        Ok(())
    }

    /// Whether any page outside `[offset, offset + size)` intersects `mask`.
    /// Pages straddling the boundary count as outside.
    pub fn has_data_outside_of(&mut self, offset: usize, size: usize, mask: u8) -> Result<bool> {
        let offset_end = offset + size;
        debug_assert!(offset_end <= ALLOCATION_GRANULARITY);
        if offset == 0 && size == ALLOCATION_GRANULARITY {
            return Ok(false);
        }
        let pages = match self.state()? {
            BlockState::Mapped { pages, .. } => pages,
            BlockState::Reserved { .. } => return Ok(false),
        };
        if offset > 0 {
            for page in 0..(offset + PAGE_SIZE - 1) / PAGE_SIZE {
                if pages[page].intersects(mask) {
                    return Ok(true);
                }
            }
        }
        if offset_end < ALLOCATION_GRANULARITY {
            for page in offset_end / PAGE_SIZE..PAGES_PER_BLOCK {
                if pages[page].intersects(mask) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// A copy is a move when the source surrenders the range: `DECOMMIT` plus
    /// either `RELEASE` or nothing else alive in the source block.
    pub fn can_move(&mut self, offset: usize, size: usize, flags: Flags) -> Result<bool> {
        if !flags.contains(Flags::DECOMMIT) {
            return Ok(false);
        }
        if flags.releases() {
            return Ok(true);
        }
        Ok(!self.has_data_outside_of(offset, size, PageState::MASK_ACCESS)?)
    }

    /// Copies `[offset, offset + size)` of `src` into the same offsets here.
    /// Decides whether the block can be rewired to the source's mapping or
    /// already shares it; rewiring with live data outside the range would drop
    /// that data and is refused.
    pub fn copy(
        &mut self,
        src: &mut Block<'_>,
        offset: usize,
        size: usize,
        flags: Flags,
    ) -> Result<()> {
        debug_assert!(size > 0 && offset + size <= ALLOCATION_GRANULARITY);
        debug_assert!(self.address != src.address);
        let src_mapping = src.mapping();
        if src_mapping <= 0 {
            return Err(Error::Internal("copy source has no mapping"));
        }
        let remap = match self.mapping() {
            RESERVED => true,
            FREE => return Err(Error::Internal("copy into a free block")),
            mapping => {
                if sys::same_mapping(mapping as i32, src_mapping as i32).map_err(Error::from_os)? {
                    false
                } else {
                    if self.has_data_outside_of(offset, size, PageState::MASK_ACCESS)? {
                        return Err(Error::Internal("rewire would drop live data"));
                    }
                    true
                }
            }
        };
        let mv = src.can_move(offset, size, flags)?;
        self.copy_inner(remap, mv, src, offset, size, flags)
    }

    pub(crate) fn copy_inner(
        &mut self,
        remap: bool,
        mv: bool,
        src: &mut Block<'_>,
        offset: usize,
        size: usize,
        flags: Flags,
    ) -> Result<()> {
        let first = offset / PAGE_SIZE;
        let last = (offset + size + PAGE_SIZE - 1) / PAGE_SIZE;
        let read_only = flags.contains(Flags::READ_ONLY);
        let mut desired = [PageState::DECOMMITTED; PAGES_PER_BLOCK];
        let mut direct_rewire = false;
        if mv {
            // The source hands its pages over: each target page inherits the
            // source page's shared marker.
            let src_pages = src.mapped_pages()?;
            for page in first..last {
                let shared = src_pages[page].intersects(PageState::MASK_MAY_BE_SHARED);
                desired[page] = PageState::mapped(read_only, shared);
            }
            direct_rewire = self.space.is_current();
        } else {
            for page in first..last {
                desired[page] = PageState::mapped(read_only, true);
            }
        }

        if remap {
            let kind = if mv { ViewKind::Direct } else { ViewKind::Cow };
            if direct_rewire {
                self.install_view(src.mapping(), kind, false)?;
            } else {
                let dup =
                    sys::duplicate_mapping(src.mapping() as i32).map_err(|_| Error::NoMemory)?;
                let raw = dup.into_raw_fd() as isize;
                if let Err(err) = self.install_view(raw, kind, false) {
                    drop(unsafe { OwnedFd::from_raw_fd(raw as i32) });
                    return Err(err);
                }
            }
        }

        if flags.contains(Flags::DECOMMIT) {
            if flags.releases() {
                src.unmap(FREE, direct_rewire)?;
            } else if mv {
                src.unmap(RESERVED, direct_rewire)?;
            } else {
                src.decommit(offset, size)?;
            }
        }

        self.apply_page_states(&desired)
    }

    /// Walks the desired page-state vector and applies every maximal run that
    /// differs in access class. Runs whose view kind changes, or that must
    /// drop a private copy to reconnect to the object, are rewired by a fixed
    /// per-piece map; the rest is a plain protection change.
    pub(crate) fn apply_page_states(
        &mut self,
        desired: &[PageState; PAGES_PER_BLOCK],
    ) -> Result<()> {
        let current = match self.state()? {
            BlockState::Mapped { pages, .. } => pages,
            BlockState::Reserved { .. } => {
                return Err(Error::Internal("page states applied to a reserved block"))
            }
        };
        let mapping = self.mapping();
        let mut changed = false;
        let mut page = 0;
        while page < PAGES_PER_BLOCK {
            let want = desired[page];
            if (current[page].bits() ^ want.bits()) & PageState::MASK_ACCESS == 0 {
                page += 1;
                continue;
            }
            let start = page;
            let mut rewire = false;
            while page < PAGES_PER_BLOCK && desired[page] == want {
                let have = current[page];
                if have.view_kind() != want.view_kind()
                    || have.intersects(PageState::MASK_UNMAPPED)
                {
                    rewire = true;
                }
                page += 1;
            }
            let addr = self.address + start * PAGE_SIZE;
            let len = (page - start) * PAGE_SIZE;
            if rewire {
                if mapping <= 0 {
                    return Err(Error::Internal("page rewire without a mapping"));
                }
                sys::map_view(
                    mapping as i32,
                    addr,
                    len,
                    want.prot(),
                    want.view_kind(),
                    start * PAGE_SIZE,
                )
                .map_err(Error::from_os)?;
            } else {
                sys::protect(addr, len, want.prot()).map_err(Error::from_os)?;
            }
            changed = true;
        }
        if changed {
            self.invalidate();
        }
        Ok(())
    }

    /// Toggles a byte range between read-write and read-only. The range is
    /// rounded inward for read-only (only whole pages fully requested) and
    /// outward for read-write. Protection-only: private copies survive.
    pub fn change_protection(&mut self, offset: usize, size: usize, flags: Flags) -> Result<()> {
        debug_assert!(size > 0 && offset + size <= ALLOCATION_GRANULARITY);
        const STATES_RW: [PageState; 3] = [
            PageState::RW_MAPPED_PRIVATE,
            PageState::RW_MAPPED_SHARED,
            PageState::RW_UNMAPPED,
        ];
        const STATES_RO: [PageState; 3] = [
            PageState::RO_MAPPED_PRIVATE,
            PageState::RO_MAPPED_SHARED,
            PageState::RO_UNMAPPED,
        ];
        let read_only = flags.contains(Flags::READ_ONLY);
        let (keep_mask, from, to, first, last) = if read_only {
            (
                PageState::MASK_RO,
                &STATES_RW,
                &STATES_RO,
                sys::round_up(offset, PAGE_SIZE) / PAGE_SIZE,
                sys::round_down(offset + size, PAGE_SIZE) / PAGE_SIZE,
            )
        } else {
            (
                PageState::MASK_RW,
                &STATES_RO,
                &STATES_RW,
                sys::round_down(offset, PAGE_SIZE) / PAGE_SIZE,
                sys::round_up(offset + size, PAGE_SIZE) / PAGE_SIZE,
            )
        };
        if first >= last {
            return Ok(());
        }
        let pages = self.mapped_pages()?;
        let mut changed = false;
        let mut page = first;
        while page < last {
            let state = pages[page];
            let start = page;
            while page < last && pages[page] == state {
                page += 1;
            }
            if state.intersects(keep_mask) {
                continue;
            }
            let mut new_state = state;
            for i in 0..from.len() {
                if from[i] == state {
                    new_state = to[i];
                    break;
                }
            }
            if new_state != state {
                sys::protect(
                    self.address + start * PAGE_SIZE,
                    (page - start) * PAGE_SIZE,
                    new_state.prot(),
                )
                .map_err(Error::from_os)?;
                changed = true;
            }
        }
        if changed {
            self.invalidate();
        }
        Ok(())
    }

    /// The block must be mapped and every page in range accessible; returns
    /// the OR of all page states in the block for the caller to inspect once.
    pub fn check_committed(&mut self, offset: usize, size: usize) -> Result<u8> {
        debug_assert!(offset + size <= ALLOCATION_GRANULARITY);
        let (pages, bits) = match self.state()? {
            BlockState::Mapped { pages, bits } => (pages, bits),
            BlockState::Reserved { .. } => return Err(Error::BadParam),
        };
        for page in offset / PAGE_SIZE..(offset + size + PAGE_SIZE - 1) / PAGE_SIZE {
            if !pages[page].intersects(PageState::MASK_ACCESS) {
                return Err(Error::BadParam);
            }
        }
        Ok(bits)
    }

    /// Decommits whole pages of `[offset, offset + size)`. A range covering
    /// every accessible page lets the whole view go back to a bare
    /// reservation; otherwise the sub-range is remapped to inaccessible
    /// copy-on-write pieces, which both discards private copies and releases
    /// the physical pages.
    pub fn decommit(&mut self, offset: usize, size: usize) -> Result<()> {
        let offset = sys::round_up(offset, PAGE_SIZE);
        let offset_end = sys::round_down(offset + size, PAGE_SIZE);
        debug_assert!(offset_end <= ALLOCATION_GRANULARITY);
        if offset >= offset_end {
            return Ok(());
        }
        if offset == 0 && offset_end == ALLOCATION_GRANULARITY {
            return self.unmap(RESERVED, false);
        }
        match self.state()? {
            BlockState::Reserved { begin, end } => {
                log::trace!(
                    "decommit of {:#x}: already bare within reservation {begin:#x}..{end:#x}",
                    self.address
                );
                Ok(())
            }
            BlockState::Mapped { .. } => {
                if !self.has_data_outside_of(offset, offset_end - offset, PageState::MASK_ACCESS)? {
                    self.unmap(RESERVED, false)
                } else {
                    let mapping = self.mapping();
                    if mapping <= 0 {
                        return Err(Error::Internal("decommit without a mapping"));
                    }
                    sys::map_view(
                        mapping as i32,
                        self.address + offset,
                        offset_end - offset,
                        libc::PROT_NONE,
                        ViewKind::Cow,
                        offset,
                    )
                    .map_err(Error::from_os)?;
                    self.invalidate();
                    Ok(())
                }
            }
        }
    }

    /// Both blocks mapped, same object, and every page in range accessible
    /// and still connected to it.
    pub fn is_copy(&mut self, other: &mut Block<'_>, offset: usize, size: usize) -> Result<bool> {
        let mine = match self.state()? {
            BlockState::Mapped { pages, .. } => pages,
            BlockState::Reserved { .. } => return Ok(false),
        };
        let theirs = match other.state()? {
            BlockState::Mapped { pages, .. } => pages,
            BlockState::Reserved { .. } => return Ok(false),
        };
        let (a, b) = (self.mapping(), other.mapping());
        if a <= 0 || b <= 0 || !sys::same_mapping(a as i32, b as i32).map_err(Error::from_os)? {
            return Ok(false);
        }
        for page in offset / PAGE_SIZE..(offset + size + PAGE_SIZE - 1) / PAGE_SIZE {
            let (x, y) = (mine[page], theirs[page]);
            if (x.bits() | y.bits()) & PageState::MASK_UNMAPPED != 0 {
                return Ok(false);
            }
            if !x.intersects(PageState::MASK_ACCESS) || !y.intersects(PageState::MASK_ACCESS) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(read: bool, write: bool, private: bool, file_backed: bool) -> sys::VmRegion {
        sys::VmRegion {
            start: 0,
            end: PAGE_SIZE,
            read,
            write,
            private,
            file_backed,
        }
    }

    #[test]
    fn decode_covers_all_states() {
        assert_eq!(
            PageState::decode(&region(false, false, false, true), false),
            PageState::NOT_COMMITTED
        );
        assert_eq!(
            PageState::decode(&region(false, false, true, true), false),
            PageState::DECOMMITTED
        );
        assert_eq!(
            PageState::decode(&region(true, true, false, true), false),
            PageState::RW_MAPPED_PRIVATE
        );
        assert_eq!(
            PageState::decode(&region(true, true, true, true), false),
            PageState::RW_MAPPED_SHARED
        );
        assert_eq!(
            PageState::decode(&region(true, true, true, true), true),
            PageState::RW_UNMAPPED
        );
        assert_eq!(
            PageState::decode(&region(true, false, false, true), false),
            PageState::RO_MAPPED_PRIVATE
        );
        assert_eq!(
            PageState::decode(&region(true, false, true, true), false),
            PageState::RO_MAPPED_SHARED
        );
        assert_eq!(
            PageState::decode(&region(true, false, true, true), true),
            PageState::RO_UNMAPPED
        );
    }

    #[test]
    fn masks_partition_the_states() {
        let states = [
            PageState::DECOMMITTED,
            PageState::RW_MAPPED_PRIVATE,
            PageState::RW_MAPPED_SHARED,
            PageState::RW_UNMAPPED,
            PageState::RO_MAPPED_PRIVATE,
            PageState::RO_MAPPED_SHARED,
            PageState::RO_UNMAPPED,
        ];
        let all: u8 = states.iter().fold(0, |acc, s| acc | s.bits());
        assert_eq!(
            all,
            PageState::MASK_ACCESS | PageState::DECOMMITTED.bits()
        );
        // Copy-on-write pieces carry exactly the may-be-shared states.
        for state in states {
            let cow = state.view_kind() == ViewKind::Cow;
            assert_eq!(cow, state.intersects(PageState::MASK_MAY_BE_SHARED));
        }
        assert_eq!(PageState::NOT_COMMITTED.view_kind(), ViewKind::Direct);
    }

    #[test]
    fn mapped_state_selection() {
        assert_eq!(PageState::mapped(false, false), PageState::RW_MAPPED_PRIVATE);
        assert_eq!(PageState::mapped(false, true), PageState::RW_MAPPED_SHARED);
        assert_eq!(PageState::mapped(true, false), PageState::RO_MAPPED_PRIVATE);
        assert_eq!(PageState::mapped(true, true), PageState::RO_MAPPED_SHARED);
    }
}
