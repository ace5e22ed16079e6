// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-VM shim — thin wrappers over the kernel's mapping primitives
//! OWNERS: @runtime
//! PUBLIC API (crate): reserve/release/protect/map_view, memory-object lifecycle,
//!   /proc maps + pagemap readers
//! DEPENDS_ON: libc, /proc filesystem
//! INVARIANTS: all addresses handed to the kernel are page-aligned; every function
//!   either succeeds or reports the raw OS error untouched

use std::ffi::CString;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;

/// Protection and commit unit.
pub const PAGE_SIZE: usize = 4096;
/// Reservation, mapping and sharing unit.
pub const ALLOCATION_GRANULARITY: usize = 0x1_0000;
/// Pages per granularity block.
pub const PAGES_PER_BLOCK: usize = ALLOCATION_GRANULARITY / PAGE_SIZE;

/// Architectural ceiling of the user address space; the directory is sized to
/// index every block below it.
#[cfg(target_pointer_width = "64")]
pub const MAX_USER_ADDRESS: usize = 0x7fff_ffff_f000;
#[cfg(target_pointer_width = "32")]
pub const MAX_USER_ADDRESS: usize = 0xbfff_f000;

/// Lowest address the kernel will map for us (mmap_min_addr).
pub const MIN_USER_ADDRESS: usize = 0x1_0000;

pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// How a view of a memory object is wired to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewKind {
    /// Write-through: stores land in the object.
    Direct,
    /// Copy-on-write: the first store disconnects the page into a private copy.
    Cow,
}

impl ViewKind {
    fn map_flag(self) -> libc::c_int {
        match self {
            ViewKind::Direct => libc::MAP_SHARED,
            ViewKind::Cow => libc::MAP_PRIVATE,
        }
    }
}

/// One kernel-reported region, as recovered from `/proc/<pid>/maps`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmRegion {
    pub start: usize,
    pub end: usize,
    pub read: bool,
    pub write: bool,
    /// Copy-on-write mapping (`p` flag).
    pub private: bool,
    /// Backed by a memory object rather than anonymous.
    pub file_backed: bool,
}

fn parse_maps_line(line: &str) -> Option<VmRegion> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let inode: u64 = fields.next()?.parse().ok()?;

    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let perms = perms.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    Some(VmRegion {
        start,
        end,
        read: perms[0] == b'r',
        write: perms[1] == b'w',
        private: perms[3] == b'p',
        file_backed: inode != 0,
    })
}

/// Finds the region containing `addr`, or `None` if the address is unmapped.
pub fn query(pid: u32, addr: usize) -> io::Result<Option<VmRegion>> {
    let file = File::open(format!("/proc/{pid}/maps"))?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let Some(region) = parse_maps_line(&line) else {
            continue;
        };
        if addr < region.start {
            return Ok(None);
        }
        if addr < region.end {
            return Ok(Some(region));
        }
    }
    Ok(None)
}

fn mmap(
    addr: usize,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: RawFd,
    offset: usize,
) -> io::Result<usize> {
    let p = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            prot,
            flags,
            fd,
            offset as libc::off_t,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(p as usize)
}

/// Reserves a granularity-aligned range wherever the kernel finds room. The
/// kernel only guarantees page alignment, so a padded span is trimmed down.
pub fn reserve_anywhere(size: usize, hint: usize) -> io::Result<usize> {
    const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let span = size + ALLOCATION_GRANULARITY - PAGE_SIZE;
    let p = mmap(hint, span, libc::PROT_NONE, FLAGS, -1, 0)?;
    let aligned = round_up(p, ALLOCATION_GRANULARITY);
    if aligned > p {
        release(p, aligned - p)?;
    }
    let tail = p + span - (aligned + size);
    if tail > 0 {
        release(aligned + size, tail)?;
    }
    Ok(aligned)
}

/// Reserves exactly `[addr, addr + size)`. `Ok(false)` means the range (or a
/// part of it) is already occupied.
pub fn reserve_at(addr: usize, size: usize) -> io::Result<bool> {
    const FLAGS: libc::c_int = libc::MAP_PRIVATE
        | libc::MAP_ANONYMOUS
        | libc::MAP_NORESERVE
        | libc::MAP_FIXED_NOREPLACE;
    match mmap(addr, size, libc::PROT_NONE, FLAGS, -1, 0) {
        Ok(p) => {
            // Pre-4.17 kernels ignore NOREPLACE and relocate instead.
            if p != addr {
                release(p, size)?;
                return Ok(false);
            }
            Ok(true)
        }
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Atomically replaces whatever is mapped at `[addr, addr + size)` with a bare
/// reservation.
pub fn reserve_over(addr: usize, size: usize) -> io::Result<()> {
    const FLAGS: libc::c_int =
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED;
    mmap(addr, size, libc::PROT_NONE, FLAGS, -1, 0).map(|_| ())
}

pub fn release(addr: usize, size: usize) -> io::Result<()> {
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn protect(addr: usize, size: usize, prot: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Installs a view piece of a memory object at a fixed address, replacing
/// whatever was mapped there.
pub fn map_view(
    fd: RawFd,
    addr: usize,
    size: usize,
    prot: libc::c_int,
    kind: ViewKind,
    offset: usize,
) -> io::Result<()> {
    mmap(addr, size, prot, kind.map_flag() | libc::MAP_FIXED, fd, offset).map(|_| ())
}

/// Maps a read-write shared window of an object wherever the kernel likes.
/// Used for directory leaves; page alignment is sufficient there.
pub fn map_object_anywhere(fd: RawFd, size: usize, offset: usize) -> io::Result<usize> {
    mmap(
        0,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        offset,
    )
}

/// Anonymous zero-filled read-write array, physically backed only where
/// touched.
pub fn map_anon_array(size: usize) -> io::Result<usize> {
    const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    mmap(0, size, libc::PROT_READ | libc::PROT_WRITE, FLAGS, -1, 0)
}

/// Slot 0 doubles as the directory's "free" marker, so mapping fds must stay
/// off it. Only reachable with stdin closed.
fn off_slot_zero(fd: OwnedFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() != 0 {
        return Ok(fd);
    }
    duplicate_mapping(fd.as_raw_fd())
}

/// Creates a fresh sparse memory object of one block. Never-written pages read
/// as zero.
pub fn create_mapping() -> io::Result<OwnedFd> {
    let name = CString::new("memspace-block").unwrap();
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = off_slot_zero(unsafe { OwnedFd::from_raw_fd(fd) })?;
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), ALLOCATION_GRANULARITY as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Duplicates a mapping handle. The duplicate references the same object.
pub fn duplicate_mapping(fd: RawFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 1) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Whether two handles reference the same memory object.
pub fn same_mapping(a: RawFd, b: RawFd) -> io::Result<bool> {
    fn identity(fd: RawFd) -> io::Result<(libc::dev_t, libc::ino_t)> {
        let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let st = unsafe { st.assume_init() };
        Ok((st.st_dev, st.st_ino))
    }
    Ok(identity(a)? == identity(b)?)
}

/// Writes page contents into a memory object at the given offset.
pub fn write_mapping(fd: RawFd, mut offset: usize, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let n = unsafe {
            libc::pwrite(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        offset += n as usize;
        data = &data[n as usize..];
    }
    Ok(())
}

/// Creates the named directory object, replacing a stale one left behind by a
/// recycled pid.
pub fn shm_create(name: &str, size: u64) -> io::Result<OwnedFd> {
    let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut attempts = 0;
    let fd = loop {
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd >= 0 {
            break fd;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) && attempts == 0 {
            attempts += 1;
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            continue;
        }
        return Err(err);
    };
    let fd = off_slot_zero(unsafe { OwnedFd::from_raw_fd(fd) })?;
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Opens an existing named directory object with full access.
pub fn shm_attach(name: &str) -> io::Result<OwnedFd> {
    let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    off_slot_zero(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn shm_unlink(name: &str) {
    if let Ok(cname) = CString::new(name) {
        unsafe { libc::shm_unlink(cname.as_ptr()) };
    }
}

pub fn open_pagemap(pid: u32) -> io::Result<File> {
    File::open(format!("/proc/{pid}/pagemap"))
}

/// A page of a copy-on-write view counts as privately copied once it is backed
/// by anonymous memory (resident or swapped) instead of the object.
fn privately_copied(entry: u64) -> bool {
    const PRESENT: u64 = 1 << 63;
    const SWAPPED: u64 = 1 << 62;
    const FILE_BACKED: u64 = 1 << 61;
    if entry & SWAPPED != 0 {
        return true;
    }
    entry & PRESENT != 0 && entry & FILE_BACKED == 0
}

fn read_entries(pagemap: &File, addr: usize, buf: &mut [u64]) -> io::Result<()> {
    let bytes = unsafe {
        std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, std::mem::size_of_val(buf))
    };
    pagemap.read_exact_at(bytes, (addr / PAGE_SIZE * 8) as u64)?;
    for e in buf.iter_mut() {
        *e = u64::from_le(*e);
    }
    Ok(())
}

/// Per-page "privately copied" bits for up to one block, lowest page first.
pub fn private_copy_mask(pagemap: &File, addr: usize, pages: usize) -> io::Result<u16> {
    debug_assert!(pages <= PAGES_PER_BLOCK);
    let mut entries = [0u64; PAGES_PER_BLOCK];
    read_entries(pagemap, addr, &mut entries[..pages])?;
    let mut mask = 0u16;
    for (i, e) in entries[..pages].iter().enumerate() {
        if privately_copied(*e) {
            mask |= 1 << i;
        }
    }
    Ok(mask)
}

/// True if any page in the range still reads through to its backing object
/// (i.e. has not been privately copied).
pub fn has_connected_page(pagemap: &File, mut addr: usize, mut pages: usize) -> io::Result<bool> {
    let mut entries = [0u64; 64];
    while pages > 0 {
        let chunk = pages.min(entries.len());
        read_entries(pagemap, addr, &mut entries[..chunk])?;
        if entries[..chunk].iter().any(|e| !privately_copied(*e)) {
            return Ok(true);
        }
        addr += chunk * PAGE_SIZE;
        pages -= chunk;
    }
    Ok(false)
}
