// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Protection-domain virtual-memory manager over the host kernel's mapping primitives
//! OWNERS: @runtime
//! PUBLIC API: initialize/terminate, allocate/release/commit/decommit, copy, change_protection,
//!   is_readable/is_writable/is_private/is_copy, query, classify_fault, AddressSpace::attach
//! DEPENDS_ON: libc (mmap/mprotect/memfd), /proc/<pid>/maps + pagemap, bitflags, thiserror,
//!   parking_lot, log
//! INVARIANTS: every granularity block is owned by exactly one directory slot; slot transitions
//!   are atomic; a slot holding a mapping fd implies a view of that mapping is installed at the
//!   block's base address
//! ADR: docs/adr/0001-memspace-architecture.md
//!
//! The manager presents a byte-granular, copy-on-write-capable address space on
//! top of block-granular kernel mappings. Address ranges are reserved in units
//! of [`ALLOCATION_GRANULARITY`] and committed in units of [`PAGE_SIZE`]. Every
//! reserved block is tracked in a process-shared directory (attachable by a
//! supervisor via [`AddressSpace::attach`]); every mapped block is backed by its
//! own sparse memory object, so sharing a range is a matter of rewiring block
//! views rather than moving bytes.

use std::io;

use bitflags::bitflags;
use thiserror::Error;

mod block;
mod directory;
mod memory;
mod space;
mod sys;

pub use block::PageState;
pub use memory::{
    allocate, change_protection, classify_fault, commit, copy, decommit, initialize, is_copy,
    is_private, is_readable, is_writable, query, release, terminate,
};
pub use space::AddressSpace;
pub use sys::{ALLOCATION_GRANULARITY, PAGE_SIZE, PAGES_PER_BLOCK};

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by memory operations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Invalid address, size or an unallocated range.
    #[error("invalid parameter")]
    BadParam,
    /// A flag bit outside the subset accepted by the operation.
    #[error("flag not accepted by this operation")]
    InvFlag,
    /// The kernel refused to reserve, map, commit or duplicate.
    #[error("out of memory")]
    NoMemory,
    /// Access touched a page that is not committed.
    #[error("memory not committed")]
    MemNotCommitted,
    /// Write to a read-only page.
    #[error("no write permission")]
    NoPermission,
    /// Invariant violation inside the manager.
    #[error("internal error: {0}")]
    Internal(&'static str),
    /// Directory or address-space setup failed.
    #[error("initialization failed: {0}")]
    Initialize(&'static str),
    /// The operation is not available for this address space (foreign process).
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Maps a shim-level OS error to the public error kind. Resource
    /// exhaustion becomes [`Error::NoMemory`]; anything else is an invariant
    /// breach because callers pre-validate addresses and own their blocks.
    pub(crate) fn from_os(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::EAGAIN)
            | Some(libc::ENOSPC) => Error::NoMemory,
            _ => Error::Internal("unexpected os error"),
        }
    }
}

bitflags! {
    /// Flag set accepted by [`allocate`], [`copy`] and [`change_protection`].
    ///
    /// Each operation validates the subset it understands and fails with
    /// [`Error::InvFlag`] on anything else.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Protect the affected range read-only.
        const READ_ONLY = 0x0001;
        /// Reserve address space without committing it.
        const RESERVED = 0x0002;
        /// Fail by returning null instead of `NoMemory`; for `allocate` the
        /// destination hint is honored exactly (not rounded down).
        const EXACTLY = 0x0004;
        /// `copy`: the destination must be newly reserved.
        const ALLOCATE = 0x0008;
        /// Fresh pages are guaranteed to read as zero. Always true here:
        /// mappings are sparse memory objects.
        const ZERO_INIT = 0x0010;
        /// `copy`: decommit the source sub-range after the copy.
        const DECOMMIT = 0x0020;
        /// `copy`: decommit and release the affected source blocks.
        const RELEASE = 0x0040 | 0x0020;
    }
}

impl Flags {
    /// Protect the affected range read-write. The empty selector: read-write
    /// is the default protection.
    pub const READ_WRITE: Flags = Flags::empty();

    /// True when the release bit (beyond plain decommit) is present.
    pub(crate) fn releases(self) -> bool {
        self.intersects(Flags::RELEASE.difference(Flags::DECOMMIT))
    }
}

bitflags! {
    /// Capability set reported by [`query`] for [`QueryParam::Flags`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// `is_readable`/`is_writable` reflect hardware state.
        const ACCESS_CHECK = 0x01;
        /// Protection changes are enforced by the MMU.
        const HARDWARE_PROTECTION = 0x02;
        /// `copy` shares pages copy-on-write where possible.
        const COPY_ON_WRITE = 0x04;
        /// Address ranges can be reserved without being committed.
        const SPACE_RESERVATION = 0x08;
    }
}

/// Parameters understood by [`query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryParam {
    /// Lowest address the manager will ever hand out.
    AllocationSpaceBegin,
    /// One past the highest manageable address.
    AllocationSpaceEnd,
    /// Reservation and sharing unit ([`ALLOCATION_GRANULARITY`]).
    AllocationUnit,
    /// Commit unit ([`PAGE_SIZE`]).
    CommitUnit,
    /// Protection unit ([`PAGE_SIZE`]).
    ProtectionUnit,
    /// Capability bit-set, see [`Capabilities`].
    Flags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_implies_decommit() {
        assert!(Flags::RELEASE.contains(Flags::DECOMMIT));
        assert!(Flags::RELEASE.releases());
        assert!(!Flags::DECOMMIT.releases());
        assert!(Flags::READ_WRITE.is_empty());
    }

    #[test]
    fn os_error_mapping() {
        let nomem = io::Error::from_raw_os_error(libc::ENOMEM);
        assert_eq!(Error::from_os(nomem), Error::NoMemory);
        let eperm = io::Error::from_raw_os_error(libc::EPERM);
        assert!(matches!(Error::from_os(eperm), Error::Internal(_)));
    }
}
