//! CONTEXT: Integration tests for the protection-domain memory facade
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_SCOPE:
//!   - reservation, commit, decommit and release life cycle
//!   - copy-on-write sharing, private write isolation, copy relation
//!   - move semantics (overlapping shifts, ownership transfer)
//!   - protection toggling and fault classification
//!   - supervisor attach (introspection only)
//!
//! TEST_SCENARIOS:
//!   - allocate_release_reuse(): released ranges are reusable at the same address
//!   - commit_decommit_cycle(): commit/decommit are idempotent, fresh pages read zero
//!   - share_and_resync(): shared blocks stay isolated under writes and resync via copy
//!   - shifting_move_preserves_data(): overlapping block-aligned moves transfer ownership
//!   - small_block_copies(): one-block quick copies across all flag combinations
//!   - copy_from_read_only_source(): read-only sources copy physically where needed
//!
//! The facade is a process-wide singleton, so every test serializes on one
//! lock and owns the address space for its duration.

use std::ptr;
use std::sync::{Mutex, MutexGuard, OnceLock};

use nexus_memspace::{
    allocate, change_protection, classify_fault, commit, copy, decommit, initialize, is_copy,
    is_private, is_readable, is_writable, query, release, terminate, AddressSpace, Capabilities,
    Error, Flags, QueryParam, ALLOCATION_GRANULARITY as G, PAGE_SIZE as P,
};

fn lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serialized facade session: initializes on entry, terminates on drop (also
/// when the test panics, so later tests start clean).
struct Session(#[allow(dead_code)] MutexGuard<'static, ()>);

impl Session {
    fn begin() -> Self {
        let guard = lock();
        initialize().expect("initialize");
        Session(guard)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        terminate();
    }
}

fn bytes<'a>(ptr: *mut u8, len: usize) -> &'a mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(ptr, len) }
}

fn words<'a>(ptr: *mut u8, len: usize) -> &'a mut [u32] {
    assert_eq!(ptr as usize % 4, 0);
    unsafe { std::slice::from_raw_parts_mut(ptr as *mut u32, len / 4) }
}

/// Read through read-only mappings without forming a mutable reference.
fn peek(ptr: *mut u8) -> u32 {
    assert_eq!(ptr as usize % 4, 0);
    unsafe { (ptr as *const u32).read() }
}

/// Fixed arenas keep reuse-at-same-address assertions away from the region
/// where the kernel places stacks and ordinary mappings.
const ARENA_A: *mut u8 = 0x6000_0000_0000 as *mut u8;
const ARENA_B: *mut u8 = 0x6100_0000_0000 as *mut u8;

#[test]
fn allocate_release_reuse() {
    let _session = Session::begin();
    const SIZE: usize = 256 * G;

    for flags in [Flags::READ_WRITE | Flags::RESERVED, Flags::READ_WRITE] {
        let flags = flags | Flags::EXACTLY;
        let block = allocate(ARENA_A, SIZE, flags).unwrap();
        assert_eq!(block, ARENA_A);
        release(block, SIZE).unwrap();

        // The released range is immediately reusable at the same address.
        assert_eq!(allocate(block, SIZE, flags).unwrap(), block);

        release(block, SIZE / 2).unwrap();
        release(block.wrapping_add(SIZE / 2), SIZE / 2).unwrap();
        assert_eq!(allocate(block, SIZE, flags).unwrap(), block);

        // Release out of order: center first, then the outer quarters.
        release(block.wrapping_add(SIZE / 4), SIZE / 2).unwrap();
        release(block, SIZE / 4).unwrap();
        release(block.wrapping_add(SIZE / 4 * 3), SIZE / 4).unwrap();

        assert_eq!(allocate(block, SIZE / 2, flags).unwrap(), block);
        assert_eq!(
            allocate(block.wrapping_add(SIZE / 2), SIZE / 2, flags).unwrap(),
            block.wrapping_add(SIZE / 2)
        );
        release(block, SIZE).unwrap();

        assert_eq!(allocate(block, SIZE, flags).unwrap(), block);
        release(block, SIZE).unwrap();
    }
}

#[test]
fn releasing_an_unallocated_range_is_refused() {
    let _session = Session::begin();
    let block = allocate(ptr::null_mut(), 4 * G, Flags::RESERVED).unwrap();
    // The second half of the probe range was never allocated.
    assert_eq!(
        release(block.wrapping_add(2 * G), 4 * G),
        Err(Error::BadParam)
    );
    release(block, 4 * G).unwrap();
}

#[test]
fn commit_decommit_cycle() {
    let _session = Session::begin();
    const SIZE: usize = 64 * G;

    let block = allocate(ptr::null_mut(), SIZE, Flags::READ_WRITE | Flags::RESERVED).unwrap();
    assert!(!block.is_null());

    // Reserved but not committed: any access would fault as not-committed.
    assert!(!is_readable(block, SIZE).unwrap());
    assert_eq!(classify_fault(block, true), Error::MemNotCommitted);

    commit(block, SIZE).unwrap();
    assert!(is_writable(block, SIZE).unwrap());

    let data = words(block, SIZE);
    let mut x: u32 = 0x9e37_79b9;
    for word in data.iter_mut() {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *word = x;
    }
    assert!(is_private(block, SIZE).unwrap());

    decommit(block, SIZE).unwrap();
    decommit(block, SIZE).unwrap();
    assert!(!is_readable(block, P).unwrap());

    commit(block, SIZE).unwrap();
    commit(block, SIZE).unwrap();
    // Recommitted pages read as zero again.
    assert!(words(block, SIZE).iter().all(|w| *w == 0));

    release(block, SIZE).unwrap();
}

#[test]
fn share_and_resync() {
    let _session = Session::begin();
    const SIZE: usize = 64 * G;

    let block = allocate(ptr::null_mut(), SIZE, Flags::READ_WRITE).unwrap();
    for (i, b) in bytes(block, SIZE).iter_mut().enumerate() {
        *b = i as u8;
    }
    assert_eq!(bytes(block, SIZE)[1], 1);
    assert!(is_private(block, SIZE).unwrap());

    let shared = copy(ptr::null_mut(), block, SIZE, Flags::empty()).unwrap();
    assert!(!shared.is_null());
    assert_eq!(bytes(shared, SIZE)[1], 1);

    assert!(!is_private(block, SIZE).unwrap());
    assert!(!is_private(shared, SIZE).unwrap());
    assert!(is_copy(shared, block, SIZE).unwrap());
    assert!(is_copy(block, shared, SIZE).unwrap());

    // Re-sharing into the existing copy is a no-op.
    assert_eq!(copy(shared, block, SIZE, Flags::empty()).unwrap(), shared);
    assert_eq!(bytes(shared, SIZE)[1], 1);
    assert!(is_copy(shared, block, SIZE).unwrap());

    // Writing the original leaves the copy untouched and disconnects it.
    for (i, b) in bytes(block, SIZE).iter_mut().enumerate() {
        *b = (i + 1) as u8;
    }
    assert_eq!(bytes(block, SIZE)[1], 2);
    assert_eq!(bytes(shared, SIZE)[1], 1);
    assert!(is_private(block, SIZE).unwrap());
    assert!(!is_copy(shared, block, SIZE).unwrap());

    for (i, b) in bytes(shared, SIZE).iter_mut().enumerate() {
        *b = (i + 2) as u8;
    }
    assert_eq!(bytes(block, SIZE)[1], 2);
    assert_eq!(bytes(shared, SIZE)[1], 3);
    assert!(is_private(shared, SIZE).unwrap());

    // Copying back brings the pair into sync again.
    assert_eq!(copy(block, shared, SIZE, Flags::empty()).unwrap(), block);
    assert_eq!(bytes(block, SIZE)[1], 3);
    assert!(!is_private(block, SIZE).unwrap());
    assert!(!is_private(shared, SIZE).unwrap());
    assert!(is_copy(shared, block, SIZE).unwrap());
    assert!(is_copy(block, shared, SIZE).unwrap());

    release(block, SIZE).unwrap();
    release(shared, SIZE).unwrap();
}

#[test]
fn shifting_move_preserves_data() {
    let _session = Session::begin();
    const SIZE: usize = 16 * G;
    const SHIFT: usize = G;

    let block = allocate(
        ARENA_B,
        SIZE + SHIFT,
        Flags::ZERO_INIT | Flags::RESERVED | Flags::EXACTLY,
    )
    .unwrap();
    assert_eq!(block, ARENA_B);
    commit(block, SIZE).unwrap();
    for (i, word) in words(block, SIZE).iter_mut().enumerate() {
        *word = i as u32 + 1;
    }

    // Shift the whole range one block to the right, releasing the source.
    let shifted = copy(
        block.wrapping_add(SHIFT),
        block,
        SIZE,
        Flags::EXACTLY | Flags::RELEASE,
    )
    .unwrap();
    assert_eq!(shifted, block.wrapping_add(SHIFT));
    for (i, word) in words(shifted, SIZE).iter().enumerate() {
        assert_eq!(*word, i as u32 + 1);
    }
    assert!(is_private(shifted, SIZE).unwrap());

    // The vacated lead block is free again.
    assert_eq!(
        allocate(block, SHIFT, Flags::RESERVED | Flags::EXACTLY).unwrap(),
        block
    );
    release(block, SHIFT).unwrap();

    // Shift it back into a freshly allocated destination.
    assert_eq!(
        copy(
            block,
            shifted,
            SIZE,
            Flags::ALLOCATE | Flags::EXACTLY | Flags::RELEASE,
        )
        .unwrap(),
        block
    );
    for (i, word) in words(block, SIZE).iter().enumerate() {
        assert_eq!(*word, i as u32 + 1);
    }
    assert!(is_private(block, SIZE).unwrap());

    // And the vacated tail block is free as well.
    assert_eq!(
        allocate(
            block.wrapping_add(SIZE),
            SHIFT,
            Flags::RESERVED | Flags::EXACTLY
        )
        .unwrap(),
        block.wrapping_add(SIZE)
    );
    release(block.wrapping_add(SIZE), SHIFT).unwrap();

    release(block, SIZE).unwrap();
}

#[test]
fn small_block_copies() {
    let _session = Session::begin();

    let block = allocate(ptr::null_mut(), 4, Flags::ZERO_INIT).unwrap();
    assert_eq!(words(block, 4)[0], 0);
    assert!(is_private(block, 4).unwrap());
    words(block, 4)[0] = 1;

    {
        // Plain share: both sides readable, writable, isolated.
        let shared = copy(ptr::null_mut(), block, 4, Flags::empty()).unwrap();
        assert!(!shared.is_null());
        assert_eq!(words(shared, 4)[0], 1);
        assert!(is_readable(shared, 4).unwrap());
        assert!(is_writable(shared, 4).unwrap());
        assert!(is_copy(shared, block, 4).unwrap());
        assert!(!is_private(block, 4).unwrap());
        words(shared, 4)[0] = 2;
        assert_eq!(words(block, 4)[0], 1);
        release(shared, 4).unwrap();
    }
    {
        // Read-only share: writes to the copy are refused.
        let frozen = copy(ptr::null_mut(), block, 4, Flags::READ_ONLY).unwrap();
        assert_eq!(peek(frozen), 1);
        assert!(is_readable(frozen, 4).unwrap());
        assert!(!is_writable(frozen, 4).unwrap());
        assert!(is_copy(frozen, block, 4).unwrap());
        assert_eq!(classify_fault(frozen, true), Error::NoPermission);
        release(frozen, 4).unwrap();
    }

    decommit(block, P).unwrap();
    commit(block, 4).unwrap();
    words(block, 4)[0] = 1;

    {
        // Decommitting copy: the source page is handed over.
        assert!(is_private(block, 4).unwrap());
        let moved = copy(ptr::null_mut(), block, P, Flags::DECOMMIT).unwrap();
        assert_eq!(words(moved, 4)[0], 1);
        assert!(is_readable(moved, 4).unwrap());
        assert!(is_writable(moved, 4).unwrap());
        assert!(!is_readable(block, 4).unwrap());
        assert!(!is_writable(block, 4).unwrap());
        assert_eq!(classify_fault(block, true), Error::MemNotCommitted);
        commit(block, 4).unwrap();
        words(block, 4)[0] = 2;
        assert!(is_private(block, 4).unwrap());
        assert!(is_private(moved, 4).unwrap());
        assert!(!is_copy(moved, block, 4).unwrap());
        release(moved, P).unwrap();
    }
    {
        // Releasing copy with no destination collapses to the source itself.
        let kept = copy(ptr::null_mut(), block, 4, Flags::RELEASE).unwrap();
        assert_eq!(kept, block);
    }
    release(block, 4).unwrap();
}

#[test]
fn copy_from_read_only_source() {
    let _session = Session::begin();

    // A manager-owned constant: a committed page, filled, then
    // write-protected (read-only rounds inward, so protect the whole page).
    let rodata = allocate(ptr::null_mut(), P, Flags::ZERO_INIT).unwrap();
    bytes(rodata, P)[..5].copy_from_slice(b"test\0");
    change_protection(rodata, P, Flags::READ_ONLY).unwrap();
    assert!(!is_writable(rodata, P).unwrap());

    let first = copy(ptr::null_mut(), rodata, 5, Flags::ALLOCATE).unwrap();
    assert!(!first.is_null());
    assert_eq!(&bytes(first, 5)[..], &b"test\0"[..]);
    // Without READ_ONLY the copy itself is writable.
    assert!(is_writable(first, 5).unwrap());

    // A destination at a different intra-block offset forces the physical
    // path; the result is still a byte-exact replica.
    let target = allocate(ptr::null_mut(), G + 64, Flags::ZERO_INIT).unwrap();
    let dst = target.wrapping_add(P);
    assert_eq!(copy(dst, first, 5, Flags::empty()).unwrap(), dst);
    assert_eq!(&bytes(dst, 5)[..], &b"test\0"[..]);

    // Sources outside the managed space are rejected.
    static DATA: [u8; 5] = *b"test\0";
    assert_eq!(
        copy(ptr::null_mut(), DATA.as_ptr() as *mut u8, 5, Flags::ALLOCATE),
        Err(Error::BadParam)
    );

    release(target, G + 64).unwrap();
    release(first, 5).unwrap();
    release(rodata, P).unwrap();
}

#[test]
fn protection_toggle_is_idempotent() {
    let _session = Session::begin();
    const SIZE: usize = 2 * G;

    let block = allocate(ptr::null_mut(), SIZE, Flags::ZERO_INIT).unwrap();
    words(block, SIZE)[0] = 7;

    change_protection(block, SIZE, Flags::READ_ONLY).unwrap();
    change_protection(block, SIZE, Flags::READ_ONLY).unwrap();
    assert!(is_readable(block, SIZE).unwrap());
    assert!(!is_writable(block, SIZE).unwrap());
    assert_eq!(classify_fault(block, true), Error::NoPermission);

    change_protection(block, SIZE, Flags::READ_WRITE).unwrap();
    assert!(is_writable(block, SIZE).unwrap());
    assert_eq!(words(block, SIZE)[0], 7);

    // Read-only rounds inward: a sub-page request protects nothing.
    change_protection(block.wrapping_add(1), P - 2, Flags::READ_ONLY).unwrap();
    assert!(is_writable(block, P).unwrap());

    release(block, SIZE).unwrap();
}

#[test]
fn copies_are_isolated() {
    let _session = Session::begin();
    const SIZE: usize = 3 * G;

    let original = allocate(ptr::null_mut(), SIZE, Flags::ZERO_INIT).unwrap();
    for (i, b) in bytes(original, SIZE).iter_mut().enumerate() {
        *b = (i * 7) as u8;
    }
    let duplicate = copy(ptr::null_mut(), original, SIZE, Flags::empty()).unwrap();
    assert_eq!(bytes(original, SIZE), bytes(duplicate, SIZE));

    bytes(original, SIZE)[123] = 0xff;
    assert_eq!(bytes(duplicate, SIZE)[123], ((123 * 7) & 0xff) as u8);

    release(original, SIZE).unwrap();
    release(duplicate, SIZE).unwrap();
}

#[test]
fn rejected_flags_and_sizes() {
    let _session = Session::begin();

    assert_eq!(
        allocate(ptr::null_mut(), 0, Flags::empty()),
        Err(Error::BadParam)
    );
    assert_eq!(
        allocate(ptr::null_mut(), P, Flags::DECOMMIT),
        Err(Error::InvFlag)
    );
    let block = allocate(ptr::null_mut(), P, Flags::empty()).unwrap();
    assert_eq!(
        copy(ptr::null_mut(), block, P, Flags::RESERVED),
        Err(Error::InvFlag)
    );
    assert_eq!(
        change_protection(block, P, Flags::ALLOCATE),
        Err(Error::InvFlag)
    );
    // Committing an unallocated range is refused.
    assert_eq!(commit(ptr::null_mut(), P), Err(Error::BadParam));
    release(block, P).unwrap();
}

#[test]
fn query_reports_platform_constants() {
    let _session = Session::begin();

    assert_eq!(
        query(ptr::null(), QueryParam::AllocationUnit).unwrap(),
        G
    );
    assert_eq!(query(ptr::null(), QueryParam::CommitUnit).unwrap(), P);
    assert_eq!(query(ptr::null(), QueryParam::ProtectionUnit).unwrap(), P);
    let begin = query(ptr::null(), QueryParam::AllocationSpaceBegin).unwrap();
    let end = query(ptr::null(), QueryParam::AllocationSpaceEnd).unwrap();
    assert!(begin < end);
    let caps = Capabilities::from_bits_truncate(
        query(ptr::null(), QueryParam::Flags).unwrap() as u32
    );
    assert!(caps.contains(Capabilities::COPY_ON_WRITE | Capabilities::SPACE_RESERVATION));
}

#[test]
fn supervisor_attach_is_introspective() {
    let _session = Session::begin();

    let block = allocate(ptr::null_mut(), G, Flags::ZERO_INIT).unwrap();
    words(block, G)[0] = 42;

    let supervisor = AddressSpace::attach(std::process::id()).unwrap();
    assert!(!supervisor.is_current());
    assert!(supervisor.is_readable(block as usize, 16).unwrap());
    assert!(supervisor.is_writable(block as usize, 16).unwrap());
    // Mutation through a foreign attach is not available.
    assert!(matches!(
        supervisor.reserve(G, Flags::empty(), 0),
        Err(Error::Unsupported(_))
    ));
    supervisor.terminate();

    // The owning side is unaffected.
    assert_eq!(words(block, G)[0], 42);
    release(block, G).unwrap();
}
