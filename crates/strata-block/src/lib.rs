#![forbid(unsafe_code)]
//! Physical block storage interface.
//!
//! The commit pipeline consumes storage only through [`BlockStore`]:
//! allocate a location of a given size, write it, read it back, free it.
//! Placement policy, device layout and caching all live behind the trait.
//!
//! Blocks written by Strata carry a crc32c trailer; [`write_sealed`] and
//! [`read_sealed`] add and verify it so that every [`BlockPtr`] can be
//! checked against what storage returns.

use parking_lot::Mutex;
use std::collections::HashMap;
use strata_error::{Result, StrataError};
use strata_types::{BlockLocation, BlockPtr, Txg};
use tracing::{error, trace};

/// Size of the crc32c trailer appended to every sealed block.
pub const CHECKSUM_TRAILER_BYTES: usize = 4;

/// Block-addressed storage consumed by the commit pipeline.
pub trait BlockStore: Send + Sync {
    /// Reserve a location able to hold `size` bytes.
    fn allocate_block(&self, size: u64) -> Result<BlockLocation>;

    /// Return a location to the free pool. Freeing an unknown location is a
    /// contract violation; implementations log it and ignore the call.
    fn free_block(&self, location: BlockLocation);

    /// Write `bytes` at `location`. `bytes.len()` must not exceed the size
    /// the location was allocated with.
    fn write(&self, location: BlockLocation, bytes: &[u8]) -> Result<()>;

    /// Read back exactly what was last written at `location`.
    fn read(&self, location: BlockLocation) -> Result<Vec<u8>>;
}

/// Round `len` up to the allocation granularity.
#[must_use]
pub fn physical_size(len: u64, granularity: u64) -> u64 {
    let granularity = granularity.max(1);
    len.div_ceil(granularity).saturating_mul(granularity)
}

/// Allocate, seal and write `payload`, returning the pointer to it.
///
/// The pointer charges `physical_size(payload + trailer)` as physical bytes
/// and `physical_size(logical)` as logical bytes, where `logical` is the
/// uncompressed size the payload stands for (at least its own length).
pub fn write_sealed(
    store: &dyn BlockStore,
    payload: &[u8],
    logical: u64,
    granularity: u64,
    birth: Txg,
) -> Result<BlockPtr> {
    let sealed = seal(payload);
    let physical = physical_size(sealed.len() as u64, granularity);
    let location = store.allocate_block(physical)?;
    if let Err(err) = store.write(location, &sealed) {
        store.free_block(location);
        return Err(err);
    }
    trace!(
        target: "strata::block",
        location = location.0,
        physical,
        birth = birth.0,
        "block_written"
    );
    Ok(BlockPtr {
        location,
        physical_size: physical,
        logical_size: physical_size(logical.max(payload.len() as u64), granularity),
        birth,
        checksum: crc32c::crc32c(payload),
    })
}

/// Overwrite the block behind `bp` in place with a new payload.
///
/// Only valid for a block born in the generation currently syncing (it is
/// not yet referenced by any durable root). Returns `None` if the payload no
/// longer fits the existing allocation.
pub fn rewrite_sealed(store: &dyn BlockStore, bp: &BlockPtr, payload: &[u8]) -> Result<Option<BlockPtr>> {
    let sealed = seal(payload);
    if sealed.len() as u64 > bp.physical_size {
        return Ok(None);
    }
    store.write(bp.location, &sealed)?;
    Ok(Some(BlockPtr {
        checksum: crc32c::crc32c(payload),
        ..*bp
    }))
}

/// Read the block behind `bp` and verify both its trailer and the checksum
/// recorded in the pointer.
pub fn read_sealed(store: &dyn BlockStore, bp: &BlockPtr) -> Result<Vec<u8>> {
    let bytes = store.read(bp.location)?;
    let payload = unseal(bp.location, &bytes)?;
    let actual = crc32c::crc32c(payload);
    if actual != bp.checksum {
        return Err(StrataError::Corruption {
            block: bp.location.0,
            detail: format!(
                "block pointer checksum {:#010x} does not match contents {actual:#010x}",
                bp.checksum
            ),
        });
    }
    Ok(payload.to_vec())
}

/// Append the crc32c trailer.
#[must_use]
pub fn seal(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + CHECKSUM_TRAILER_BYTES);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
    out
}

/// Verify and strip the crc32c trailer.
pub fn unseal(location: BlockLocation, bytes: &[u8]) -> Result<&[u8]> {
    let Some(split) = bytes.len().checked_sub(CHECKSUM_TRAILER_BYTES) else {
        return Err(StrataError::Corruption {
            block: location.0,
            detail: format!("block of {} bytes is shorter than its trailer", bytes.len()),
        });
    };
    let (payload, trailer) = bytes.split_at(split);
    let mut raw = [0_u8; CHECKSUM_TRAILER_BYTES];
    raw.copy_from_slice(trailer);
    let stored = u32::from_le_bytes(raw);
    let actual = crc32c::crc32c(payload);
    if stored != actual {
        return Err(StrataError::Corruption {
            block: location.0,
            detail: format!("trailer checksum {stored:#010x} != computed {actual:#010x}"),
        });
    }
    Ok(payload)
}

// ── In-memory store ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemState {
    next: u64,
    blocks: HashMap<BlockLocation, MemBlock>,
    allocated_bytes: u64,
    writes: u64,
    frees: u64,
    fail_writes_after: Option<u64>,
}

#[derive(Debug)]
struct MemBlock {
    size: u64,
    bytes: Vec<u8>,
}

/// Heap-backed [`BlockStore`] with a hard capacity and write-fault
/// injection.
#[derive(Debug)]
pub struct MemBlockStore {
    capacity: u64,
    state: Mutex<MemState>,
}

impl MemBlockStore {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(MemState {
                next: 1,
                ..MemState::default()
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated_bytes
    }

    /// Number of live blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.state.lock().frees
    }

    /// Fail every write after `n` more successful ones. `None` clears the
    /// fault.
    pub fn fail_writes_after(&self, n: Option<u64>) {
        self.state.lock().fail_writes_after = n;
    }

    /// Flip one byte of a stored block.
    pub fn corrupt(&self, location: BlockLocation) -> bool {
        let mut state = self.state.lock();
        match state.blocks.get_mut(&location) {
            Some(block) if !block.bytes.is_empty() => {
                block.bytes[0] ^= 0xff;
                true
            }
            _ => false,
        }
    }
}

impl BlockStore for MemBlockStore {
    fn allocate_block(&self, size: u64) -> Result<BlockLocation> {
        let mut state = self.state.lock();
        let Some(total) = state.allocated_bytes.checked_add(size) else {
            return Err(StrataError::NoSpace);
        };
        if total > self.capacity {
            return Err(StrataError::NoSpace);
        }
        let location = BlockLocation(state.next);
        state.next += 1;
        state.allocated_bytes = total;
        state.blocks.insert(
            location,
            MemBlock {
                size,
                bytes: Vec::new(),
            },
        );
        Ok(location)
    }

    fn free_block(&self, location: BlockLocation) {
        let mut state = self.state.lock();
        match state.blocks.remove(&location) {
            Some(block) => {
                state.allocated_bytes = state.allocated_bytes.saturating_sub(block.size);
                state.frees += 1;
            }
            None => {
                drop(state);
                error!(location = location.0, "free of unallocated block ignored");
            }
        }
    }

    fn write(&self, location: BlockLocation, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.fail_writes_after {
            if remaining == 0 {
                return Err(StrataError::Io(std::io::Error::other(format!(
                    "injected write fault at location {}",
                    location.0
                ))));
            }
            state.fail_writes_after = Some(remaining - 1);
        }
        let Some(block) = state.blocks.get_mut(&location) else {
            return Err(StrataError::InvalidArgument(format!(
                "write to unallocated location {}",
                location.0
            )));
        };
        if bytes.len() as u64 > block.size {
            return Err(StrataError::InvalidArgument(format!(
                "write of {} bytes exceeds allocation of {} at location {}",
                bytes.len(),
                block.size,
                location.0
            )));
        }
        block.bytes = bytes.to_vec();
        state.writes += 1;
        Ok(())
    }

    fn read(&self, location: BlockLocation) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state
            .blocks
            .get(&location)
            .map(|block| block.bytes.clone())
            .ok_or_else(|| StrataError::Corruption {
                block: location.0,
                detail: "read of unallocated location".to_owned(),
            })
    }
}
