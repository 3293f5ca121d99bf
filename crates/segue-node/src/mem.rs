//! Server pool memory.
//!
//! Every region the server references on the wire is `(mem-id, offset,
//! size)` into a block it previously registered with `AddMem` (the memfd
//! arrives as ancillary data). Mappings are created once per use and kept
//! alive by a [`MemMap`] handle; io mappings additionally carry a tag
//! tuple so a re-issued request can replace its predecessor.

use crate::error::{NodeError, Result};
use memmap2::{MmapOptions, MmapRaw};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, warn};

/// Identifies what an io mapping is for:
/// `(node, direction, port, mix, io-id)`; unused positions hold
/// `INVALID_ID`.
pub type Tag = [u32; 5];

/// One registered pool block.
pub struct MemBlock {
    pub id: u32,
    pub kind: u32,
    pub flags: u32,
    pub fd: OwnedFd,
}

/// A live mapping into a pool block. Dropping it unmaps.
pub struct MemMap {
    raw: MmapRaw,
    skew: usize,
    size: usize,
    pub mem_id: u32,
    pub tag: Option<Tag>,
}

// Safety: the mapping is process-shared memory; all access goes through
// raw pointers whose synchronization is the caller's contract.
unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}

impl MemMap {
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        // Safety: skew < one page inside a mapping that covers skew+size.
        unsafe { self.raw.as_mut_ptr().add(self.skew) }
    }

    #[inline]
    pub fn ptr_as<T>(&self) -> *mut T {
        self.ptr() as *mut T
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

fn page_size() -> usize {
    // Safety: trivial sysconf query.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Mirror of the server's memory pool.
#[derive(Default)]
pub struct MemPool {
    blocks: HashMap<u32, MemBlock>,
}

impl MemPool {
    pub fn new() -> MemPool {
        MemPool::default()
    }

    pub fn add_block(&mut self, id: u32, kind: u32, flags: u32, fd: OwnedFd) {
        debug!(id, kind, flags, "pool block added");
        self.blocks.insert(id, MemBlock { id, kind, flags, fd });
    }

    pub fn remove_block(&mut self, id: u32) -> Option<MemBlock> {
        debug!(id, "pool block removed");
        self.blocks.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&MemBlock> {
        self.blocks.get(&id)
    }

    /// Map `offset..offset+size` of block `mem_id`. The payload is locked
    /// into RAM on a best-effort basis; failure to lock is logged, not
    /// fatal.
    pub fn map(&self, mem_id: u32, offset: u32, size: u32, tag: Option<Tag>) -> Result<MemMap> {
        let block = self
            .blocks
            .get(&mem_id)
            .ok_or_else(|| NodeError::SharedMemory(format!("unknown pool block {mem_id}")))?;

        let page = page_size();
        let aligned = offset as usize & !(page - 1);
        let skew = offset as usize - aligned;

        let raw = MmapOptions::new()
            .offset(aligned as u64)
            .len(skew + size as usize)
            .map_raw(block.fd.as_raw_fd())
            .map_err(|e| NodeError::SharedMemory(format!("mmap of block {mem_id} failed: {e}")))?;

        let map = MemMap {
            raw,
            skew,
            size: size as usize,
            mem_id,
            tag,
        };

        // Safety: locking the range we just mapped.
        if unsafe { libc::mlock(map.ptr() as *const _, map.size) } != 0 {
            warn!(
                mem_id,
                size,
                "mlock failed: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(map)
    }
}

/// Io mappings indexed by their tag; re-tagging replaces and unmaps the
/// previous mapping.
#[derive(Default)]
pub struct TaggedMaps {
    maps: Vec<MemMap>,
}

impl TaggedMaps {
    pub fn new() -> TaggedMaps {
        TaggedMaps::default()
    }

    /// Remove and return the mapping with `tag`, if any.
    pub fn take(&mut self, tag: &Tag) -> Option<MemMap> {
        let idx = self.maps.iter().position(|m| m.tag.as_ref() == Some(tag))?;
        Some(self.maps.swap_remove(idx))
    }

    pub fn insert(&mut self, map: MemMap) {
        if let Some(tag) = &map.tag {
            if let Some(old) = self.take(&tag.clone()) {
                debug!(?tag, mem_id = old.mem_id, "replacing tagged io mapping");
            }
        }
        self.maps.push(map);
    }

    pub fn clear(&mut self) {
        self.maps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::OwnedFd;

    fn block_fd(len: usize) -> OwnedFd {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        OwnedFd::from(f)
    }

    #[test]
    fn test_map_and_write() {
        let mut pool = MemPool::new();
        pool.add_block(3, 0, 0, block_fd(8192));

        let map = pool.map(3, 0, 4096, None).unwrap();
        assert_eq!(map.size(), 4096);
        // Safety: freshly mapped file region.
        unsafe {
            *map.ptr() = 0xab;
            assert_eq!(*map.ptr(), 0xab);
        }
    }

    #[test]
    fn test_unaligned_offset() {
        let mut pool = MemPool::new();
        pool.add_block(1, 0, 0, block_fd(16384));

        // an offset inside the first page still maps correctly
        let map = pool.map(1, 100, 256, None).unwrap();
        unsafe {
            *map.ptr() = 0x7f;
        }
        let whole = pool.map(1, 0, 1024, None).unwrap();
        unsafe {
            assert_eq!(*whole.ptr().add(100), 0x7f);
        }
    }

    #[test]
    fn test_unknown_block() {
        let pool = MemPool::new();
        assert!(pool.map(9, 0, 16, None).is_err());
    }

    #[test]
    fn test_tag_replacement() {
        let mut pool = MemPool::new();
        pool.add_block(1, 0, 0, block_fd(8192));
        let tag: Tag = [1, 0, 2, 0, 4];

        let mut io = TaggedMaps::new();
        io.insert(pool.map(1, 0, 64, Some(tag)).unwrap());
        io.insert(pool.map(1, 4096, 64, Some(tag)).unwrap());
        // only the replacement remains
        let taken = io.take(&tag).unwrap();
        assert_eq!(taken.mem_id, 1);
        assert!(io.take(&tag).is_none());
    }
}
