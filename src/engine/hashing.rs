//! File hashing and the in-memory set of hashes known to be in the repo.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use memmap2::{Advice, MmapOptions};
use sha1::{Digest, Sha1};

use crate::codec::HashBytes;
use crate::fs::{FsError, Filesystem, OpenMode};
use crate::types::Stats;
use crate::utils::config::{HASHTABLE_BUCKETS, StoreConsts};

/// Hash a file's contents with SHA-1.
///
/// With `mmap_hint` set and a local filesystem the file is mapped in windows
/// of at most [`StoreConsts::MAX_MAP`] with sequential-access advice;
/// otherwise it is read through the filesystem abstraction in
/// [`StoreConsts::COPY_CHUNK`] blocks. Callers pass `mmap_hint` for files of
/// at least [`StoreConsts::MIN_MAP`] bytes.
pub fn hash_file(
    fs: &dyn Filesystem,
    path: &Path,
    mmap_hint: bool,
    stats: &mut Stats,
) -> Result<HashBytes, FsError> {
    let mut hasher = Sha1::new();
    if mmap_hint && fs.is_local() {
        let file = File::open(path).map_err(|e| FsError::io("opening", path, e))?;
        let size = file
            .metadata()
            .map_err(|e| FsError::io("fstat", path, e))?
            .len();
        let mut offset = 0u64;
        while offset < size {
            let window = (size - offset).min(StoreConsts::MAX_MAP) as usize;
            let map = unsafe { MmapOptions::new().offset(offset).len(window).map(&file) }
                .map_err(|e| FsError::io("mapping", path, e))?;
            let _ = map.advise(Advice::Sequential);
            hasher.update(&map[..]);
            offset += window as u64;
        }
        stats.hash_mmap += 1;
    } else {
        let mut f = fs.open(path, OpenMode::ReadOnly)?;
        let mut buf = [0u8; StoreConsts::COPY_CHUNK];
        loop {
            let n = f
                .read(&mut buf)
                .map_err(|e| FsError::io("reading", path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        stats.hash_read += 1;
    }
    Ok(hasher.finalize().into())
}

/// Hash an in-memory byte string. Convenience for tests and recheck paths.
pub fn hash_bytes(bytes: &[u8]) -> HashBytes {
    Sha1::digest(bytes).into()
}

struct Node {
    hash: HashBytes,
    next: Option<Box<Node>>,
}

/// Fixed-bucket open-chain set of content hashes.
///
/// The bucket of a hash is its first native machine word modulo the bucket
/// count, which is sound because SHA-1 output is uniformly distributed.
/// Sized for millions of entries before chains grow.
pub struct HashSet {
    buckets: Vec<Option<Box<Node>>>,
    len: u64,
}

impl HashSet {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(HASHTABLE_BUCKETS);
        buckets.resize_with(HASHTABLE_BUCKETS, || None);
        HashSet { buckets, len: 0 }
    }

    fn bucket(h: &HashBytes) -> usize {
        let mut word = [0u8; 8];
        word.copy_from_slice(&h[..8]);
        (u64::from_ne_bytes(word) % HASHTABLE_BUCKETS as u64) as usize
    }

    /// Insert `h` if not already present.
    pub fn insert(&mut self, h: &HashBytes) {
        let n = Self::bucket(h);
        let mut node = self.buckets[n].as_deref();
        while let Some(np) = node {
            if &np.hash == h {
                return;
            }
            node = np.next.as_deref();
        }
        self.buckets[n] = Some(Box::new(Node {
            hash: *h,
            next: self.buckets[n].take(),
        }));
        self.len += 1;
    }

    pub fn contains(&self, h: &HashBytes) -> bool {
        let mut node = self.buckets[Self::bucket(h)].as_deref();
        while let Some(np) = node {
            if &np.hash == h {
                return true;
            }
            node = np.next.as_deref();
        }
        false
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Log occupancy statistics.
    pub fn dump_stats(&self) {
        let mut nodes = 0u64;
        let mut nonempty = 0u64;
        let mut maxchain = 0u64;
        for bucket in &self.buckets {
            if bucket.is_some() {
                nonempty += 1;
                let mut chain = 0u64;
                let mut node = bucket.as_deref();
                while let Some(np) = node {
                    chain += 1;
                    node = np.next.as_deref();
                }
                nodes += chain;
                maxchain = maxchain.max(chain);
            }
        }
        log::debug!("nodes in hash set:          {nodes}");
        log::debug!("nonempty buckets:           {nonempty}");
        log::debug!(
            "mean nonempty chain length: {:.2}",
            nodes as f64 / nonempty.max(1) as f64
        );
        log::debug!("maximum chain length:       {maxchain}");
    }
}

impl Default for HashSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HashSet {
    // Unwind the chains iteratively; a long chain must not recurse on drop.
    fn drop(&mut self) {
        for bucket in &mut self.buckets {
            let mut node = bucket.take();
            while let Some(mut np) = node {
                node = np.next.take();
            }
        }
    }
}
