//! Application configuration constants.
//! Tuning and thresholds in one place.

/// Name of the hash directory under the repository root. Anything stored
/// here must be urlencode-idempotent.
pub const HASH_DIR: &str = "sha1";

/// Suffix of in-flight blob and index files; a crash leaves these behind and
/// the next cleanup removes them.
pub const TMP_SUFFIX: &str = ".tmp";

/// Suffix of in-flight restored entries.
pub const RESTORE_SUFFIX: &str = "~restore~";

// ---- Storage ----

/// Size thresholds for how file contents are stored and hashed.
pub struct StoreConsts;

impl StoreConsts {
    /// Files up to this size are stored inline in the index; the URL-encoded
    /// bytes cost less than a hash plus a blob file (bytes).
    pub const STORE_LIMIT: u64 = 256;
    /// Smallest file worth memory-mapping for hashing; mapping lots of small
    /// files is slower than reading them (bytes). 256 KiB.
    pub const MIN_MAP: u64 = 256 * 1024;
    /// Largest single mmap window (bytes). 256 MiB.
    pub const MAX_MAP: u64 = 256 * 1024 * 1024;
    /// Chunk size for streaming copies and non-mapped hashing (bytes).
    pub const COPY_CHUNK: usize = 4096;
}

// ---- In-repo hash set ----

/// Bucket count of the in-memory hash set. 2^22 buckets cost ~32 MB of
/// pointers and only start to degrade with millions of distinct blobs.
pub const HASHTABLE_BUCKETS: usize = 1 << 22;

// ---- SFTP ----

/// Pipelining depth of the SFTP driver.
pub struct SftpConsts;

impl SftpConsts {
    /// Outstanding READ requests kept in flight per open file.
    pub const READ_QUEUE_LEN: usize = 8;
    /// Bytes requested per READ.
    pub const READ_CHUNK: u32 = 4096;
    /// Protocol version sent with SSH_FXP_INIT; replies below this are fatal.
    pub const PROTO_VERSION: u32 = 3;
}
