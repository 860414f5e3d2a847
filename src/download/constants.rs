//! Shared constants for the transfer layer.

/// Connect timeout applied to every request made by [`super::HttpClient`].
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Whole-request ceiling for the underlying client. Transfers enforce their
/// own tighter overall and stall timeouts on top of this.
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Timeout for the HEAD request used to learn a file's size.
pub const SIZE_PROBE_TIMEOUT_SECS: u64 = 10;

/// Size of a single read when hashing or merging files on disk.
pub const HASH_READ_BUFFER_BYTES: usize = 64 * 1024;

/// Number of bounded reads between cooperative yields while hashing.
pub const READS_PER_YIELD: usize = 16;
