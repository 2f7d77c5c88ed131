//! Shared on-disk/wire constants for the store library and the server binary.

/// Default low bits of the rolling hash that mark a level-0 cut (spec.md §4.1).
pub const BLOBBITS: u32 = 13;

/// Minimum blob size the splitter will emit (spec.md §4.1).
pub const BLOB_MIN_SIZE: usize = 1;

/// Maximum blob size the splitter will emit before forcing a cut (spec.md §4.1).
pub const BLOB_MAX_SIZE: usize = 64 * 1024;

/// Rolling window size used by the splitter (spec.md §4.1, §8).
pub const WINDOW_SIZE: usize = 64;

/// Soft cap on a single pack file's size before the writer rolls to a new one
/// (spec.md §4.3).
pub const MAX_PACK_SIZE: u64 = 1024 * 1024 * 1024;

/// The objects subdirectory holding pack/idx/midx files (spec.md §6).
pub const PACK_DIR: &str = "objects/pack";

/// The refs subdirectory (spec.md §6).
pub const REFS_DIR: &str = "refs/heads";

/// Default name of the per-host file index (spec.md §6).
pub const DEFAULT_INDEX_NAME: &str = "bupindex";

/// Sentinel file whose presence puts the server in "dumb" mode: it never rewrites the
/// multi-index on receive (spec.md §6).
pub const DUMB_SERVER_SENTINEL: &str = "bup-dumb-server";

/// Suspend marker sent in place of a frame length in `receive-objects-v2` (spec.md §4.8).
pub const FRAME_SUSPEND: u32 = 0xFFFF_FFFF;

/// Zero-length frame marks end of stream in `receive-objects-v2` and `cat` (spec.md §4.8).
pub const FRAME_END: u32 = 0;
