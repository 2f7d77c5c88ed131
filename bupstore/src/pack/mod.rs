//! C3/C4/C5: pack writer, pack index reader, multi-index, and object cache
//! (spec.md §4.3, §4.4).

pub mod cache;
pub mod format;
pub mod midx;
pub mod reader;
pub mod writer;

pub use cache::{ExistsResult, ObjectCache, MIDX_REBUILD_THRESHOLD};
pub use reader::PackReader;
pub use writer::{PackWriter, MAX_PACK_SIZE};
