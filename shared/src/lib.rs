//! Types and constants shared between the `bupstore` library and the `bup-server`
//! binary. Kept deliberately tiny: everything here is either a wire-visible type or a
//! name of a file/directory that both sides of the protocol need to agree on.

pub mod types;
pub mod constants;

pub use types::*;
pub use constants::*;
