pub mod constants;
pub mod hash_id;
pub mod lengths;
pub mod sha1w;
pub mod spawn_utils;

pub use hash_id::Id20;
