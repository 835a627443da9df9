//! Keys Module
//!
//! Canonical query keys, prefix matching and the entity route table.

mod key;
mod registry;

pub use key::{is_prefix_of, make_key, KeySegment, QueryKey};
pub use registry::{KeyRegistry, DETAIL, LIST};
