//! External merge sort for flow files.
//!
//! [`key`] turns a `--fields` list into a [`KeyDescriptor`]; [`engine`]
//! drives the in-core phase through [`node`] and [`spill`], and [`merge`]
//! combines the sorted runs.

pub mod engine;
pub mod key;
pub mod merge;
pub mod node;
pub mod plugins;
pub mod spill;

pub use engine::{SortError, SortOptions, SortSummary, Sorter};
pub use key::{KeyDescriptor, KeyError, KeyField, KeyFieldRegistry, SortField};
pub use node::DEFAULT_BUFFER_SIZE;
