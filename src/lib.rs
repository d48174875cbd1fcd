//! flowpipe library crate: NetFlow v5 ingest and the flow-record sorter,
//! shared by the binary, tests and benchmarks.

pub mod cli;
pub mod config;
pub mod ingest;
pub mod protocol;
pub mod record;
pub mod sort;
pub mod stats;
pub mod stream;
