#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod cache;
pub mod chunked;
pub mod config;
pub mod error;
pub mod info;
pub mod layout;
pub mod mask;
pub mod pool;
pub mod roster;
pub mod spec_index;
pub mod value_index;
pub mod variant;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../ingest/mod.rs"]
pub mod ingest;

#[path = "../merge/mod.rs"]
pub mod merge;

#[path = "../query/mod.rs"]
pub mod query;
