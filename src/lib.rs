pub mod api;
pub mod config;
pub mod convert;
pub mod dedup;
pub mod humanize;
pub mod observability;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod session;
pub mod storage;
pub mod store;
