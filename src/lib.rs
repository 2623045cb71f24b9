pub mod collect;
pub mod completeness;
pub mod config;
pub mod error;
pub mod fields;
pub mod http_client;
pub mod identity;
pub mod merge;
pub mod pipeline;
pub mod record;
pub mod review;
pub mod store;

pub use error::{ReconcileError, Result};
