pub mod config;
pub mod service;

pub use config::ServiceConfig;
pub use service::{AppState, build_router};

/// Directory used when neither `DATABASE_URL` nor `CLAIMS_DIRECTORY_SEED` is set.
pub const BUNDLED_DIRECTORY: &str = include_str!("../directory.yaml");
