//! # Chaser Gateway
//! HTTP surface: the cron trigger, manual per-invoice chase and schedule preview.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
