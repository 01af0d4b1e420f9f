//! Client-side cache and state synchronization for a code-review API.

pub mod app;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod review;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;
