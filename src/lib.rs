//! Nixopus deployment core.
//!
//! The server half ([`deploy`]) turns deployment triggers into queued tasks
//! that clone, build, run and expose applications through the adapter
//! traits in [`docker`], [`git`], [`proxy`] and [`ssh`]. The client half
//! ([`sync`]) streams a developer's working tree to a live-dev container.

pub mod config;
pub mod deploy;
pub mod docker;
pub mod errors;
pub mod git;
pub mod logging;
pub mod proxy;
pub mod ssh;
pub mod sync;

#[cfg(test)]
pub mod testing;
