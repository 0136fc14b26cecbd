//! Server-side deployment core.
//!
//! Triggers in [`service`] persist rows and enqueue [`models::TaskPayload`]s
//! on the named [`queue`]s; the handlers in [`pipeline`] and [`live_dev`]
//! turn them into clone, build, run and proxy steps against the adapter
//! traits. [`server`] exposes all of it over HTTP.

pub mod api;
pub mod build;
pub mod context;
pub mod db;
pub mod frameworks;
pub mod ingest;
pub mod live_dev;
pub mod models;
pub mod pipeline;
pub mod ports;
pub mod queue;
pub mod rotation;
pub mod server;
pub mod service;
pub mod webhook;
