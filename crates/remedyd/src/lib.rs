//! Remedy daemon library - exposes modules for testing.

pub mod approval;
pub mod autopatch_plan;
pub mod change_feed;
pub mod config;
pub mod dedup;
pub mod executor;
pub mod file_writer;
pub mod health;
pub mod heartbeat;
pub mod interceptor;
pub mod knowledge;
pub mod metrics;
pub mod monitor;
pub mod planner;
pub mod remote_exec;
pub mod router;
pub mod routes;
pub mod server;
pub mod store;
pub mod verifier;
