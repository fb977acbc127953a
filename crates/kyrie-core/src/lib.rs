//! kyrie-core library.
//!
//! Keeps a project's issue board consistent across optimistic local moves,
//! server confirmation or rejection, and remote changes pushed over a change
//! feed. The pieces, in dependency order:
//!
//! - [`store`]: the board's id-keyed, insertion-ordered issue set.
//! - [`listener`]: merges narrowed [`event::ChangeEvent`]s into the store.
//! - [`controller`]: optimistic moves with rollback on failure.
//!
//! [`board::BoardSession`] owns a store and hands out the other two.
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums at library seams, `anyhow::Result` for loaders.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod board;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod feed;
pub mod listener;
pub mod model;
pub mod store;

pub use board::{BoardSession, SnapshotSource};
