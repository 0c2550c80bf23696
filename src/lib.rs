//! # HTTP↔NNTP Gateway Library
//!
//! Exposes Usenet articles as HTTP resources addressed by Message-ID.
//! Requests are multiplexed over a fleet of pooled NNTP sessions spread
//! across one or more upstream providers.
//!
//! ## Architecture
//!
//! - **config**: TOML configuration loading and validation
//! - **nntp**: Message-ID validation, response codes, typed errors and the
//!   async NNTP session
//! - **pool**: per-upstream bounded connection sets with idle expiry,
//!   waiter queues and a single controller task owning all state
//! - **dispatch**: deterministic Message-ID → server mapping plus the
//!   retry loop that classifies protocol vs. transport errors
//! - **http**: axum handlers, byte-range/precondition machinery and
//!   header propagation
//! - **assets**: the embedded browser UI
//!
//! ## Design
//!
//! The pool is modeled as a single-writer task with message-passing
//! inbound channels, which keeps the per-server accounting invariants
//! local to one file and eliminates fine-grained locking. Server selection
//! hashes the Message-ID so retries are deterministic and the same article
//! consistently lands on the same upstream.

pub mod assets;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod logging;
pub mod nntp;
pub mod pool;

pub use config::{Config, ServerConfig, load_config};
pub use dispatch::Dispatcher;
pub use http::{AppState, build_router};
pub use pool::{BufferPool, Pool};
