//! # dockyard-manager
//!
//! The process that turns uploads into running applications.
//!
//! ## Modes
//!
//! - **Service mode** (`serve`, the default): polls the bucket on an interval
//!   and serves health, metrics and ledger endpoints
//! - **Single poll** (`once`): one tick, then waits for its pipelines
//! - **Operator commands**: `upload`, `ledger list`, `ledger reset`
//!
//! ## Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - 200 once a poll has succeeded within the unhealthy threshold
//! - `GET /metrics` - Prometheus exposition
//! - `GET /ledger`, `GET /ledger/:app/:version` - ledger entries as JSON
//! - `POST /ledger/:app/:version/reset` - clear the attempts of a FAILED entry
//!
//! ## Usage
//!
//! ```bash
//! # Run as service
//! DOCKYARD_BUCKET=gs://uploads DOCKYARD_REGISTRY_URL=gcr.io/acme \
//!   DOCKYARD_DOMAIN=apps.example.com dockyard-manager serve
//!
//! # Publish an archive
//! dockyard-manager upload site.tar.gz --app widgets --version v1.0
//!
//! # Re-enable an identity that exhausted its attempts
//! dockyard-manager ledger reset widgets v1.0
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// Operator commands print their results.
#![allow(clippy::print_stdout)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod service;
pub mod upload;

pub use cli::{Cli, Commands};
pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use service::{Components, Manager, PollHealth};
