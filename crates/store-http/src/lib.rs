//! HTTP plumbing for [`lrs_store`]: a remote LRS as storage engine, and
//! forwarding of accepted statements to other LRSs.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────────────┐
//!                 │       StatementStore       │
//!                 │  (identity, reader, writer)│
//!                 └──────┬──────────────┬──────┘
//!            BackendAdapter      AcceptedStatementsSink
//!                        │              │
//!          ┌─────────────▼───┐   ┌──────▼───────────┐
//!          │   LrsAdapter    │   │ ForwarderHandle  │
//!          │ GET/POST xAPI   │   │ bounded queue    │
//!          └─────────────┬───┘   └──────┬───────────┘
//!                        │              │ TargetSource, per batch
//!                        │       ┌──────▼───────────┐
//!                        │       │ DeliveryClient   │
//!                        │       │ retry + timeout  │
//!                        ▼       └──────┬───────────┘
//!                  remote LRS     forwarding targets
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lrs_store::{StatementStore, StoreConfig};
//! use lrs_store_http::{
//!     EnvTargetSource, Forwarder, ForwarderConfig, HttpDeliveryClient, LrsAdapter,
//!     LrsAdapterConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = LrsAdapter::new(
//!         LrsAdapterConfig::builder().base_url("http://lrs.example.com:8100").build()?,
//!     )?;
//!     let forwarder = Forwarder::new(
//!         Arc::new(EnvTargetSource::default()),
//!         Arc::new(HttpDeliveryClient::new("1.0.3")?),
//!         ForwarderConfig::default(),
//!     )
//!     .spawn();
//!     let forwarder = Arc::new(forwarder);
//!
//!     let store = StatementStore::new(Arc::new(adapter), StoreConfig::default())?
//!         .with_sink(forwarder.clone());
//!     println!("{:?}", store.status().await);
//!
//!     forwarder.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Retries
//!
//! Reads, lookups and deliveries retry transient failures (connection
//! errors, timeouts, `429` and `5xx`) with exponential backoff and jitter,
//! see [`with_retry`]. Inserts through the adapter are never retried.

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod forwarder;
pub mod retry;
pub mod target;

pub use client::LrsAdapter;
pub use config::{ForwarderConfig, LrsAdapterConfig, RetryConfig};
pub use delivery::{DeliveryClient, HttpDeliveryClient};
pub use error::HttpError;
pub use forwarder::{Forwarder, ForwarderHandle, ForwarderStats, RelayOutcome, RelayState};
pub use retry::{compute_backoff, with_retry, with_retry_attempts};
pub use target::{
    Credentials, DEFAULT_TARGETS_ENV, EnvTargetSource, ForwardingTarget, StaticTargetSource,
    TargetSource,
};
