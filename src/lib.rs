//! # Shardwise
//! Data-distribution control plane for a replicated key-value store.
//!
//! Shardwise is the singleton service that decides *where* every key range of
//! a distributed, replicated key-value store lives, and that drives the data
//! movements required to keep the cluster in a healthy, policy-compliant
//! shape. It reconstructs the authoritative shard-to-team assignment at
//! startup from persisted metadata, resumes any in-flight data moves
//! abandoned by a previous incarnation, runs a continuous loop that emits
//! relocation work items, and serves out-of-band administrative requests
//! (cluster snapshotting, exclusion safety checks, storage consistency
//! audits).
//!
//! # Goals
//! - A bounded, resumable protocol for every transient disagreement: each
//!   shard has exactly one authoritative owning team at any moment
//! - Crash-at-any-point bootstrap: every init step is idempotent and fenced
//!   by the move-keys lock
//! - Clean seams: the transactional metadata store, the shard tracker, the
//!   relocation queue, and the team builders are trait collaborators
//!
//! # Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardwise::distribution::{DataDistributor, DistributorRequest};
//! use tokio::sync::mpsc;
//!
//! # async fn example(
//! #     txn: Arc<dyn shardwise::distribution::TxnProcessor>,
//! #     audit_client: Arc<dyn shardwise::distribution::StorageAuditClient>,
//! #     transport: Arc<dyn shardwise::distribution::SnapshotTransport>,
//! #     factory: Arc<dyn shardwise::distribution::ComponentFactory>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let (_requests_tx, requests_rx) = mpsc::channel::<DistributorRequest>(64);
//! let distributor = DataDistributor::builder()
//!     .txn_processor(txn)
//!     .audit_client(audit_client)
//!     .snapshot_transport(transport)
//!     .build();
//! distributor.serve(factory, requests_rx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The [`distribution`] module holds the control core; [`types`] the domain
//! primitives; [`telemetry`] the logging bootstrap.

#![forbid(unsafe_code)]

pub mod constants;
pub mod distribution;
pub mod error;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};
