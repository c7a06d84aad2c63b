//! # proplens-core
//!
//! Shared vocabulary for the proplens realtime stack.
//!
//! - **Jobs**: [`JobStatus`], [`JobRecord`], [`JobInput`] as they travel over
//!   the GraphQL API and the subscription socket
//! - **Errors**: machine-readable [`errors::codes`] and the finalized
//!   [`JobError`] observers receive
//! - **Backoff**: [`BackoffPolicy`] for submission retries and reconnects
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod jobs;
pub mod logging;
pub mod retry;

pub use errors::JobError;
pub use jobs::{JobInput, JobRecord, JobStatus, Priority};
pub use retry::BackoffPolicy;
