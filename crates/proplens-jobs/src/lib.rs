//! # proplens-jobs
//!
//! Submits analysis jobs and follows them to completion.
//!
//! - [`rpc`]: the `createJob` mutation over HTTP ([`JobApi`])
//! - [`monitor`]: submission retry, one realtime subscription per job,
//!   reconnect backoff, terminal detection ([`JobMonitor`])
//! - [`store`]: keyed, observable job state and update history ([`JobStore`])

#![deny(unsafe_code)]

pub mod monitor;
pub mod rpc;
pub mod store;

pub use monitor::{
    JOB_UPDATED_PATH, JOB_UPDATED_SUBSCRIPTION, JobCompletion, JobMonitor, JobTicket,
    MonitorConfig, SubmitError,
};
pub use rpc::{ApiError, GraphqlJobApi, JobApi};
pub use store::{
    ConnectionState, JobSnapshot, JobState, JobStatePatch, JobStore, StoreChange,
};
