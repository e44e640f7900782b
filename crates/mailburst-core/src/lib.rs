//! Mailburst Core - Bulk mail dispatch engine
//!
//! This crate provides the dispatch engine for Mailburst: recipient
//! validation, batch decomposition, rate-limited sending with retry, and
//! per-batch/per-job progress and result aggregation.

pub mod batch;
pub mod dispatch;
pub mod events;
pub mod job;
pub mod queue;
pub mod transport;
pub mod validate;

pub use batch::{BatchProcessor, BatchRunOutcome, PacingConfig};
pub use dispatch::{DispatchAbort, Dispatcher, RetryPolicy};
pub use events::EventBus;
pub use job::{CancelToken, JobCoordinator, JobCounters};
pub use queue::Engine;
pub use transport::{
    MailTransport, SmtpConnector, SmtpTransportFactory, TransportError, TransportFactory,
};
pub use validate::{DnsMxLookup, DomainCache, DomainVerdict, MxLookup, RecipientValidator, Verdict};
