//! Poll-cycle ingestion: model, policy, threading, service and scheduler.

pub mod model;
pub mod policy;
pub mod poller;
pub mod service;
pub mod thread;

pub use model::{
    CycleHistory, CycleOutcome, CycleReport, CycleState, CycleSummary, Direction,
    IngestedMessage, MailboxCursor, RejectReason, Rejection, UpsertOutcome,
};
pub use policy::{NoopClassifier, PolicyGate, RuleSpamClassifier, SpamClassifier, SpamVerdict};
pub use poller::spawn_ingest_poller;
pub use service::IngestionService;
