//! mail-ingest: IMAP mailbox ingestion core.

pub mod config;
pub mod error;
pub mod governor;
pub mod health;
pub mod ingest;
pub mod mailbox;
pub mod store;
