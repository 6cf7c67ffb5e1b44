//! Core data model of the replication pipeline.
//!
//! Descriptors and copy state come from the storage service, tokens and
//! credentials from the identity side, and completion records map to the
//! `FilesCopied` table via `sqlx::FromRow`.

pub mod authorization;
pub mod completion;
pub mod copy;
pub mod event;
pub mod source_object;
