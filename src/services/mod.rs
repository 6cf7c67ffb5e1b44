//! Replication services, leaf-first: identity and credentials, token
//! issuance, storage gateway backends, copy orchestration, completion
//! records, telemetry and the pipeline that ties them together.

pub mod azure;
pub mod credentials;
pub mod gateway;
pub mod identity;
pub mod memory;
pub mod orchestrator;
pub mod pipeline;
pub mod recorder;
pub mod telemetry;
pub mod token_issuer;
