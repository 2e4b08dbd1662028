//! Workflow orchestration engine for docflow.
//!
//! Drives one analysis job per document through the state machine
//! `Initialize → Wait → ProcessResults → Decide → {Success | Failure}`:
//! submit the job, poll until it finishes, drain every result page into the
//! object store, and checkpoint the context between steps.

pub mod client;
pub mod contracts;
pub mod executor;
pub mod paginator;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
