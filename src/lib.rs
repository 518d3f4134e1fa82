//! Supervisory engine for autonomous development workflows.
//!
//! Entries appended to the activity log ([`log`]) are folded by the
//! [`analyzer`] into workflow state and issues; the [`intervention`]
//! generator turns issues into notifications and remediation tasks for the
//! [`queue`]; the [`compliance`] monitor and the output classifier in
//! [`rules`] feed the same pathways. The [`supervisor`] ties them together.

pub mod analyzer;
pub mod cli;
pub mod compliance;
pub mod config;
pub mod intervention;
pub mod issue;
pub mod log;
pub mod paths;
pub mod queue;
pub mod report;
pub mod rules;
pub mod scheduler;
pub mod shell_completion;
pub mod store;
pub mod supervisor;
