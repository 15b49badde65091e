//! Dependency scheduling for workflow plans.
//!
//! A plan's `depends_on` relation is turned into a `DependencyGraph`, checked
//! for duplicate ids, dangling references and cycles before anything runs.
//! The graph then hands out waves: every pending step whose dependencies are
//! all terminal. Steps downstream of a failed or skipped step are cascaded to
//! `skipped` instead of being handed out.

pub mod scheduler;

pub use scheduler::DependencyGraph;
