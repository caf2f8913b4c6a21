//! Job orchestration for branded document generation.
//!
//! A job is routed to one of several backends, admitted against a spending
//! budget, executed behind a per-service circuit breaker (and, for the
//! single-instance design tool, a mutual-exclusion gate), then validated by a
//! quality gate with at most one corrective retry.

pub mod backend;
pub mod circuit;
pub mod cli;
pub mod config;
pub mod cost;
pub mod error;
pub mod experiment;
pub mod fallback;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod quality;
pub mod reports;
pub mod router;
pub mod serializer;
pub mod state_machine;
pub mod ui;
pub mod validator;
