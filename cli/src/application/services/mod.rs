//! Application services: use-case orchestration.
//!
//! Each service module implements a single use-case by composing domain logic
//! with port trait calls. Services import only from `crate::domain` and
//! `crate::application::ports`; never from `crate::infra`, `crate::commands`,
//! or `crate::output`.

pub mod approval_gate;
pub mod config_service;
pub mod convergence;
pub mod decision;
pub mod discovery;
pub mod orchestrator;
pub mod poll;
pub mod provision;
pub mod readiness;
pub mod status;
pub mod verifier;
