//! Command implementations

pub mod approve;
pub mod config;
pub mod deploy;
pub mod plan;
pub mod run;
pub mod status;
pub mod unlock;
pub mod version;
