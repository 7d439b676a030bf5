//! Configuration and policy
//!
//! Worker settings, typed job configuration, interpreter templates and
//! validation.

pub mod job;
pub mod presets;
pub mod settings;
pub mod types;
pub mod validator;
