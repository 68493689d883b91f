//! Shared plumbing for the texres workspace: console variables, wildcard
//! matching and logging setup.

pub mod wildcards;
pub mod cvar;
pub mod logging;
