//! Workspace façade crate.
//!
//! Re-exports the session orchestrator and its runtime layer so host
//! applications can depend on a single crate. The `desktop-shims` feature
//! (default) wires the reqwest/keyring bridges in as configuration defaults.

pub use bridge_traits;
pub use core_auth;
pub use core_runtime;

pub use core_auth::{AuthError, AuthOrchestrator, OrchestratorState};
pub use core_runtime::config::AuthConfig;
