//! Turning a lost connection back into a live one.
//!
//! [`RecoveryStrategyDispatcher`] picks and runs the action for one
//! categorized error. [`ConnectionRecoveryOrchestrator`] owns the session
//! state, the heartbeat and the dispatcher and drives the whole
//! disconnect, recover and restore cycle.

pub mod orchestrator;
pub mod strategy;

pub use orchestrator::{
    Collaborators, ConnectionRecoveryOrchestrator, ConnectionTestResult, OrchestratorConfig,
    RecoveryNotice, RecoveryStatus,
};
pub use strategy::{RecoveryConfig, RecoveryResult, RecoveryStrategy, RecoveryStrategyDispatcher};
