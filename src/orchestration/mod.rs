//! Orchestration layer: agent lifecycle, merge queue, health monitoring and
//! the control loop that drives them.

mod control;
mod escalation;
mod health;
mod lifecycle;
mod merge;
mod runtime;

pub use control::{ControlConfig, ControlLoop, TickReport};
pub use escalation::{backoff, CrashDecision, EscalationLevel};
pub use health::{HealthConfig, HealthEvent, HealthMonitor, RestartRequest};
pub use lifecycle::{CrashOutcome, LifecycleConfig, LifecycleManager, StallReport};
pub use merge::{CleanupReport, MergeConfig, MergeCoordinator, MergeOutcome};
pub use runtime::{ActorHandle, Orchestrator};
