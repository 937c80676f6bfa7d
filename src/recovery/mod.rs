//! Backoff and escalation after failed heals.
pub mod backoff;
pub mod policy;

pub use backoff::{Backoff, BackoffCurve};
pub use policy::{
    plan_escalation, EscalationInput, EscalationStep, FailureKind, HealGate, LogRefresher,
    RecoveryPolicy, RefreshReason, RefreshRequester, StallContext,
};
