//! The per-component scheduled-state machine.
//!
//! States are `Disabled`, `Stopped`, `Running`. Every transition is guarded
//! by a verify function and applied atomically against the component's
//! state cell, so two racing callers cannot both win the same transition.

use miette::Diagnostic;
use thiserror::Error;

use crate::model::connectable::Connectable;
use crate::plugin::ReportingTaskNode;
use crate::types::ScheduledState;

/// Illegal transitions and guard failures.
#[derive(Debug, Error, Diagnostic)]
pub enum LifecycleError {
    #[error("cannot {action} {id}: component is {actual}")]
    #[diagnostic(code(floweave::lifecycle::illegal_transition))]
    IllegalTransition {
        id: String,
        action: &'static str,
        actual: ScheduledState,
    },

    #[error("cannot start {id}: component is not valid")]
    #[diagnostic(
        code(floweave::lifecycle::invalid),
        help("Fix the component's configuration; validation must pass before starting.")
    )]
    NotValid { id: String },
}

/// `Disabled → Stopped`.
pub fn enable(component: &Connectable) -> Result<(), LifecycleError> {
    component
        .compare_and_set_state(ScheduledState::Disabled, ScheduledState::Stopped)
        .map_err(|actual| LifecycleError::IllegalTransition {
            id: component.id().to_string(),
            action: "enable",
            actual,
        })
}

/// `Stopped → Disabled`. Rejected while Running.
pub fn disable(component: &Connectable) -> Result<(), LifecycleError> {
    component
        .compare_and_set_state(ScheduledState::Stopped, ScheduledState::Disabled)
        .map_err(|actual| LifecycleError::IllegalTransition {
            id: component.id().to_string(),
            action: "disable",
            actual,
        })
}

/// Guard for `Stopped → Running`: state and validity both checked.
pub fn verify_can_start(component: &Connectable) -> Result<(), LifecycleError> {
    let state = component.scheduled_state();
    if state != ScheduledState::Stopped {
        return Err(LifecycleError::IllegalTransition {
            id: component.id().to_string(),
            action: "start",
            actual: state,
        });
    }
    if !component.is_valid() {
        return Err(LifecycleError::NotValid {
            id: component.id().to_string(),
        });
    }
    Ok(())
}

/// `Stopped → Running`. The validity predicate is consulted immediately
/// before the transition is applied.
pub fn start(component: &Connectable) -> Result<(), LifecycleError> {
    if !component.is_valid() {
        return Err(LifecycleError::NotValid {
            id: component.id().to_string(),
        });
    }
    component
        .compare_and_set_state(ScheduledState::Stopped, ScheduledState::Running)
        .map_err(|actual| LifecycleError::IllegalTransition {
            id: component.id().to_string(),
            action: "start",
            actual,
        })
}

/// Guard for `Running → Stopped`.
pub fn verify_can_stop(component: &Connectable) -> Result<(), LifecycleError> {
    let state = component.scheduled_state();
    if state != ScheduledState::Running {
        return Err(LifecycleError::IllegalTransition {
            id: component.id().to_string(),
            action: "stop",
            actual: state,
        });
    }
    Ok(())
}

/// `Running → Stopped`.
pub fn stop(component: &Connectable) -> Result<(), LifecycleError> {
    component
        .compare_and_set_state(ScheduledState::Running, ScheduledState::Stopped)
        .map_err(|actual| LifecycleError::IllegalTransition {
            id: component.id().to_string(),
            action: "stop",
            actual,
        })
}

/// Guard for removal: anything but Running may be deleted.
pub fn verify_can_delete(component: &Connectable) -> Result<(), LifecycleError> {
    let state = component.scheduled_state();
    if state.is_running() {
        return Err(LifecycleError::IllegalTransition {
            id: component.id().to_string(),
            action: "delete",
            actual: state,
        });
    }
    Ok(())
}

/// `Stopped → Running` for a reporting task node.
pub fn start_reporting_task(node: &ReportingTaskNode) -> Result<(), LifecycleError> {
    let state = node.scheduled_state();
    if state != ScheduledState::Stopped {
        return Err(LifecycleError::IllegalTransition {
            id: node.id().to_string(),
            action: "start",
            actual: state,
        });
    }
    node.store_scheduled_state(ScheduledState::Running);
    Ok(())
}

/// `Running → Stopped` for a reporting task node.
pub fn stop_reporting_task(node: &ReportingTaskNode) -> Result<(), LifecycleError> {
    let state = node.scheduled_state();
    if state != ScheduledState::Running {
        return Err(LifecycleError::IllegalTransition {
            id: node.id().to_string(),
            action: "stop",
            actual: state,
        });
    }
    node.store_scheduled_state(ScheduledState::Stopped);
    Ok(())
}
