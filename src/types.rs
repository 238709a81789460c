//! Core types for the Floweave dataflow engine.
//!
//! This module defines the fundamental vocabulary used throughout the engine:
//! the kinds of graph vertices, the per-component lifecycle states, and the
//! scheduling strategies that bind a component to one of the worker pools.
//!
//! # Examples
//!
//! ```rust
//! use floweave::types::{ConnectableKind, ScheduledState, SchedulingStrategy};
//!
//! let kind = ConnectableKind::Processor;
//! assert!(kind.is_processor());
//!
//! let state = ScheduledState::Stopped;
//! assert!(!state.is_running());
//!
//! let strategy = SchedulingStrategy::TimerDriven;
//! assert!(!strategy.is_event_driven());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the type of a vertex within the flow graph.
///
/// Every connectable is exactly one of these kinds for its entire lifetime.
/// The kind decides how the engine triggers it: processors dispatch into
/// their plug-in, every other kind relays flow files from its inbound
/// queues to its outbound connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectableKind {
    /// A processing node backed by a plug-in implementation.
    Processor,
    /// A passive entry point into a process group.
    InputPort,
    /// A passive exit point out of a process group.
    OutputPort,
    /// A many-to-one merge point with no logic of its own.
    Funnel,
    /// The receiving side of a remote group's port.
    RemoteInputPort,
    /// The sending side of a remote group's port.
    RemoteOutputPort,
    /// A root-group port reachable over site-to-site.
    RootInputPort,
    /// A root-group port reachable over site-to-site.
    RootOutputPort,
}

impl ConnectableKind {
    #[must_use]
    pub fn is_processor(&self) -> bool {
        matches!(self, Self::Processor)
    }

    /// True for the two root-group port kinds.
    #[must_use]
    pub fn is_root_port(&self) -> bool {
        matches!(self, Self::RootInputPort | Self::RootOutputPort)
    }

    /// True for local and root input ports.
    #[must_use]
    pub fn is_input_port(&self) -> bool {
        matches!(self, Self::InputPort | Self::RootInputPort)
    }

    /// True for local and root output ports.
    #[must_use]
    pub fn is_output_port(&self) -> bool {
        matches!(self, Self::OutputPort | Self::RootOutputPort)
    }
}

impl fmt::Display for ConnectableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Processor => "processor",
            Self::InputPort => "input-port",
            Self::OutputPort => "output-port",
            Self::Funnel => "funnel",
            Self::RemoteInputPort => "remote-input-port",
            Self::RemoteOutputPort => "remote-output-port",
            Self::RootInputPort => "root-input-port",
            Self::RootOutputPort => "root-output-port",
        };
        write!(f, "{label}")
    }
}

/// Per-component lifecycle state.
///
/// Transitions are owned by the scheduled-state machine in
/// [`crate::scheduling::lifecycle`]: `Disabled ⇄ Stopped ⇄ Running`, with
/// `Disabled → Running` and `Running → Disabled` rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduledState {
    /// Excluded from scheduling; must be enabled before it can start.
    Disabled,
    /// Eligible to start but not currently scheduled.
    Stopped,
    /// Actively scheduled on one of the worker pools.
    Running,
}

impl ScheduledState {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl fmt::Display for ScheduledState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disabled => "disabled",
            Self::Stopped => "stopped",
            Self::Running => "running",
        };
        write!(f, "{label}")
    }
}

/// How a component's triggers are driven.
///
/// The strategy decides which worker pool runs the component and how the
/// component's scheduling period string is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    /// Trigger every period on the timer pool. The period is a duration.
    TimerDriven,
    /// Trigger on wall-clock matches of a cron expression, timer pool.
    CronDriven,
    /// Trigger when an inbound queue becomes non-empty, event pool.
    EventDriven,
    /// Timer-driven, but only while this node is the elected primary.
    PrimaryNodeOnly,
}

impl SchedulingStrategy {
    #[must_use]
    pub fn is_event_driven(&self) -> bool {
        matches!(self, Self::EventDriven)
    }

    #[must_use]
    pub fn is_primary_only(&self) -> bool {
        matches!(self, Self::PrimaryNodeOnly)
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::TimerDriven => "timer-driven",
            Self::CronDriven => "cron-driven",
            Self::EventDriven => "event-driven",
            Self::PrimaryNodeOnly => "primary-node-only",
        };
        write!(f, "{label}")
    }
}

/// Canvas position of a component. Purely presentational; carried through
/// creation and snippet instantiation untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}
