// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};

/// Lifecycle state of a node.
///
/// `Flushing` is transient: a node enters it for the duration of a flush and
/// returns to the state it was flushed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Constructed, no stream resources prepared yet
    #[default]
    Uninitialized,
    /// Per-stream resources prepared, not yet running
    Initialized,
    /// Actively moving buffers
    Running,
    /// Discarding in-flight buffers
    Flushing,
    /// Stopped; may be re-initialized or restarted
    Stopped,
}

impl NodeState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Initialized => 1,
            Self::Running => 2,
            Self::Flushing => 3,
            Self::Stopped => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Flushing,
            4 => Self::Stopped,
            _ => Self::Uninitialized,
        }
    }

    /// How a lifecycle operation requested in this state is handled.
    pub fn admits(self, op: LifecycleOp) -> Admission {
        use Admission::*;
        use LifecycleOp as Op;
        use NodeState as S;

        match (op, self) {
            (Op::Init, S::Uninitialized | S::Initialized | S::Stopped) => Proceed,
            (Op::Init, S::Running | S::Flushing) => Skip,

            (Op::Start, S::Initialized | S::Stopped) => Proceed,
            (Op::Start, S::Running | S::Flushing) => Skip,
            (Op::Start, S::Uninitialized) => Reject,

            // Initialized covers a start that failed part way.
            (Op::Stop, S::Running | S::Flushing | S::Initialized) => Proceed,
            (Op::Stop, S::Stopped | S::Uninitialized) => Skip,

            (Op::Flush, S::Running | S::Stopped) => Proceed,
            (Op::Flush, S::Uninitialized | S::Initialized | S::Flushing) => Skip,

            (Op::Config, S::Uninitialized) => Reject,
            (Op::Config, _) => Proceed,
        }
    }

    /// State after `op` succeeds from `self`.
    pub fn after(self, op: LifecycleOp) -> NodeState {
        match op {
            LifecycleOp::Init => Self::Initialized,
            LifecycleOp::Start => Self::Running,
            LifecycleOp::Stop => Self::Stopped,
            LifecycleOp::Flush | LifecycleOp::Config => self,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Initialized => write!(f, "Initialized"),
            Self::Running => write!(f, "Running"),
            Self::Flushing => write!(f, "Flushing"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Control-plane operations driven on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleOp {
    Init,
    Start,
    Stop,
    Flush,
    Config,
}

impl LifecycleOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Flush => "flush",
            Self::Config => "config",
        }
    }
}

/// Outcome of checking an operation against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the operation.
    Proceed,
    /// Tolerated misuse: report success without doing anything.
    Skip,
    /// Refuse with an error.
    Reject,
}
