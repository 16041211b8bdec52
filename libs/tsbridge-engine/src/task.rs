use std::fmt;

use crate::error::EngineError;

/// Which half of a pipeline a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Receiver,
    Writer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Receiver => f.write_str("receiver"),
            Role::Writer => f.write_str("writer"),
        }
    }
}

/// Identity of one supervised task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub topic: String,
    pub role: Role,
}

impl TaskId {
    pub fn new(topic: impl Into<String>, role: Role) -> Self {
        Self {
            topic: topic.into(),
            role,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.role, self.topic)
    }
}

/// Terminal state of a receiver or writer.
#[derive(Debug)]
pub enum TaskExit {
    /// Input ended cleanly (bus closed the stream, or the relay queue closed).
    Finished,
    /// Fatal fault for this pipeline.
    Faulted(EngineError),
    /// Stopped by the supervisor's shutdown signal.
    Cancelled,
}

impl TaskExit {
    pub fn is_faulted(&self) -> bool {
        matches!(self, TaskExit::Faulted(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskExit::Cancelled)
    }
}
