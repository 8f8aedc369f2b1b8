use crate::dispatch::DispatcherId;
use std::io;

/// Errors surfaced by dispatchers and by the tasks they run.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("invalid worker thread name {0:?}: names may not contain NUL bytes")]
    InvalidThreadName(String),

    /// `OnPanic::Stop` ended the worker. The dispatcher no longer executes
    /// anything and must be replaced.
    #[error("worker of dispatcher {id} stopped after a work item panicked")]
    WorkerPanicked { id: DispatcherId },

    /// A task spawned through a `TaskScheduler` panicked. The worker itself
    /// keeps running.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// The task was dropped without running to completion, because its
    /// dispatcher stopped first.
    #[error("task was abandoned before completing")]
    Abandoned,
}

impl DispatchError {
    pub fn is_panic(&self) -> bool {
        matches!(
            self,
            DispatchError::WorkerPanicked { .. } | DispatchError::TaskPanicked(_)
        )
    }
}

impl PartialEq for DispatchError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Spawn(a), Self::Spawn(b)) => a.kind() == b.kind(),
            (Self::InvalidThreadName(a), Self::InvalidThreadName(b)) => a == b,
            (Self::WorkerPanicked { id: a }, Self::WorkerPanicked { id: b }) => a == b,
            (Self::TaskPanicked(a), Self::TaskPanicked(b)) => a == b,
            (Self::Abandoned, Self::Abandoned) => true,
            _ => false,
        }
    }
}
