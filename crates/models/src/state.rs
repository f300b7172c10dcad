use crate::error::DockhandError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline progress. Transitions only move one step forward; a failure
/// anywhere sends the next attempt back to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Uninitialized,
    BaseReady,
    DependenciesInstalled,
    Assembled,
    /// Reached only outside the pipeline, when a runtime starts the image.
    Running,
}

impl PipelineState {
    pub fn successor(self) -> Option<PipelineState> {
        match self {
            PipelineState::Uninitialized => Some(PipelineState::BaseReady),
            PipelineState::BaseReady => Some(PipelineState::DependenciesInstalled),
            PipelineState::DependenciesInstalled => Some(PipelineState::Assembled),
            PipelineState::Assembled => Some(PipelineState::Running),
            PipelineState::Running => None,
        }
    }

    pub fn advance(self, next: PipelineState) -> Result<PipelineState, DockhandError> {
        if self.successor() == Some(next) {
            Ok(next)
        } else {
            Err(DockhandError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
