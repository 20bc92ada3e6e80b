//! Pipeline state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    /// Submitted, not yet started.
    Initializing,
    /// Parsing the document.
    Parse,
    /// Calculating and validating concurrently.
    Parallel,
    /// Generating the narrative.
    Narrate,
    /// Writing the run to the audit trail.
    Audit,
    /// Collecting outstanding work before completion.
    Finalizing,
    /// Finished successfully.
    Completed,
    /// Finished with a failed stage.
    Failed,
    /// Finished after observing cancellation.
    Cancelled,
}

impl PipelineStatus {
    /// Returns true for COMPLETED, FAILED and CANCELLED.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The status that follows this one on the success path.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Initializing => Some(Self::Parse),
            Self::Parse => Some(Self::Parallel),
            Self::Parallel => Some(Self::Narrate),
            Self::Narrate => Some(Self::Audit),
            Self::Audit => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::Cancelled => None,
        }
    }

    /// Returns true if the state machine allows moving to `to`.
    ///
    /// Non-terminal states may advance along the success path or end in
    /// FAILED or CANCELLED. Terminal states never move.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(to, Self::Failed | Self::Cancelled) || self.next() == Some(to)
    }

    /// Returns the upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Parse => "PARSE",
            Self::Parallel => "PARALLEL",
            Self::Narrate => "NARRATE",
            Self::Audit => "AUDIT",
            Self::Finalizing => "FINALIZING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
