//! Pipeline stages and their results.
//!
//! The pipeline runs a fixed sequence of stages; each is delegated to an
//! external collaborator and reported back as an immutable [`StageResult`].

mod result;

pub use result::{StageOutcome, StageResult};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The stages of a study pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Parse the uploaded document.
    Parse,
    /// Compute financial metrics.
    Calculate,
    /// Run compliance rules.
    Validate,
    /// Generate the narrative.
    Narrate,
    /// Record the run in the audit trail.
    Audit,
}

impl StageName {
    /// All stages in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Parse,
        Self::Calculate,
        Self::Validate,
        Self::Narrate,
        Self::Audit,
    ];

    /// Returns the `snake_case` name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Calculate => "calculate",
            Self::Validate => "validate",
            Self::Narrate => "narrate",
            Self::Audit => "audit",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
