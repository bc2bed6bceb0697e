//! Operating status of processing entities.

use std::fmt;

/// Lifecycle status of a dynamo or environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingStatus {
    Running,
    Paused,
    ShuttingDown,
    Failed,
    Offline,
}

impl OperatingStatus {
    /// The status to display given whether the whole engine is paused.
    ///
    /// Only `Running` is demoted; the stored status is left untouched.
    pub fn displayed(self, is_engine_paused: bool) -> Self {
        match self {
            Self::Running if is_engine_paused => Self::Paused,
            other => other,
        }
    }

    /// Whether the entity can still accept work.
    pub fn is_processing(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for OperatingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::ShuttingDown => "Shutting Down",
            Self::Failed => "Failed",
            Self::Offline => "Offline",
        };
        f.write_str(text)
    }
}
