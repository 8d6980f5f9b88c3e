use std::fmt;

/// Lifecycle of one tunnel session.
///
/// ```text
/// Disconnected -> Connecting -> Running -> Reconnecting -> (Connecting | Failed)
/// any state -> Stopped on external stop
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Running,
    Reconnecting,
    /// Retries exhausted and persistent retry disabled.
    Failed,
    /// External stop; all resources released.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };

        f.write_str(s)
    }
}
