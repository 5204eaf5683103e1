use std::fmt;

use super::replay::DrainOutcome;

/// Where the sync core stands with respect to the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Offline,
    /// Online with nothing in flight.
    Idle,
    Syncing,
    /// Online, but the queue is halted on actions that need the user.
    Degraded { stuck: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    ConnectionRestored { stuck: usize },
    ConnectionLost,
    DrainStarted,
    DrainFinished { outcome: DrainOutcome, stuck: usize },
    /// The number of blocked actions changed outside a drain.
    StuckChanged { stuck: usize },
}

impl SyncPhase {
    pub fn apply(self, event: PhaseEvent) -> SyncPhase {
        match (self, event) {
            (_, PhaseEvent::ConnectionLost) => SyncPhase::Offline,
            (SyncPhase::Offline, PhaseEvent::ConnectionRestored { stuck }) => online(stuck),
            (SyncPhase::Idle | SyncPhase::Degraded { .. }, PhaseEvent::DrainStarted) => {
                SyncPhase::Syncing
            }
            (SyncPhase::Syncing, PhaseEvent::DrainFinished { stuck, .. }) => online(stuck),
            (SyncPhase::Idle | SyncPhase::Degraded { .. }, PhaseEvent::StuckChanged { stuck }) => {
                online(stuck)
            }
            (phase, _) => phase,
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, SyncPhase::Offline)
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncPhase::Syncing)
    }
}

fn online(stuck: usize) -> SyncPhase {
    if stuck > 0 {
        SyncPhase::Degraded { stuck }
    } else {
        SyncPhase::Idle
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Offline => f.write_str("offline"),
            SyncPhase::Idle => f.write_str("online"),
            SyncPhase::Syncing => f.write_str("syncing"),
            SyncPhase::Degraded { stuck } => write!(f, "online (degraded, {stuck} stuck)"),
        }
    }
}

/// Snapshot published to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    pub stuck_count: usize,
}

impl SyncStatus {
    pub fn new(phase: SyncPhase, pending_count: usize, stuck_count: usize) -> Self {
        Self {
            is_online: phase.is_online(),
            is_syncing: phase.is_syncing(),
            pending_count,
            stuck_count,
        }
    }
}

/// Platform events forwarded by the embedding app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
    Online,
    Offline,
    Foreground,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Reconnect,
    Foreground,
    Poll,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Poll => "poll",
        })
    }
}
