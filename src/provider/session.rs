use std::fmt;
use std::sync::Mutex;

use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use super::ProviderEvent;

/// Connectivity state of one provider, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    Offline,
    Ready,
    Working,
    ErrorState,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Offline => "Offline",
            SessionStatus::Ready => "Ready",
            SessionStatus::Working => "Working",
            SessionStatus::ErrorState => "Error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connected: bool,
    pub status: SessionStatus,
    pub message: String,
    pub secondary_message: String,
}

impl SessionSnapshot {
    pub fn is_busy(&self) -> bool {
        self.status == SessionStatus::Working
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connected: false,
            status: SessionStatus::Offline,
            message: String::new(),
            secondary_message: String::new(),
        }
    }
}

/// Shared provider session. Every property change is announced on the event channel.
pub struct ProviderSession {
    state: Mutex<SessionSnapshot>,
    events: UnboundedSender<ProviderEvent>,
}

impl ProviderSession {
    pub fn new(events: UnboundedSender<ProviderEvent>) -> Self {
        Self {
            state: Mutex::new(SessionSnapshot::default()),
            events,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().connected
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot().status
    }

    pub fn is_busy(&self) -> bool {
        self.snapshot().is_busy()
    }

    pub fn set_connected(&self, connected: bool) {
        self.update("connected", |state| {
            let changed = state.connected != connected;
            state.connected = connected;
            changed
        });
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.update("status", |state| {
            let changed = state.status != status;
            state.status = status;
            changed
        });
    }

    pub fn set_message<T: Into<String>>(&self, message: T) {
        let message = message.into();
        self.update("message", |state| {
            let changed = state.message != message;
            state.message = message;
            changed
        });
    }

    pub fn set_secondary_message<T: Into<String>>(&self, message: T) {
        let message = message.into();
        self.update("secondary_message", |state| {
            let changed = state.secondary_message != message;
            state.secondary_message = message;
            changed
        });
    }

    fn update<F>(&self, property: &'static str, apply: F)
    where
        F: FnOnce(&mut SessionSnapshot) -> bool,
    {
        let changed = {
            let mut guard = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            apply(&mut guard)
        };

        if changed {
            debug!("provider session property changed: {property}");
            let _ = self
                .events
                .send(ProviderEvent::SessionPropertyChanged(property));
        }
    }
}
