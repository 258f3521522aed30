use std::fmt;

use crate::provider::{SessionSnapshot, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Database,
    Provider,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSource::Database => f.write_str("Database"),
            ErrorSource::Provider => f.write_str("Provider"),
        }
    }
}

/// The manager's own state, before the provider is taken into account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    pub busy: bool,
    pub error: Option<(ErrorSource, String)>,
}

impl LocalState {
    pub fn status(&self) -> SessionStatus {
        if self.error.is_some() {
            SessionStatus::ErrorState
        } else if self.busy {
            SessionStatus::Working
        } else {
            SessionStatus::Ready
        }
    }
}

/// More severe of two statuses: errors dominate, then work, else the lower one.
pub fn combine(local: SessionStatus, provider: SessionStatus) -> SessionStatus {
    if local == SessionStatus::ErrorState || provider == SessionStatus::ErrorState {
        SessionStatus::ErrorState
    } else if local == SessionStatus::Working || provider == SessionStatus::Working {
        SessionStatus::Working
    } else {
        local.min(provider)
    }
}

pub fn composite_status(local: &LocalState, provider: &SessionSnapshot) -> SessionStatus {
    combine(local.status(), provider.status)
}

pub fn status_message(local: &LocalState, provider: &SessionSnapshot) -> String {
    if let Some((source, message)) = &local.error {
        return format!("{source} error: {message}");
    }
    if provider.status == SessionStatus::ErrorState {
        return format!("{} error: {}", ErrorSource::Provider, provider.message);
    }
    if local.busy {
        return "Loading securities".to_string();
    }
    if provider.message.is_empty() {
        provider.status.to_string()
    } else {
        provider.message.clone()
    }
}
