// Navigation collaborators
// Session transitions announce where the application should go next

use std::sync::Mutex;

/// Fire-and-forget page navigation
pub trait Navigator: Send + Sync {
    fn navigate_to(&self, path: &str);
}

/// Navigator that only logs the destination (headless use)
#[derive(Debug, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate_to(&self, path: &str) {
        tracing::info!(path = %path, "Navigating");
    }
}

/// Navigator that keeps every destination in order
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    history: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    /// All destinations so far, oldest first
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Most recent destination
    pub fn last(&self) -> Option<String> {
        self.history().pop()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate_to(&self, path: &str) {
        tracing::debug!(path = %path, "Navigating");
        if let Ok(mut history) = self.history.lock() {
            history.push(path.to_string());
        }
    }
}
