// =============================================================================
// Notifier port — opaque notify(title, body, colour) sink
// =============================================================================
//
// The real notification backend (push/email/SMS) is an external collaborator
// (§1, out of scope). This crate defines the port and a logging-backed
// default implementation that satisfies it: GREEN/YELLOW/RED map onto
// `info!`/`warn!`/`error!` respectively, matching severity-to-log-level
// conventions used throughout the teacher crate.
// =============================================================================

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::types::Colour;

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str, colour: Colour);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, title: &str, body: &str, colour: Colour) {
        match colour {
            Colour::Green => info!(title, body, "notification"),
            Colour::Yellow => warn!(title, body, "notification"),
            Colour::Red => error!(title, body, "notification"),
        }
    }
}

/// In-process fake recording every call, for assertions like P7/P8 in tests.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(String, String, Colour)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, String, Colour)> {
        self.calls.lock().clone()
    }

    pub fn count_colour(&self, colour: Colour) -> usize {
        self.calls.lock().iter().filter(|(_, _, c)| *c == colour).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str, colour: Colour) {
        self.calls.lock().push((title.to_string(), body.to_string(), colour));
    }
}
