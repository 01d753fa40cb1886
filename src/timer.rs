//! Call duration tracking
//!
//! A shared stopwatch that starts when a call connects and clears when the
//! call ends. Cloned handles observe the same underlying start instant, so
//! UI polls and the engine loop can read elapsed time concurrently.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Tracks elapsed time for the active call
#[derive(Clone, Default)]
pub struct CallTimer {
    started: Arc<RwLock<Option<Instant>>>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the timer from zero
    pub fn start(&self) {
        if let Ok(mut started) = self.started.write() {
            *started = Some(Instant::now());
        }
    }

    /// Stop the timer and forget the start instant
    pub fn clear(&self) {
        if let Ok(mut started) = self.started.write() {
            *started = None;
        }
    }

    /// Elapsed time since `start`, or zero when the timer is not running
    pub fn elapsed(&self) -> Duration {
        match self.started.read() {
            Ok(started) => started
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO),
            Err(_) => Duration::ZERO,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started
            .read()
            .map(|started| started.is_some())
            .unwrap_or(false)
    }
}

/// Format a duration as `mm:ss` for display alongside the call state
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{:02}:{:02}", total / 60, total % 60)
}
