//! Explicit run context threaded through every stage boundary.
//!
//! Nothing here is global: the orchestrator builds one [`RunContext`] at run
//! start and passes it down explicitly. Workers check the embedded
//! [`CancelToken`] between attempts; the token trips either programmatically,
//! via the optional run deadline, or through the opt-in signal bridge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

/// Cooperative cancellation handle. Cheap to clone; all clones observe the
/// same flag and deadline.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// Token that additionally trips once `budget` has elapsed.
    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + budget),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Relaxed) {
            return true;
        }
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline trips, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Route SIGINT/SIGTERM into this token. First signal cancels
    /// gracefully; a second one force-exits with the conventional 130.
    ///
    /// Intended for binary embedders; library code never installs handlers
    /// on its own.
    pub fn hook_signals(&self) -> Result<()> {
        let for_term = self.flag.clone();
        let for_int = self.flag.clone();
        // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGTERM, move || {
                if for_term.swap(true, Ordering::Relaxed) {
                    std::process::exit(130);
                }
            })
            .context("failed to register SIGTERM handler")?;
            signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
                if for_int.swap(true, Ordering::Relaxed) {
                    std::process::exit(130);
                }
            })
            .context("failed to register SIGINT handler")?;
        }
        Ok(())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity and control state for one pipeline run, passed by reference
/// through extraction, transform, validation, and write.
#[derive(Clone)]
pub struct RunContext {
    /// Opaque stable token identifying this run.
    pub run_id: String,
    /// Upstream snapshot identifier, captured once at run start.
    pub source_release: String,
    pub cancel: CancelToken,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        source_release: impl Into<String>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            source_release: source_release.into(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
