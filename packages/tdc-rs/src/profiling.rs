use std::time::{Duration, Instant};

/// Logs the wall time of a pipeline stage when dropped.
///
/// With a deadline, overruns are reported at `warn` level; the online
/// peeler uses this to flag chunks processed slower than real time.
pub struct ProfileScope {
    label: String,
    start: Instant,
    deadline: Option<Duration>,
}

impl ProfileScope {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
            deadline: None,
        }
    }

    pub fn with_deadline(label: impl Into<String>, deadline: Duration) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
            deadline: Some(deadline),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Whether the deadline, if any, has already passed
    pub fn overran(&self) -> bool {
        self.deadline.map_or(false, |d| self.elapsed() > d)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed = self.elapsed();
        let ms = elapsed.as_secs_f64() * 1000.0;

        match self.deadline {
            Some(deadline) if elapsed > deadline => log::warn!(
                "[PROFILE] {} - {:.3}ms exceeds deadline of {:.3}ms",
                self.label,
                ms,
                deadline.as_secs_f64() * 1000.0
            ),
            _ => log::debug!("[PROFILE] {} - {:.3}ms", self.label, ms),
        }
    }
}

/// Time the rest of the enclosing scope
#[macro_export]
macro_rules! profile_scope {
    ($label:expr) => {
        let _profile_scope = $crate::profiling::ProfileScope::new($label);
    };
}
