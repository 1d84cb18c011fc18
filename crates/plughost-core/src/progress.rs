use std::sync::Mutex;

/// Progress of one background task, owned by the task and read by anyone
/// holding a shared reference.
#[derive(Debug, Default)]
pub struct TaskProgress {
    inner: Mutex<ProgressSnapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub done: usize,
    pub errors: Vec<String>,
    pub finished: bool,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return if self.finished { 100 } else { 0 };
        }
        ((self.done.min(self.total) * 100) / self.total) as u8
    }

    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}

impl TaskProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, total: usize) {
        let mut inner = self.lock();
        *inner = ProgressSnapshot {
            total,
            ..ProgressSnapshot::default()
        };
    }

    pub fn advance(&self) {
        let mut inner = self.lock();
        inner.done = inner.done.saturating_add(1);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.lock().errors.push(message.into());
    }

    pub fn finish(&self) {
        let mut inner = self.lock();
        inner.done = inner.total;
        inner.finished = true;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_steps_and_errors() {
        let progress = TaskProgress::new();
        progress.begin(4);
        progress.advance();
        progress.record_error("com.example.a: boom");
        progress.advance();

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.percent(), 50);
        assert_eq!(snapshot.last_error(), Some("com.example.a: boom"));
        assert!(!snapshot.finished);

        progress.finish();
        assert_eq!(progress.snapshot().percent(), 100);
        assert!(progress.is_finished());
    }

    #[test]
    fn empty_task_reports_zero_until_finished() {
        let progress = TaskProgress::new();
        progress.begin(0);
        assert_eq!(progress.snapshot().percent(), 0);
        progress.finish();
        assert_eq!(progress.snapshot().percent(), 100);
    }

    #[test]
    fn begin_resets_previous_run() {
        let progress = TaskProgress::new();
        progress.begin(1);
        progress.record_error("x");
        progress.finish();

        progress.begin(2);
        let snapshot = progress.snapshot();
        assert!(snapshot.errors.is_empty());
        assert_eq!(snapshot.done, 0);
        assert!(!snapshot.finished);
    }
}
