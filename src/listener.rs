use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Receiver of progress and diagnostics while an index is built.
///
/// Every non-fatal problem found in a dump ends up as a message here; the
/// build itself only fails for missing runtimes and cancellation.
pub trait ProgressListener {
    fn begin_task(&mut self, name: &str, total_work: usize);
    fn sub_task(&mut self, name: &str);
    fn worked(&mut self, work: usize);
    fn is_canceled(&self) -> bool;
    fn send_user_message(&mut self, severity: Severity, message: &str, cause: Option<&dyn Error>);
    fn done(&mut self);
}

/// Routes listener messages to the `log` facade.
pub struct LogListener {
    cancelled: Arc<AtomicBool>,
    task: String,
    total_work: usize,
    worked: usize,
}

impl LogListener {
    pub fn new() -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Shares `cancelled` with whoever may want to stop the build
    pub fn with_flag(cancelled: Arc<AtomicBool>) -> Self {
        LogListener {
            cancelled,
            task: String::new(),
            total_work: 0,
            worked: 0,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Default for LogListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressListener for LogListener {
    fn begin_task(&mut self, name: &str, total_work: usize) {
        info!("{}", name);
        self.task = name.to_string();
        self.total_work = total_work;
        self.worked = 0;
    }

    fn sub_task(&mut self, name: &str) {
        debug!("{}: {}", self.task, name);
    }

    fn worked(&mut self, work: usize) {
        self.worked = (self.worked + work).min(self.total_work);
    }

    fn is_canceled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn send_user_message(&mut self, severity: Severity, message: &str, cause: Option<&dyn Error>) {
        match (severity, cause) {
            (Severity::Info, None) => info!("{}", message),
            (Severity::Info, Some(e)) => info!("{}: {}", message, e),
            (Severity::Warning, None) => warn!("{}", message),
            (Severity::Warning, Some(e)) => warn!("{}: {}", message, e),
            (Severity::Error, None) => error!("{}", message),
            (Severity::Error, Some(e)) => error!("{}: {}", message, e),
        }
    }

    fn done(&mut self) {
        debug!("{} finished ({}/{})", self.task, self.worked, self.total_work);
    }
}

/// Kinds of repeatable diagnostics, each with its own budget.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum MessageKind {
    ObjectSize,
    ArrayElement,
    FieldReference,
    MissingReference,
    ExtraReference,
    AllReferencesMissing,
    ReferenceTarget,
    Superclass,
    Interface,
    ThreadWithoutObject,
    FrameRoots,
    MethodSection,
    FinalizableGuess,
    ClassForObject,
    MissingLoader,
}

/// Per-kind countdown of messages still allowed through.
pub struct RateLimiter {
    cap: i32,
    counters: HashMap<MessageKind, i32>,
}

impl RateLimiter {
    pub fn new(cap: i32) -> Self {
        RateLimiter {
            cap,
            counters: HashMap::new(),
        }
    }

    /// Whether another message of `kind` should be emitted. Every call is
    /// counted, so the ones refused show up in [`RateLimiter::suppressed`].
    pub fn allow(&mut self, kind: MessageKind) -> bool {
        let counter = self.counters.entry(kind).or_insert(self.cap);
        let allowed = *counter > 0;
        *counter -= 1;
        allowed
    }

    pub fn suppressed(&self) -> usize {
        self.counters.values().map(|c| (-*c).max(0) as usize).sum()
    }
}

/// Keeps every message; lets tests inspect what a build reported.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub(crate) messages: Vec<(Severity, String)>,
    pub(crate) cancel_after_polls: Option<usize>,
    pub(crate) polls: std::cell::Cell<usize>,
}

#[cfg(test)]
impl RecordingListener {
    pub(crate) fn count(&self, severity: Severity, needle: &str) -> usize {
        self.messages
            .iter()
            .filter(|(s, m)| *s == severity && m.contains(needle))
            .count()
    }

    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.messages.iter().any(|(_, m)| m.contains(needle))
    }
}

#[cfg(test)]
impl ProgressListener for RecordingListener {
    fn begin_task(&mut self, _name: &str, _total_work: usize) {}

    fn sub_task(&mut self, _name: &str) {}

    fn worked(&mut self, _work: usize) {}

    fn is_canceled(&self) -> bool {
        let polls = self.polls.get() + 1;
        self.polls.set(polls);
        matches!(self.cancel_after_polls, Some(n) if polls > n)
    }

    fn send_user_message(&mut self, severity: Severity, message: &str, _cause: Option<&dyn Error>) {
        self.messages.push((severity, message.to_string()));
    }

    fn done(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter() {
        let mut limiter = RateLimiter::new(20);
        let allowed = (0..25)
            .filter(|_| limiter.allow(MessageKind::ArrayElement))
            .count();
        assert_eq!(allowed, 20);
        assert_eq!(limiter.suppressed(), 5);
        // other kinds have their own budget
        assert!(limiter.allow(MessageKind::Superclass));
        assert_eq!(limiter.suppressed(), 5);
    }

    #[test]
    fn test_log_listener_cancel() {
        let flag = Arc::new(AtomicBool::new(false));
        let listener = LogListener::with_flag(flag.clone());
        assert!(!listener.is_canceled());
        flag.store(true, Ordering::Relaxed);
        assert!(listener.is_canceled());
    }
}
