//! Host-side state shared with a running guest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::capability::{CapabilityError, Dispatcher};

const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// State one execution shares between the caller and the guest's worker.
///
/// Stdout is written as the guest runs, so a caller that gives up at the
/// deadline still sees everything printed so far. Once cancelled, every
/// further dispatch is refused before it reaches the dispatcher.
pub struct GuestContext {
    dispatcher: Arc<dyn Dispatcher>,
    cancelled: AtomicBool,
    stdout: Mutex<String>,
    max_stdout_bytes: usize,
    truncated: AtomicBool,
    last_error: Mutex<Option<CapabilityError>>,
}

impl GuestContext {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, max_stdout_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            cancelled: AtomicBool::new(false),
            stdout: Mutex::new(String::new()),
            max_stdout_bytes,
            truncated: AtomicBool::new(false),
            last_error: Mutex::new(None),
        })
    }

    pub fn dispatch(&self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        if self.is_cancelled() {
            return Err(CapabilityError::Cancelled { name: name.to_string() });
        }
        let result = self.dispatcher.dispatch(name, args);
        *self.last_error.lock() = result.as_ref().err().cloned();
        result
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Append guest output, dropping anything past the configured ceiling.
    pub fn write_stdout(&self, text: &str) {
        if self.truncated.load(Ordering::Relaxed) {
            return;
        }
        let mut stdout = self.stdout.lock();
        let remaining = self.max_stdout_bytes.saturating_sub(stdout.len());
        if text.len() <= remaining {
            stdout.push_str(text);
            return;
        }
        let mut cut = remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        stdout.push_str(&text[..cut]);
        stdout.push_str(TRUNCATION_MARKER);
        self.truncated.store(true, Ordering::Relaxed);
    }

    pub fn println(&self, line: &str) {
        self.write_stdout(line);
        self.write_stdout("\n");
    }

    pub fn stdout(&self) -> String {
        self.stdout.lock().clone()
    }

    pub fn stdout_truncated(&self) -> bool {
        self.truncated.load(Ordering::Relaxed)
    }

    /// The error returned by the most recent dispatch, if it failed.
    pub fn last_error(&self) -> Option<CapabilityError> {
        self.last_error.lock().clone()
    }
}
