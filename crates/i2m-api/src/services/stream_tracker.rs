//! Per-session cap on concurrent SSE streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Counts open streams per session.
///
/// Slots are held by a [`StreamSlot`] and returned when it is dropped, so a
/// client disconnect frees the slot without any explicit release call.
#[derive(Debug, Clone)]
pub struct StreamTracker {
    streams: Arc<Mutex<HashMap<String, usize>>>,
    max_per_session: usize,
}

impl StreamTracker {
    pub fn new(max_per_session: usize) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            max_per_session,
        }
    }

    /// Try to take a stream slot for a session.
    /// Returns `None` once the session has `max_per_session` open streams.
    pub fn try_acquire(&self, session_key: &str) -> Option<StreamSlot> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let count = streams.entry(session_key.to_string()).or_insert(0);
        if *count >= self.max_per_session {
            return None;
        }
        *count += 1;

        Some(StreamSlot {
            tracker: self.clone(),
            session_key: session_key.to_string(),
        })
    }

    fn release(&self, session_key: &str) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = streams.get_mut(session_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                streams.remove(session_key);
            }
        }
    }

    /// Open streams for a session.
    pub fn active(&self, session_key: &str) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_key)
            .copied()
            .unwrap_or(0)
    }

    /// Open streams across all sessions.
    pub fn total(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .sum()
    }
}

/// An acquired stream slot.
#[derive(Debug)]
pub struct StreamSlot {
    tracker: StreamTracker,
    session_key: String,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.tracker.release(&self.session_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_and_release_on_drop() {
        let tracker = StreamTracker::new(2);

        let a = tracker.try_acquire("s1").unwrap();
        let b = tracker.try_acquire("s1").unwrap();
        assert!(tracker.try_acquire("s1").is_none());
        assert_eq!(tracker.active("s1"), 2);

        // Other sessions are unaffected
        let c = tracker.try_acquire("s2").unwrap();
        assert_eq!(tracker.total(), 3);

        drop(a);
        assert_eq!(tracker.active("s1"), 1);
        let _d = tracker.try_acquire("s1").unwrap();

        drop(b);
        drop(c);
        assert_eq!(tracker.active("s2"), 0);
        assert_eq!(tracker.total(), 1);
    }
}
