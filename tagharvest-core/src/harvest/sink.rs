use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::types::{PendingNotification, TagId};

/// Buffer between the protocol callback and the drain loop.
///
/// Holds at most one unread notification per tag; a newer push for the same
/// tag replaces the older one. Pushes may come from any thread the protocol
/// stack chooses, so the buffer uses a blocking lock that is never held
/// across an await point.
#[derive(Default)]
pub struct NotificationSink {
    buffer: Mutex<HashMap<TagId, PendingNotification>>,
}

impl fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSink")
            .field("buffered", &self.len())
            .finish()
    }
}

impl NotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notification: PendingNotification) {
        self.buffer
            .lock()
            .insert(notification.tag.clone(), notification);
    }

    /// Swap out everything buffered so far.
    pub fn drain(&self) -> Vec<PendingNotification> {
        let taken = std::mem::take(&mut *self.buffer.lock());
        taken.into_values().collect()
    }

    /// Discard buffered notifications, e.g. ones produced by a session that
    /// has since been torn down.
    pub fn clear(&self) -> usize {
        let mut guard = self.buffer.lock();
        let discarded = guard.len();
        guard.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::{DataValue, StatusCode};

    #[test]
    fn last_write_wins_per_tag() {
        let sink = NotificationSink::new();
        sink.push(PendingNotification::good("A".into(), 1_i64));
        sink.push(PendingNotification::good("B".into(), 2_i64));
        sink.push(PendingNotification::good("A".into(), 3_i64));

        let mut drained = sink.drain();
        drained.sort_by(|a, b| a.tag.cmp(&b.tag));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].value, DataValue::Int(3));
        assert_eq!(drained[1].value, DataValue::Int(2));
        assert!(sink.is_empty());
    }

    #[test]
    fn clear_discards_buffered_notifications() {
        let sink = NotificationSink::new();
        sink.push(PendingNotification::new(
            "A".into(),
            DataValue::Null,
            StatusCode::BAD_TIMEOUT,
            chrono::Utc::now(),
        ));
        assert_eq!(sink.clear(), 1);
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn concurrent_writers_keep_one_entry_per_tag() {
        let sink = Arc::new(NotificationSink::new());
        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..100_i64 {
                        let tag = TagId::new(format!("tag-{}", i % 10));
                        sink.push(PendingNotification::good(tag, writer * 1000 + i));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread panicked");
        }
        assert_eq!(sink.drain().len(), 10);
    }
}
