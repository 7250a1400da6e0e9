use caption_pool::{BatchEvent, CaptionEvent, DownloadEvent, JobEvent, ModelEvent};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use strum_macros::{AsRefStr, Display, EnumString};

pub const MAX_NOTIFICATIONS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    Info,
    Error,
    Success,
    Download,
}

#[derive(Clone, Debug)]
pub struct Notification {
    pub timestamp: DateTime<Local>,
    pub message: String,
    pub category: Category,
    pub read: bool,
}

/// Recent job notifications, newest first.
#[derive(Debug, Default)]
pub struct NotificationLog {
    entries: VecDeque<Notification>,
}

impl NotificationLog {
    pub fn push(&mut self, message: impl Into<String>, category: Category) {
        self.entries.push_front(Notification {
            timestamp: Local::now(),
            message: message.into(),
            category,
            read: false,
        });
        self.entries.truncate(MAX_NOTIFICATIONS);
    }

    /// Records a job event worth notifying about. Returns whether it was recorded.
    pub fn record(&mut self, event: &JobEvent) -> bool {
        let category = match event {
            JobEvent::Caption(CaptionEvent::Started { .. } | CaptionEvent::Token { .. })
            | JobEvent::Batch(BatchEvent::Progress { .. })
            | JobEvent::Download(DownloadEvent::Progress { .. }) => return false,
            event if event.is_error() => Category::Error,
            JobEvent::Download(_) => Category::Download,
            JobEvent::Model(ModelEvent::Loaded { .. })
            | JobEvent::Caption(CaptionEvent::Finished { .. })
            | JobEvent::Batch(BatchEvent::Completed { .. }) => Category::Success,
            _ => Category::Info,
        };

        match event.message() {
            Some(message) => {
                self.push(message, category);
                true
            }
            None => false,
        }
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|n| !n.read).count()
    }

    pub fn mark_all_read(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.read = true;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_newest_first_and_capped() {
        let mut log = NotificationLog::default();
        for i in 0..60 {
            log.push(format!("n{}", i), Category::Info);
        }
        assert_eq!(log.len(), MAX_NOTIFICATIONS);
        assert_eq!(log.iter().next().unwrap().message, "n59");
        assert_eq!(log.iter().last().unwrap().message, "n10");
    }

    #[test]
    fn test_unread_and_clear() {
        let mut log = NotificationLog::default();
        log.push("a", Category::Info);
        log.push("b", Category::Error);
        assert_eq!(log.unread_count(), 2);
        log.mark_all_read();
        assert_eq!(log.unread_count(), 0);
        log.push("c", Category::Success);
        assert_eq!(log.unread_count(), 1);
        log.clear();
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_record_categorizes_events() {
        let mut log = NotificationLog::default();
        assert!(!log.record(&JobEvent::Caption(CaptionEvent::Token {
            image: PathBuf::from("a.png"),
            text: "x".into(),
        })));
        assert!(log.record(&JobEvent::Batch(BatchEvent::Completed { completed: 2 })));
        assert!(log.record(&JobEvent::Download(DownloadEvent::Failed {
            filename: "m.gguf".into(),
            message: "unauthorized".into(),
            auth: true,
        })));
        assert!(log.record(&JobEvent::Download(DownloadEvent::Finished {
            path: PathBuf::from("models/m.gguf"),
        })));

        let categories: Vec<Category> = log.iter().map(|n| n.category).collect();
        assert_eq!(
            categories,
            vec![Category::Download, Category::Error, Category::Success]
        );
        assert_eq!(
            log.iter().last().unwrap().message,
            "Batch complete: 2 images captioned"
        );
        assert_eq!(Category::Download.to_string(), "download");
    }
}
