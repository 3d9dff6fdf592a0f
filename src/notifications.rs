//! Notifications - in-process fan-out plus optional OS toasts.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub level: NotifyLevel,
}

pub struct Notifier {
    enabled: bool,
    toast_enabled: bool,
    subscribers: Mutex<Vec<Sender<Notification>>>,
}

impl Notifier {
    pub fn new(enabled: bool, toast_enabled: bool) -> Self {
        Self {
            enabled,
            toast_enabled,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn notify(&self, title: &str, message: &str, level: NotifyLevel) {
        if !self.enabled {
            return;
        }

        let notification = Notification {
            title: title.to_string(),
            message: message.to_string(),
            level,
        };

        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(notification.clone()).is_ok());

        if self.toast_enabled {
            self.send_toast(&notification);
        } else {
            eprintln!("[Notify] {}: {}", title, message);
        }
    }

    fn send_toast(&self, notification: &Notification) {
        let shown = notify_rust::Notification::new()
            .appname("deskpilot")
            .summary(&notification.title)
            .body(&notification.message)
            .show();

        if shown.is_err() {
            // Toast backend unavailable; the log line is the fallback
            eprintln!(
                "[Notify] {}: {}",
                notification.title, notification.message
            );
        }
    }

    pub fn info(&self, title: &str, message: &str) {
        self.notify(title, message, NotifyLevel::Info);
    }

    pub fn success(&self, title: &str, message: &str) {
        self.notify(title, message, NotifyLevel::Success);
    }

    pub fn warning(&self, title: &str, message: &str) {
        self.notify(title, message, NotifyLevel::Warning);
    }

    pub fn error(&self, title: &str, message: &str) {
        self.notify(title, message, NotifyLevel::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_receive() {
        let notifier = Notifier::new(true, false);
        let rx = notifier.subscribe();

        notifier.success("تم", "أنشئ المجلد");

        let received = rx.try_recv().unwrap();
        assert_eq!(received.level, NotifyLevel::Success);
        assert_eq!(received.title, "تم");
    }

    #[test]
    fn test_disabled_notifier_is_silent() {
        let notifier = Notifier::new(false, false);
        let rx = notifier.subscribe();

        notifier.info("x", "y");
        assert!(rx.try_recv().is_err());
    }
}
