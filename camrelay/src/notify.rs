//! Notify sink
//!
//! Faults that change the availability of a subsystem are surfaced once as
//! a `(title, body)` pair. Sinks are fire-and-forget and must not panic.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receives user-facing notifications
pub trait Notifier: Send + Sync {
    /// Surface a notification
    fn notify(&self, title: &str, body: &str);
}

impl<F> Notifier for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn notify(&self, title: &str, body: &str) {
        self(title, body)
    }
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, body: &str) {
        warn!(title = %title, body = %body, "{}", title);
    }
}

/// A surfaced notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Short title
    pub title: String,
    /// Human-readable detail
    pub body: String,
}

/// Forwards notifications over an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiver its notifications arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, title: &str, body: &str) {
        let notification = Notification {
            title: title.to_string(),
            body: body.to_string(),
        };
        if self.sender.send(notification).is_err() {
            debug!("Notification receiver gone, dropped \"{}\"", title);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_channel_notifier_survives_closed_receiver() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify("Media Error", "Could not open webcam: busy");
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification {
                title: "Media Error".to_string(),
                body: "Could not open webcam: busy".to_string(),
            }
        );

        drop(rx);
        notifier.notify("Connection Error", "Connection error: reset");
    }

    #[test]
    fn test_closure_notifier() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notifier = move |title: &str, _body: &str| sink.lock().push(title.to_string());

        Notifier::notify(&notifier, "Media Security Error", "denied");
        assert_eq!(*seen.lock(), vec!["Media Security Error".to_string()]);
    }
}
