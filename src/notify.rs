use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind {
    Approved,
    Rejected,
    Cancelled,
    Promoted,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Approved => "approved",
            NoticeKind::Rejected => "rejected",
            NoticeKind::Cancelled => "cancelled",
            NoticeKind::Promoted => "promoted",
        }
    }
}

/// One message to one requester about one request or booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub recipient: String,
    pub entity_label: String,
}

impl Notice {
    pub fn subject(&self) -> String {
        match self.kind {
            NoticeKind::Approved => format!("Your request for {} has been approved", self.entity_label),
            NoticeKind::Rejected => format!("Your request for {} has been rejected", self.entity_label),
            NoticeKind::Cancelled => format!("Your request for {} has been cancelled", self.entity_label),
            NoticeKind::Promoted => {
                format!("Your request for {} was promoted from the waitlist", self.entity_label)
            }
        }
    }
}

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Delivery side effect of a state transition. Implementations must not
/// block; the engine logs and swallows any error they return.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Broadcast hub keyed by recipient email. Mail relays (or tests)
/// subscribe per recipient.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: &str) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(recipient.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, notice: &Notice) {
        tracing::debug!(
            recipient = %notice.recipient,
            kind = notice.kind.as_str(),
            "notice: {}",
            notice.subject()
        );
        if let Some(sender) = self.channels.get(&notice.recipient) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Remove a recipient's channel (e.g. when the relay disconnects).
    pub fn remove(&self, recipient: &str) {
        self.channels.remove(recipient);
    }
}

impl Notifier for NotifyHub {
    fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        self.send(notice);
        Ok(())
    }
}

/// Writes every notice to the tracing log. The default when no mail relay
/// is attached.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %notice.recipient,
            kind = notice.kind.as_str(),
            "{}",
            notice.subject()
        );
        Ok(())
    }
}

/// Fans a notice out to several notifiers. Every sink is tried; the first
/// error is returned.
pub struct Fanout(pub Vec<std::sync::Arc<dyn Notifier>>);

impl Notifier for Fanout {
    fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        let mut first_err = None;
        for sink in &self.0 {
            if let Err(e) = sink.notify(notice) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(kind: NoticeKind) -> Notice {
        Notice {
            kind,
            recipient: "prof@college.edu".into(),
            entity_label: "LHC-101 (Room Booking)".into(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("prof@college.edu");

        let sent = notice(NoticeKind::Promoted);
        hub.notify(&sent).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn other_recipients_do_not_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("student@college.edu");
        hub.send(&notice(NoticeKind::Approved));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber — should not panic
        hub.send(&notice(NoticeKind::Rejected));
    }

    #[tokio::test]
    async fn removed_channel_closes_receivers() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("prof@college.edu");
        hub.remove("prof@college.edu");
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    struct Broken;

    impl Notifier for Broken {
        fn notify(&self, _: &Notice) -> Result<(), NotifyError> {
            Err(NotifyError("down".into()))
        }
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink_despite_errors() {
        let hub = std::sync::Arc::new(NotifyHub::new());
        let mut rx = hub.subscribe("prof@college.edu");
        let fanout = Fanout(vec![std::sync::Arc::new(Broken), hub.clone(), std::sync::Arc::new(LogNotifier)]);

        let sent = notice(NoticeKind::Approved);
        assert!(fanout.notify(&sent).is_err());
        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[test]
    fn subjects_name_the_entity() {
        let n = notice(NoticeKind::Cancelled);
        assert!(n.subject().contains("LHC-101"));
        assert!(n.subject().contains("cancelled"));
    }
}
