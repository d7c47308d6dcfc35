//! Outgoing email delivery.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use worker_bridge_common::HostFunctionError;
use worker_bridge_core::{EmailMessage, MailTransport};

/// Transport that records messages in the log instead of delivering them.
///
/// Sent messages are also kept in memory so they can be inspected.
#[derive(Debug, Clone, Default)]
pub struct LogMailTransport {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
}

impl LogMailTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far.
    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn send(&self, message: EmailMessage) -> Result<(), HostFunctionError> {
        if message.from.is_empty() || message.to.is_empty() {
            return Err(HostFunctionError::invalid_argument(
                "email sender and recipient are required",
            ));
        }

        info!(
            from = %message.from,
            to = %message.to,
            raw_size = message.raw.len(),
            "Outgoing email"
        );
        self.sent.lock().await.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(to: &str) -> EmailMessage {
        EmailMessage {
            from: "worker@example.com".into(),
            to: to.into(),
            raw: "Subject: hi\r\n\r\nhello".into(),
        }
    }

    #[tokio::test]
    async fn test_send_records_message() {
        let transport = LogMailTransport::new();
        transport.send(message("ops@example.com")).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ops@example.com");
    }

    #[tokio::test]
    async fn test_send_requires_recipient() {
        let transport = LogMailTransport::new();
        let err = transport.send(message("")).await.unwrap_err();
        assert!(matches!(err, HostFunctionError::InvalidArgument { .. }));
        assert!(transport.sent().await.is_empty());
    }
}
