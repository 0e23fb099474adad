use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::delivery::Notifier;
use crate::registry::Recipient;

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub(crate) sent: Mutex<Vec<(Recipient, String)>>,
    pub(crate) fail_for: Option<Recipient>,
    pub(crate) delay: Option<Duration>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: Recipient, text: &str) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_for == Some(recipient) {
            anyhow::bail!("chat {recipient} blocked the bot");
        }
        self.sent.lock().await.push((recipient, text.to_string()));
        Ok(())
    }

    async fn send_with_image(
        &self,
        recipient: Recipient,
        text: &str,
        _image: &[u8],
        _caption: &str,
    ) -> Result<()> {
        self.send(recipient, text).await
    }
}
