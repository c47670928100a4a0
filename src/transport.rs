use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serenity::builder::{CreateAttachment, CreateMessage};
use serenity::http::Http;
use serenity::model::id::ChannelId;
use thiserror::Error;
use tracing::{debug, warn};

/// Discord caps message content at 2000 chars; stay safely under it.
const TEXT_CHUNK_LIMIT: usize = 1990;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("attachment exceeds upload cap: {size} > {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("transport send failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub path: PathBuf,
    pub filename: String,
    pub caption: Option<String>,
    /// Ask the transport to present the file as a plain document rather
    /// than an inline preview, where it distinguishes the two.
    pub as_document: bool,
}

/// The two things the dialogue layer needs from a chat channel. Both may
/// fail transiently; retry policy lives with the caller, not here.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), DeliveryError>;
    async fn send_file(
        &self,
        conversation_id: &str,
        file: &OutboundFile,
    ) -> Result<(), DeliveryError>;
}

/// Retry a transient operation a bounded number of times with fixed backoff.
pub async fn with_retry<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, DeliveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeliveryError>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            // An oversized attachment never shrinks; retrying is pointless.
            Err(e @ DeliveryError::TooLarge { .. }) => return Err(e),
            Err(e) => {
                warn!(attempt, error = %e, "send attempt failed");
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| DeliveryError::Transport("no attempts made".into())))
}

pub struct DiscordTransport {
    http: Arc<Http>,
}

impl DiscordTransport {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    fn channel(conversation_id: &str) -> Result<ChannelId, DeliveryError> {
        conversation_id
            .parse::<u64>()
            .map(ChannelId::new)
            .map_err(|_| {
                DeliveryError::Transport(format!("bad conversation id: {conversation_id}"))
            })
    }
}

#[async_trait]
impl ChatTransport for DiscordTransport {
    /// Long texts go out in chunks split at a newline or space under the
    /// platform cap.
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), DeliveryError> {
        let channel = Self::channel(conversation_id)?;
        let mut remaining = text;
        while !remaining.is_empty() {
            let mut chunk_len = remaining.len().min(TEXT_CHUNK_LIMIT);
            while !remaining.is_char_boundary(chunk_len) {
                chunk_len -= 1;
            }
            let split_at = if chunk_len < remaining.len() {
                remaining[..chunk_len]
                    .rfind('\n')
                    .or_else(|| remaining[..chunk_len].rfind(' '))
                    .map(|i| i + 1)
                    .unwrap_or(chunk_len)
            } else {
                chunk_len
            };
            let chunk = &remaining[..split_at];
            remaining = &remaining[split_at..];

            channel
                .say(&self.http, chunk)
                .await
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    async fn send_file(
        &self,
        conversation_id: &str,
        file: &OutboundFile,
    ) -> Result<(), DeliveryError> {
        let channel = Self::channel(conversation_id)?;
        // Discord uploads are documents either way; as_document only
        // matters for transports that render previews differently.
        debug!(file = %file.filename, as_document = file.as_document, "uploading attachment");
        let data = tokio::fs::read(&file.path)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let attachment = CreateAttachment::bytes(data, file.filename.clone());
        let mut message = CreateMessage::new().add_file(attachment);
        if let Some(caption) = &file.caption {
            message = message.content(caption.clone());
        }
        channel
            .send_message(&self.http, message)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, Duration::ZERO, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DeliveryError::Transport("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(3, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DeliveryError::Transport("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_oversize_is_terminal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(3, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(DeliveryError::TooLarge {
                    size: 10,
                    limit: 1,
                })
            }
        })
        .await;
        assert!(matches!(result, Err(DeliveryError::TooLarge { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
