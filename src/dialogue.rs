use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::scrape::label::normalize;
use crate::scrape::{ContentResolver, ResolvedLink, SearchCandidate};
use crate::session::{ConversationSession, SessionStore, Stage};
use crate::tools::{is_media_url, ExternalTools};
use crate::transfer::TransferPipeline;
use crate::transport::{with_retry, ChatTransport, OutboundFile};

const SEND_ATTEMPTS: u32 = 3;
const SEND_BACKOFF: Duration = Duration::from_secs(2);
/// A title menu never shows more than this many hits.
const MENU_LIMIT: usize = 10;

const STICKER_COMMAND: &str = "!sticker";
const REMOVE_BG_COMMAND: &str = "!removebg";

const HELP_TEXT: &str = "Hi! Here's what I can do:\n\
- `!movie <title>` — search for a movie or show, then reply with numbers to pick one\n\
- send a YouTube / Instagram / TikTok / X link — I'll fetch it for you\n\
- send an image or clip with `!sticker` — I'll turn it into a sticker\n\
- send an image with `!removebg` — I'll strip the background";

const DELIVERY_MENU: &str = "How should I deliver it?\n1. Direct link\n2. Upload the file here";
const INVALID_SELECTION: &str = "Invalid selection — pick a number from the list.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Video,
    Other,
}

#[derive(Debug, Clone)]
pub struct InboundAttachment {
    pub bytes: Vec<u8>,
    pub kind: AttachmentKind,
    pub filename: String,
}

/// One inbound chat event, already detached from the transport's types.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub conversation_id: String,
    pub text: String,
    pub attachment: Option<InboundAttachment>,
}

/// The orchestrator: consumes inbound events, drives the per-conversation
/// flow, and calls out to the resolver, transfer pipeline and external
/// tools. One conversation's events are serialized by its session slot
/// lock; different conversations proceed concurrently.
pub struct DialogueController {
    config: Arc<Config>,
    resolver: Arc<dyn ContentResolver>,
    sessions: Arc<SessionStore>,
    transfer: Arc<TransferPipeline>,
    tools: Arc<ExternalTools>,
}

impl DialogueController {
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<dyn ContentResolver>,
        sessions: Arc<SessionStore>,
        transfer: Arc<TransferPipeline>,
        tools: Arc<ExternalTools>,
    ) -> Self {
        Self {
            config,
            resolver,
            sessions,
            transfer,
            tools,
        }
    }

    pub async fn handle(&self, transport: Arc<dyn ChatTransport>, event: InboundEvent) {
        let conversation = event.conversation_id.clone();
        if let Err(e) = self.dispatch(&transport, &event).await {
            warn!(conversation = %conversation, error = %e, "inbound event failed");
            let _ = self
                .say(&transport, &conversation, "Something went wrong on my end — try again.")
                .await;
        }
    }

    async fn dispatch(
        &self,
        transport: &Arc<dyn ChatTransport>,
        event: &InboundEvent,
    ) -> Result<()> {
        let text = event.text.trim();

        // Media transforms bypass the session machine entirely.
        if let Some(attachment) = &event.attachment {
            if has_command(text, STICKER_COMMAND) {
                return self
                    .handle_sticker(transport, &event.conversation_id, attachment)
                    .await;
            }
            if has_command(text, REMOVE_BG_COMMAND) {
                return self
                    .handle_background_removal(transport, &event.conversation_id, attachment)
                    .await;
            }
        }

        if let Some(query) = strip_command(text, &self.config.command_prefix) {
            return self
                .handle_search(transport, &event.conversation_id, query)
                .await;
        }

        if let Some(n) = parse_selection(text) {
            let slot = self.sessions.slot(&event.conversation_id).await;
            let mut guard = slot.lock().await;
            // A stale session is as good as no session at all.
            if guard
                .as_ref()
                .is_some_and(|s| s.is_expired(self.sessions.ttl()))
            {
                *guard = None;
            }
            if guard.is_some() {
                return self
                    .handle_selection(transport, &event.conversation_id, guard, n)
                    .await;
            }
            // A bare number with no flow in progress means nothing; fall
            // through to the help text.
        }

        if is_media_url(text) {
            return self
                .handle_media_link(transport, &event.conversation_id, text)
                .await;
        }
        if event.attachment.is_some() {
            debug!(conversation = %event.conversation_id, "attachment without a recognized intent; ignoring");
            return Ok(());
        }
        self.say(transport, &event.conversation_id, HELP_TEXT).await
    }

    async fn handle_search(
        &self,
        transport: &Arc<dyn ChatTransport>,
        conversation: &str,
        query: &str,
    ) -> Result<()> {
        if query.is_empty() {
            return self
                .say(
                    transport,
                    conversation,
                    &format!(
                        "Give me a title to search for, e.g. `{} inception`.",
                        self.config.command_prefix
                    ),
                )
                .await;
        }

        info!(conversation, query, "search requested");
        let mut candidates = self.resolver.search(query).await;
        if candidates.is_empty() {
            return self
                .say(transport, conversation, &format!("No results for \"{query}\"."))
                .await;
        }
        candidates.truncate(MENU_LIMIT);
        let menu = title_menu(query, &candidates);

        // A fresh search replaces whatever flow was in progress.
        let slot = self.sessions.slot(conversation).await;
        *slot.lock().await = Some(ConversationSession::new(candidates));

        self.say(transport, conversation, &menu).await
    }

    async fn handle_selection(
        &self,
        transport: &Arc<dyn ChatTransport>,
        conversation: &str,
        mut guard: MutexGuard<'_, Option<ConversationSession>>,
        n: usize,
    ) -> Result<()> {
        let Some(session) = guard.as_mut() else {
            return Ok(());
        };

        match session.stage {
            Stage::AwaitingTitleSelection => {
                let Some(candidate) = checked_pick(&session.candidates, n).cloned() else {
                    return self.say(transport, conversation, INVALID_SELECTION).await;
                };
                info!(conversation, title = %candidate.title, "title selected");
                let links = self.resolver.resolve_links(&candidate.detail_uri).await;
                if links.is_empty() {
                    // Leave the session where it is; the user can pick a
                    // different title.
                    return self
                        .say(
                            transport,
                            conversation,
                            &format!("No links found for {}. Try another number.", candidate.title),
                        )
                        .await;
                }
                let menu = link_menu(&candidate.title, &links);
                session.selected_candidate = Some(candidate);
                session.resolved_links = links;
                session.stage = Stage::AwaitingLinkSelection;
                session.touch();
                self.say(transport, conversation, &menu).await
            }
            Stage::AwaitingLinkSelection => {
                let Some(link) = checked_pick(&session.resolved_links, n).cloned() else {
                    return self.say(transport, conversation, INVALID_SELECTION).await;
                };
                info!(conversation, link = %link.uri, "link selected");
                session.selected_link = Some(link);
                session.stage = Stage::AwaitingDeliveryChoice;
                session.touch();
                self.say(transport, conversation, DELIVERY_MENU).await
            }
            Stage::AwaitingDeliveryChoice => {
                let Some(link) = session.selected_link.clone() else {
                    warn!(conversation, "delivery stage reached without a selected link");
                    *guard = None;
                    return Ok(());
                };
                let caption = session
                    .selected_candidate
                    .as_ref()
                    .map(|c| c.title.clone())
                    .unwrap_or_else(|| link.label.clone());
                match n {
                    1 => {
                        // Terminal: hand over the raw URI and end the flow.
                        *guard = None;
                        drop(guard);
                        self.say(transport, conversation, &link.uri).await
                    }
                    2 => {
                        // Terminal: the session dies before the transfer
                        // starts, so a duplicate "2" cannot trigger a
                        // second download.
                        *guard = None;
                        drop(guard);
                        self.deliver_transfer(transport, conversation, link, caption).await
                    }
                    _ => self.say(transport, conversation, "Reply 1 or 2.").await,
                }
            }
        }
    }

    async fn deliver_transfer(
        &self,
        transport: &Arc<dyn ChatTransport>,
        conversation: &str,
        link: ResolvedLink,
        caption: String,
    ) -> Result<()> {
        self.say(
            transport,
            conversation,
            &format!("Downloading {} — hang tight.", link.label),
        )
        .await?;

        // Fire-and-forget progress: a slow outbound send must not stall
        // the byte stream.
        let progress_transport = transport.clone();
        let progress_conversation = conversation.to_string();
        let on_progress = move |percent: u8| {
            let transport = progress_transport.clone();
            let conversation = progress_conversation.clone();
            tokio::spawn(async move {
                let _ = transport
                    .send_text(&conversation, &format!("{percent}% downloaded..."))
                    .await;
            });
        };

        let staged = match self.transfer.download(&link.uri, &link.label, &on_progress).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(conversation, uri = %link.uri, error = %e, "transfer failed");
                return self
                    .say(
                        transport,
                        conversation,
                        &format!("Download failed: {e}. Here is the direct link instead:\n{}", link.uri),
                    )
                    .await;
            }
        };

        info!(
            conversation,
            bytes = staged.bytes_total,
            file = %staged.filename,
            "forwarding staged file"
        );
        let result = self
            .deliver_file(
                transport,
                conversation,
                &staged.path,
                &staged.filename,
                Some(caption),
                Some(&link.uri),
            )
            .await;
        // The staged artifact never outlives the delivery attempt.
        remove_staged(&staged.path).await;
        result
    }

    /// Size-aware delivery with retry, then document-mode fallback, then a
    /// link (or failure report) before giving up.
    async fn deliver_file(
        &self,
        transport: &Arc<dyn ChatTransport>,
        conversation: &str,
        path: &Path,
        filename: &str,
        caption: Option<String>,
        fallback_uri: Option<&str>,
    ) -> Result<()> {
        let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        if size > self.config.max_upload_bytes {
            info!(
                conversation,
                size,
                limit = self.config.max_upload_bytes,
                "file exceeds upload cap; falling back to link"
            );
            let message = match fallback_uri {
                Some(uri) => format!(
                    "{filename} is too large to upload here ({} MB). Direct link:\n{uri}",
                    size / (1024 * 1024)
                ),
                None => format!("{filename} is too large to upload here."),
            };
            return self.say(transport, conversation, &message).await;
        }

        let file = OutboundFile {
            path: path.to_path_buf(),
            filename: filename.to_string(),
            caption,
            as_document: false,
        };
        if with_retry(SEND_ATTEMPTS, SEND_BACKOFF, || {
            transport.send_file(conversation, &file)
        })
        .await
        .is_ok()
        {
            return Ok(());
        }

        let document = OutboundFile {
            as_document: true,
            ..file
        };
        match with_retry(SEND_ATTEMPTS, SEND_BACKOFF, || {
            transport.send_file(conversation, &document)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(conversation, error = %e, "attachment delivery failed after retries");
                let message = match fallback_uri {
                    Some(uri) => format!("Upload failed. Direct link:\n{uri}"),
                    None => format!("Upload failed: {e}"),
                };
                self.say(transport, conversation, &message).await
            }
        }
    }

    async fn handle_media_link(
        &self,
        transport: &Arc<dyn ChatTransport>,
        conversation: &str,
        url: &str,
    ) -> Result<()> {
        self.say(transport, conversation, "Fetching that for you...")
            .await?;
        let media = match self.tools.fetch_media(url, false).await {
            Ok(media) => media,
            Err(e) => {
                warn!(conversation, url, error = %e, "media fetch failed");
                return self
                    .say(transport, conversation, &format!("Couldn't fetch that: {e}"))
                    .await;
            }
        };
        let filename = media
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media.mp4".to_string());
        let result = self
            .deliver_file(
                transport,
                conversation,
                &media.path,
                &filename,
                Some(media.title.clone()),
                None,
            )
            .await;
        remove_staged(&media.path).await;
        result
    }

    async fn handle_sticker(
        &self,
        transport: &Arc<dyn ChatTransport>,
        conversation: &str,
        attachment: &InboundAttachment,
    ) -> Result<()> {
        let animated = attachment.kind == AttachmentKind::Video
            || attachment.filename.to_ascii_lowercase().ends_with(".gif");
        let webp = match self.tools.make_sticker(&attachment.bytes, animated).await {
            Ok(webp) => webp,
            Err(e) => {
                warn!(conversation, error = %e, "sticker transcode failed");
                return self
                    .say(transport, conversation, "Couldn't turn that into a sticker.")
                    .await;
            }
        };
        let path = self.config.staging_dir.join(format!(
            "{}-sticker.webp",
            chrono::Utc::now().timestamp_millis()
        ));
        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        tokio::fs::write(&path, &webp).await?;
        let result = self
            .deliver_file(transport, conversation, &path, "sticker.webp", None, None)
            .await;
        remove_staged(&path).await;
        result
    }

    async fn handle_background_removal(
        &self,
        transport: &Arc<dyn ChatTransport>,
        conversation: &str,
        attachment: &InboundAttachment,
    ) -> Result<()> {
        if attachment.kind != AttachmentKind::Image {
            return self
                .say(transport, conversation, "Background removal needs an image.")
                .await;
        }
        let in_path = self.config.staging_dir.join(format!(
            "{}-bg-in-{}",
            chrono::Utc::now().timestamp_millis(),
            attachment.filename
        ));
        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        tokio::fs::write(&in_path, &attachment.bytes).await?;

        let result = match self.tools.remove_background(&in_path).await {
            Ok(out_path) => {
                let delivered = self
                    .deliver_file(transport, conversation, &out_path, "no-background.png", None, None)
                    .await;
                remove_staged(&out_path).await;
                delivered
            }
            Err(e) => {
                warn!(conversation, error = %e, "background removal failed");
                self.say(transport, conversation, "Couldn't remove the background from that.")
                    .await
            }
        };
        remove_staged(&in_path).await;
        result
    }

    async fn say(
        &self,
        transport: &Arc<dyn ChatTransport>,
        conversation: &str,
        text: &str,
    ) -> Result<()> {
        with_retry(SEND_ATTEMPTS, SEND_BACKOFF, || {
            transport.send_text(conversation, text)
        })
        .await?;
        Ok(())
    }
}

/// A bare non-negative integer reply. Bounds are checked per stage so that
/// out-of-range picks (including 0) get an invalid-selection reply.
fn parse_selection(text: &str) -> Option<usize> {
    text.parse::<usize>().ok()
}

/// 1-based pick with bounds checking.
fn checked_pick<T>(items: &[T], n: usize) -> Option<&T> {
    if n < 1 {
        return None;
    }
    items.get(n - 1)
}

fn has_command(text: &str, command: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower == command || lower.starts_with(&format!("{command} "))
}

/// The query following the search prefix, or None if the text is not a
/// search at all.
fn strip_command<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(text[prefix.len()..].trim())
    } else {
        None
    }
}

fn title_menu(query: &str, candidates: &[SearchCandidate]) -> String {
    let mut out = format!("Results for \"{query}\":\n");
    for (i, candidate) in candidates.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, candidate.title));
    }
    out.push_str("\nReply with a number to pick a title.");
    out
}

fn link_menu(title: &str, links: &[ResolvedLink]) -> String {
    let mut out = format!("Links for {title}:\n");
    for (i, link) in links.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, normalize(&link.label, i, title)));
    }
    out.push_str("\nReply with a number to pick one.");
    out
}

async fn remove_staged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove staged file");
        }
    }
}
