mod config;
mod dialogue;
mod scrape;
mod session;
mod tools;
mod transfer;
mod transport;

use std::sync::Arc;

use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::prelude::*;
use tracing::{debug, error, info, warn, Level};

use config::Config;
use dialogue::{AttachmentKind, DialogueController, InboundAttachment, InboundEvent};
use scrape::SiteClient;
use session::SessionStore;
use tools::ExternalTools;
use transfer::TransferPipeline;
use transport::DiscordTransport;

/// Inbound attachments beyond this stay on the CDN instead of being pulled
/// into memory.
const MAX_INBOUND_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

struct Handler {
    controller: Arc<DialogueController>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Bot connected as: {} ({})", ready.user.name, ready.user.id);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let attachment = match msg.attachments.first() {
            Some(a) if u64::from(a.size) <= MAX_INBOUND_ATTACHMENT_BYTES => {
                match a.download().await {
                    Ok(bytes) => Some(InboundAttachment {
                        bytes,
                        kind: attachment_kind(a.content_type.as_deref()),
                        filename: a.filename.clone(),
                    }),
                    Err(e) => {
                        warn!(error = %e, "failed to download inbound attachment");
                        None
                    }
                }
            }
            Some(a) => {
                debug!(size = a.size, "inbound attachment too large; ignoring");
                None
            }
            None => None,
        };

        let event = InboundEvent {
            conversation_id: msg.channel_id.to_string(),
            text: msg.content.clone(),
            attachment,
        };
        let transport = Arc::new(DiscordTransport::new(ctx.http.clone()));
        self.controller.handle(transport, event).await;
    }
}

fn attachment_kind(content_type: Option<&str>) -> AttachmentKind {
    match content_type {
        Some(ct) if ct.starts_with("image/") => AttachmentKind::Image,
        Some(ct) if ct.starts_with("video/") => AttachmentKind::Video,
        _ => AttachmentKind::Other,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    // Load env
    let _ = dotenv::dotenv();
    let config = Arc::new(Config::from_env()?);
    std::fs::create_dir_all(&config.staging_dir)?;

    let site = Arc::new(SiteClient::new(&config)?);
    let sessions = Arc::new(SessionStore::new(config.session_ttl));
    let transfer = Arc::new(TransferPipeline::new(
        config.staging_dir.clone(),
        config.http_timeout,
    )?);
    let tools = Arc::new(ExternalTools::new(config.staging_dir.clone()));
    let controller = Arc::new(DialogueController::new(
        config.clone(),
        site,
        sessions.clone(),
        transfer,
        tools,
    ));
    info!(site = %config.site_base_url, staging = %config.staging_dir.display(), "subsystems initialized");

    // The lazy expiry checks only fire when a conversation speaks again;
    // the sweep catches the ones that never do.
    let sweep_sessions = sessions.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweep_sessions.sweep_expired().await;
        }
    });

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    info!("Starting reelbot...");
    let mut client = serenity::Client::builder(&config.discord_token, intents)
        .event_handler(Handler { controller })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    if let Err(e) = client.start().await {
        error!("Client error: {}", e);
    }

    Ok(())
}
