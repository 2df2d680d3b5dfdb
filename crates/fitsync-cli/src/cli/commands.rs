use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use fitsync_core::events::{CoreEvent, EventReceiver};
use fitsync_core::models::{Conversation, Identity, MessageStatus, NotificationKind, NotificationPhase, UserId};
use fitsync_core::notifications::NotificationView;
use fitsync_core::session::ConversationSession;
use fitsync_core::{MemoryBackend, RealtimeSocket, RestBackend, SyncConfig, SyncCore};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use super::config::CliConfig;
use super::render::{format_message, format_notification, grant_json, print_json};

/// Start the core against the configured hosted store.
pub async fn connect(config: &CliConfig) -> Result<SyncCore> {
    let rest = config.require_backend()?.clone();
    let identity = config.require_identity()?.clone();

    let backend = Arc::new(RestBackend::new(rest.clone()));
    let transport = Arc::new(RealtimeSocket::new(rest, config.sync.heartbeat()));
    SyncCore::start(identity, backend, transport, config.sync.clone())
        .await
        .context("Failed to start sync core")
}

/// Interactive chat: prints the history, then live changes, and sends every
/// line typed on stdin. `/read`, `/retry` and `/quit` are commands.
pub async fn run_chat(mut core: SyncCore, conversation_id: &str) -> Result<()> {
    let session = core
        .open_conversation(conversation_id)
        .await
        .with_context(|| format!("Failed to open conversation {}", conversation_id))?;
    for message in session.messages() {
        println!("{}", format_message(&message));
    }

    let events = core.take_event_rx().context("event stream already taken")?;
    let notifications = core.watch_notifications()?;
    let printer = tokio::spawn(print_live(session.clone(), events, notifications));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/read" => match core.mark_read(conversation_id).await {
                Ok(unread) => println!("-- marked read, {} unread overall", unread),
                Err(e) => eprintln!("-- mark read failed: {}", e),
            },
            "/retry" => {
                let failed: Vec<_> = session
                    .messages()
                    .into_iter()
                    .filter(|m| m.status == MessageStatus::Error)
                    .collect();
                for message in failed {
                    if let Err(e) = core.retry(conversation_id, &message.id).await {
                        eprintln!("-- retry failed: {}", e);
                    }
                }
            }
            body => {
                if let Err(e) = core.send(conversation_id, body).await {
                    eprintln!("-- send failed: {} (/retry to resend)", e);
                }
            }
        }
    }

    printer.abort();
    core.shutdown();
    Ok(())
}

async fn print_live(
    session: ConversationSession,
    mut events: EventReceiver,
    mut notifications: watch::Receiver<NotificationView>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(CoreEvent::RemoteMessage { message_id, .. }) => {
                    if let Some(message) = session.messages().into_iter().find(|m| m.id.as_str() == message_id) {
                        println!("{}", format_message(&message));
                    }
                }
                Some(CoreEvent::UnreadChanged(count)) => println!("-- {} unread", count),
                Some(_) => {}
                None => return,
            },
            changed = notifications.changed() => {
                if changed.is_err() {
                    return;
                }
                let view = notifications.borrow_and_update().clone();
                for kind in NotificationKind::ALL {
                    if let Some(n) = view.get(kind).filter(|n| n.phase == NotificationPhase::Appearing) {
                        println!("{}", format_notification(n));
                    }
                }
            }
        }
    }
}

/// Print the unread count, and keep printing changes when `follow` is set.
pub async fn run_unread(core: SyncCore, follow: bool, pretty: bool) -> Result<()> {
    print_json(&json!({ "unread": core.unread_count() }), pretty)?;
    if !follow {
        core.shutdown();
        return Ok(());
    }

    let mut rx = core.watch_unread()?;
    loop {
        tokio::select! {
            changed = rx.changed() => {
                changed.context("unread counter stopped")?;
                let count = *rx.borrow_and_update();
                print_json(&json!({ "unread": count }), pretty)?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    core.shutdown();
    Ok(())
}

/// Optionally ask the store to evaluate achievements, wait for the recheck,
/// and print whatever surfaced.
pub async fn run_achievements(core: SyncCore, evaluate: bool, pretty: bool, config: &SyncConfig) -> Result<()> {
    let watcher = core.achievements()?;
    if evaluate {
        if let Err(e) = watcher.trigger_evaluation().await {
            eprintln!("Evaluation failed: {}", e);
        }
        tokio::time::sleep(config.evaluation_recheck_delay() + Duration::from_millis(250)).await;
    } else {
        watcher.check_for_new().await?;
    }

    let surfaced = watcher.take_current().map(|g| grant_json(&g));
    print_json(&json!({ "surfaced": surfaced, "watermark": watcher.watermark().to_rfc3339() }), pretty)?;
    core.shutdown();
    Ok(())
}

/// Scripted walk-through against the in-process store: a client and a
/// trainer chat, read, and earn an achievement.
pub async fn run_demo(config: SyncConfig) -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let client = UserId::new("client-1");
    let trainer = UserId::new("trainer-1");
    backend.add_profile(&trainer, "Coach Ana");
    backend.add_profile(&client, "Bia");
    backend.add_conversation(Conversation::new("C123", trainer.clone(), client.clone()));
    backend.insert_message("C123", &trainer, &client, "Bem-vinda! Pronta para começar?");

    let identity = Identity::new(client.as_str()).with_display_name("Bia");
    let core = SyncCore::start(identity, backend.clone(), backend.clone(), config.clone()).await?;
    println!("== {} unread at start", core.unread_count());

    let session = core.open_conversation("C123").await?;
    for message in session.messages() {
        println!("{}", format_message(&message));
    }
    settle().await;

    let sent = core.send("C123", "Oi").await?;
    println!("{}", format_message(&sent));

    backend.fail_next_writes(1);
    if let Err(e) = core.send("C123", "Posso treinar hoje?").await {
        println!("== send failed ({}), retrying", e);
        let failed = core
            .messages("C123")
            .into_iter()
            .find(|m| m.status == MessageStatus::Error)
            .context("failed message vanished")?;
        let confirmed = core.retry("C123", &failed.id).await?;
        println!("{}", format_message(&confirmed));
    }

    backend.insert_message("C123", &trainer, &client, "Pode sim, 18h?");
    tokio::time::sleep(config.unread_debounce() + Duration::from_millis(50)).await;
    if let Some(n) = core.notification(NotificationKind::Message) {
        println!("{}", format_notification(&n));
    }
    println!("== {} unread", core.unread_count());

    println!("== {} unread after mark read", core.mark_read("C123").await?);

    backend.insert_grant(&client, "first-chat", Utc::now());
    tokio::time::sleep(config.push_recheck_delay() + Duration::from_millis(50)).await;
    if let Some(n) = core.notification(NotificationKind::Achievement) {
        println!("{}", format_notification(&n));
    }

    println!("== final conversation");
    for message in core.messages("C123") {
        println!("{}", format_message(&message));
    }
    core.shutdown();
    Ok(())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
