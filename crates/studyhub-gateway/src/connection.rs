use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;

use studyhub_db::Database;
use studyhub_types::api::Claims;
use studyhub_types::events::{ChannelKey, FanoutEvent, GatewayCommand};
use studyhub_types::models::UserProfile;

use crate::dispatcher::{Dispatcher, Subscriptions, encode};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one pre-authenticated WebSocket connection. The token was checked
/// at the HTTP upgrade, so the loop starts with `ready`.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, db: Arc<Database>, claims: Claims) {
    let user_id = claims.sub;
    let username = claims.username.clone();
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);
    sync_profile(&db, &claims).await;

    let ready = match encode(FanoutEvent::Ready {
        user_id,
        username: username.clone(),
    }) {
        Ok(json) => json,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };
    if sender.send(Message::Text(ready.into())).await.is_err() {
        return;
    }

    let mut handle = dispatcher.register_connection(user_id);
    let conn_id = handle.conn_id;
    let subscriptions = handle.subscriptions.clone();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward subscribed events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = handle.recv() => {
                    let text = match result {
                        Ok(msg) => msg.json.to_string(),
                        Err(RecvError::Lagged(n)) => {
                            warn!("Connection {} lagged by {} events, asking for resync", handle.conn_id, n);
                            match encode(FanoutEvent::Resync { reason: format!("missed {} events", n) }) {
                                Ok(json) => json,
                                Err(e) => {
                                    error!("{}", e);
                                    continue;
                                }
                            }
                        }
                        Err(RecvError::Closed) => break,
                    };

                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, &db, user_id, &username_recv, &subscriptions, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_connection(conn_id);
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: Uuid,
    username: &str,
    subscriptions: &Subscriptions,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Subscribe { conversation_ids } => {
            let requested = conversation_ids.len();
            let db = db.clone();
            let allowed = tokio::task::spawn_blocking(move || {
                db.participant_conversations(user_id, &conversation_ids)
            })
            .await;

            let allowed = match allowed {
                Ok(Ok(ids)) => ids,
                Ok(Err(e)) => {
                    error!("Subscription check failed for {}: {}", user_id, e);
                    return;
                }
                Err(e) => {
                    error!("spawn_blocking join error: {}", e);
                    return;
                }
            };

            if allowed.len() < requested {
                warn!(
                    "{} ({}) asked for {} conversations but participates in {}",
                    username,
                    user_id,
                    requested,
                    allowed.len()
                );
            }
            info!("{} ({}) subscribing to {} conversations", username, user_id, allowed.len());
            subscriptions.replace_conversations(&allowed);
        }
        GatewayCommand::Unsubscribe { conversation_ids } => {
            subscriptions.remove_conversations(&conversation_ids);
        }
        GatewayCommand::StartTyping { conversation_id } => {
            let channel = ChannelKey::Conversation(conversation_id);
            // Subscribing already proved participation
            if !subscriptions.contains(&channel) {
                warn!("{} ({}) typing in unsubscribed {}", username, user_id, channel);
                return;
            }
            dispatcher.publish(
                channel,
                FanoutEvent::Typing {
                    conversation_id,
                    user_id,
                    username: username.to_string(),
                },
            );
        }
    }
}

/// Record the public profile carried by the token so chat lists can show it.
async fn sync_profile(db: &Arc<Database>, claims: &Claims) {
    let db = db.clone();
    let profile = UserProfile {
        id: claims.sub,
        username: claims.username.clone(),
        display_name: None,
        avatar_url: None,
    };
    let now = chrono::Utc::now().timestamp_micros();

    match tokio::task::spawn_blocking(move || db.upsert_user_profile(&profile, now)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Profile sync failed for {}: {}", claims.sub, e),
        Err(e) => error!("spawn_blocking join error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        dispatcher: Dispatcher,
        db: Arc<Database>,
        alice: Uuid,
        bob: Uuid,
        shared: Uuid,
    }

    fn pair() -> Pair {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (conversation, _) = db.get_or_create_conversation(alice, bob, Uuid::new_v4(), 1).unwrap();
        Pair {
            dispatcher: Dispatcher::new(16),
            db,
            alice,
            bob,
            shared: conversation.id,
        }
    }

    #[tokio::test]
    async fn subscribe_keeps_only_own_conversations() {
        let p = pair();
        let (foreign, _) = p
            .db
            .get_or_create_conversation(p.bob, Uuid::new_v4(), Uuid::new_v4(), 2)
            .unwrap();
        let handle = p.dispatcher.register_connection(p.alice);

        let cmd = GatewayCommand::Subscribe {
            conversation_ids: vec![p.shared, foreign.id, Uuid::new_v4()],
        };
        handle_command(&p.dispatcher, &p.db, p.alice, "alice", &handle.subscriptions, cmd).await;

        assert!(handle.subscriptions.contains(&ChannelKey::Conversation(p.shared)));
        assert!(!handle.subscriptions.contains(&ChannelKey::Conversation(foreign.id)));
        assert!(handle.subscriptions.contains(&ChannelKey::User(p.alice)));
        assert_eq!(handle.subscriptions.len(), 2);
    }

    #[tokio::test]
    async fn subscribe_replaces_and_unsubscribe_removes() {
        let p = pair();
        let carol = Uuid::new_v4();
        let (second, _) = p.db.get_or_create_conversation(p.alice, carol, Uuid::new_v4(), 2).unwrap();
        let handle = p.dispatcher.register_connection(p.alice);
        let subs = &handle.subscriptions;

        let first = GatewayCommand::Subscribe { conversation_ids: vec![p.shared] };
        handle_command(&p.dispatcher, &p.db, p.alice, "alice", subs, first).await;
        let replace = GatewayCommand::Subscribe { conversation_ids: vec![second.id] };
        handle_command(&p.dispatcher, &p.db, p.alice, "alice", subs, replace).await;

        assert!(!subs.contains(&ChannelKey::Conversation(p.shared)));
        assert!(subs.contains(&ChannelKey::Conversation(second.id)));

        let leave = GatewayCommand::Unsubscribe { conversation_ids: vec![second.id] };
        handle_command(&p.dispatcher, &p.db, p.alice, "alice", subs, leave).await;
        assert!(!subs.contains(&ChannelKey::Conversation(second.id)));
        // The user channel survives every change
        assert!(subs.contains(&ChannelKey::User(p.alice)));
        assert_eq!(subs.len(), 1);
    }

    #[tokio::test]
    async fn typing_requires_a_subscription() {
        let p = pair();
        let typist = p.dispatcher.register_connection(p.alice);
        let mut watcher = p.dispatcher.register_connection(p.bob);
        watcher.subscriptions.replace_conversations(&[p.shared]);

        let typing = GatewayCommand::StartTyping { conversation_id: p.shared };
        handle_command(&p.dispatcher, &p.db, p.alice, "alice", &typist.subscriptions, typing).await;

        let quiet = tokio::time::timeout(Duration::from_millis(50), watcher.recv()).await;
        assert!(quiet.is_err());
        assert_eq!(p.dispatcher.subscriber_count(ChannelKey::Conversation(p.shared)), 1);
    }

    #[tokio::test]
    async fn typing_reaches_the_other_participant() {
        let p = pair();
        let typist = p.dispatcher.register_connection(p.alice);
        let mut watcher = p.dispatcher.register_connection(p.bob);
        watcher.subscriptions.replace_conversations(&[p.shared]);

        let subscribe = GatewayCommand::Subscribe { conversation_ids: vec![p.shared] };
        handle_command(&p.dispatcher, &p.db, p.alice, "alice", &typist.subscriptions, subscribe).await;
        let typing = GatewayCommand::StartTyping { conversation_id: p.shared };
        handle_command(&p.dispatcher, &p.db, p.alice, "alice", &typist.subscriptions, typing).await;

        let event = tokio::time::timeout(Duration::from_secs(1), watcher.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, "typing");
        assert_eq!(event.channel, ChannelKey::Conversation(p.shared));
        assert!(event.json.contains("\"username\":\"alice\""));
    }
}
