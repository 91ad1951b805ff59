use anyhow::Result;
use rusqlite::{Connection, Row, TransactionBehavior};
use studyhub_types::api::{ConversationSummary, LastMessagePreview};
use studyhub_types::models::{Conversation, TOMBSTONE_TEXT, UserProfile};
use uuid::Uuid;

use crate::Database;
use crate::models::{
    CONVERSATION_COLUMNS, OptionalExt, PinChange, body_from_columns, micros_to_datetime,
    opt_uuid_at, uuid_at,
};

impl Database {
    /// Return the single conversation for the unordered pair, creating it if
    /// needed. A concurrent insert for the same pair loses on the unique
    /// `pair_key` and reads back the winner's row.
    ///
    /// Returns `(conversation, created)`.
    pub fn get_or_create_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        new_id: Uuid,
        now_us: i64,
    ) -> Result<(Conversation, bool)> {
        let [low, high] = Conversation::sorted_pair(user_a, user_b);
        let pair_key = Conversation::pair_key(user_a, user_b);

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO conversations (id, pair_key, user_a, user_b, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(pair_key) DO NOTHING",
                rusqlite::params![
                    new_id.to_string(),
                    pair_key,
                    low.to_string(),
                    high.to_string(),
                    now_us
                ],
            )?;

            let sql = format!(
                "SELECT {} FROM conversations WHERE pair_key = ?1",
                CONVERSATION_COLUMNS
            );
            let conversation = conn.query_row(&sql, [&pair_key], conversation_from_row)?;
            Ok((conversation, inserted == 1))
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// The caller's chat list, most recently active first, enriched with the
    /// other participant's profile and the caller's unread count.
    pub fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.user_a, c.user_b, c.pinned_message_id, c.created_at,
                        COALESCE(c.last_message_at, c.created_at) AS activity,
                        u.username, u.display_name, u.avatar_url,
                        m.id, m.sender_id, m.created_at, m.body_kind, m.content,
                        m.image_url, m.image_key, m.file_url, m.file_key, m.file_name,
                        m.deleted_for_everyone,
                        (SELECT COUNT(*) FROM messages x
                          WHERE x.conversation_id = c.id
                            AND x.sender_id != ?1
                            AND NOT EXISTS (
                                SELECT 1 FROM message_reads r
                                 WHERE r.message_id = x.id AND r.user_id = ?1)) AS unread
                 FROM conversations c
                 LEFT JOIN users u
                        ON u.id = CASE WHEN c.user_a = ?1 THEN c.user_b ELSE c.user_a END
                 LEFT JOIN messages m ON m.id = c.last_message_id
                 WHERE c.user_a = ?1 OR c.user_b = ?1
                 ORDER BY activity DESC, c.id",
            )?;

            let rows = stmt
                .query_map([user_id.to_string()], |row| summary_from_row(row, user_id))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Filter `ids` down to the conversations `user_id` participates in.
    pub fn participant_conversations(&self, user_id: Uuid, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT 1 FROM conversations WHERE id = ?1 AND (user_a = ?2 OR user_b = ?2)",
            )?;
            let user = user_id.to_string();
            let mut allowed = Vec::with_capacity(ids.len());
            for id in ids {
                if stmt.exists(rusqlite::params![id.to_string(), user])? {
                    allowed.push(*id);
                }
            }
            Ok(allowed)
        })
    }

    /// Remove the conversation and, by cascade, its whole message log.
    /// Returns false if it did not exist.
    pub fn delete_conversation(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", [id.to_string()])?;
            Ok(deleted == 1)
        })
    }

    /// Pin `message_id`, implicitly unpinning whatever was pinned before.
    /// Returns None when the message is not a live message of this
    /// conversation; nothing is written in that case.
    pub fn pin_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<Option<PinChange>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cid = conversation_id.to_string();
            let mid = message_id.to_string();

            let previous = current_pin(&tx, &cid)?;
            let pinnable = tx
                .prepare(
                    "SELECT 1 FROM messages
                     WHERE id = ?1 AND conversation_id = ?2 AND deleted_for_everyone = 0",
                )?
                .exists([&mid, &cid])?;
            if !pinnable {
                return Ok(None);
            }
            if previous == Some(message_id) {
                return Ok(Some(PinChange {
                    previous,
                    current: previous,
                }));
            }

            tx.execute(
                "UPDATE messages SET pinned = 0 WHERE conversation_id = ?1 AND pinned = 1",
                [&cid],
            )?;
            let pinned = tx.execute(
                "UPDATE messages SET pinned = 1
                 WHERE id = ?1 AND conversation_id = ?2 AND deleted_for_everyone = 0",
                [&mid, &cid],
            )?;
            if pinned != 1 {
                // Dropping the transaction rolls back the unpin above
                return Ok(None);
            }
            tx.execute(
                "UPDATE conversations SET pinned_message_id = ?1 WHERE id = ?2",
                [&mid, &cid],
            )?;
            tx.commit()?;

            Ok(Some(PinChange {
                previous,
                current: Some(message_id),
            }))
        })
    }

    pub fn unpin_message(&self, conversation_id: Uuid) -> Result<PinChange> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cid = conversation_id.to_string();

            let previous = current_pin(&tx, &cid)?;
            if previous.is_some() {
                tx.execute(
                    "UPDATE messages SET pinned = 0 WHERE conversation_id = ?1 AND pinned = 1",
                    [&cid],
                )?;
                tx.execute(
                    "UPDATE conversations SET pinned_message_id = NULL WHERE id = ?1",
                    [&cid],
                )?;
            }
            tx.commit()?;

            Ok(PinChange {
                previous,
                current: None,
            })
        })
    }
}

fn current_pin(conn: &Connection, conversation_id: &str) -> Result<Option<Uuid>> {
    let pinned = conn
        .query_row(
            "SELECT pinned_message_id FROM conversations WHERE id = ?1",
            [conversation_id],
            |row| opt_uuid_at(row, 0),
        )
        .optional()?;
    Ok(pinned.flatten())
}

pub(crate) fn query_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
    conn.query_row(&sql, [id.to_string()], conversation_from_row)
        .optional()
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let last_message_at: Option<i64> = row.get(4)?;
    Ok(Conversation {
        id: uuid_at(row, 0)?,
        participants: [uuid_at(row, 1)?, uuid_at(row, 2)?],
        last_message_id: opt_uuid_at(row, 3)?,
        last_message_at: last_message_at.map(micros_to_datetime),
        pinned_message_id: opt_uuid_at(row, 5)?,
        created_at: micros_to_datetime(row.get(6)?),
    })
}

fn summary_from_row(row: &Row<'_>, user_id: Uuid) -> rusqlite::Result<ConversationSummary> {
    let id = uuid_at(row, 0)?;
    let user_a = uuid_at(row, 1)?;
    let user_b = uuid_at(row, 2)?;
    let other = if user_a == user_id { user_b } else { user_a };

    let username: Option<String> = row.get(6)?;
    let participant = match username {
        Some(username) => UserProfile {
            id: other,
            username,
            display_name: row.get(7)?,
            avatar_url: row.get(8)?,
        },
        None => UserProfile::unknown(other),
    };

    let last_message = match opt_uuid_at(row, 9)? {
        Some(message_id) => {
            let deleted: bool = row.get(19)?;
            let preview = if deleted {
                TOMBSTONE_TEXT.to_string()
            } else {
                let kind: String = row.get(12)?;
                body_from_columns(
                    &message_id,
                    &kind,
                    row.get(13)?,
                    row.get(14)?,
                    row.get(15)?,
                    row.get(16)?,
                    row.get(17)?,
                    row.get(18)?,
                )
                .preview()
            };
            Some(LastMessagePreview {
                id: message_id,
                sender_id: uuid_at(row, 10)?,
                preview,
                deleted_for_everyone: deleted,
                created_at: micros_to_datetime(row.get(11)?),
            })
        }
        None => None,
    };

    let unread: i64 = row.get(20)?;

    Ok(ConversationSummary {
        id,
        participant,
        last_message,
        last_activity_at: micros_to_datetime(row.get(5)?),
        pinned_message_id: opt_uuid_at(row, 3)?,
        unread_count: unread.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;
    use std::sync::Arc;
    use studyhub_types::models::MessageBody;

    fn text(db: &Database, conversation: Uuid, sender: Uuid, content: &str, now: i64) -> Uuid {
        let id = Uuid::new_v4();
        db.insert_message(
            &NewMessage {
                id,
                conversation_id: conversation,
                sender_id: sender,
                body: MessageBody::text(content).unwrap(),
                reply_to: None,
            },
            now,
        )
        .unwrap()
        .unwrap();
        id
    }

    #[test]
    fn get_or_create_is_idempotent_for_either_order() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let (first, created) = db.get_or_create_conversation(a, b, Uuid::new_v4(), 10).unwrap();
        assert!(created);
        let (second, created) = db.get_or_create_conversation(b, a, Uuid::new_v4(), 20).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.participants, Conversation::sorted_pair(a, b));
    }

    #[test]
    fn concurrent_first_contact_yields_one_conversation() {
        let path = std::env::temp_dir().join(format!("studyhub_pair_{}.db", Uuid::new_v4()));
        // Two independent connections stand in for two server processes.
        let left = Arc::new(Database::open(&path).unwrap());
        let right = Arc::new(Database::open(&path).unwrap());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = if i % 2 == 0 { left.clone() } else { right.clone() };
                let (x, y) = if i % 2 == 0 { (a, b) } else { (b, a) };
                std::thread::spawn(move || {
                    db.get_or_create_conversation(x, y, Uuid::new_v4(), i).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first_id = results[0].0.id;
        assert!(results.iter().all(|(c, _)| c.id == first_id));
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);

        let count: i64 = left
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);

        drop(left);
        drop(right);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn list_is_ordered_by_recency_with_unread_counts() {
        let db = Database::open_in_memory().unwrap();
        let me = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let eve = Uuid::new_v4();
        db.upsert_user_profile(
            &UserProfile {
                id: bob,
                username: "bob".into(),
                display_name: None,
                avatar_url: None,
            },
            1,
        )
        .unwrap();

        let (with_bob, _) = db.get_or_create_conversation(me, bob, Uuid::new_v4(), 100).unwrap();
        let (with_eve, _) = db.get_or_create_conversation(me, eve, Uuid::new_v4(), 200).unwrap();

        text(&db, with_bob.id, bob, "first", 300);
        text(&db, with_bob.id, bob, "second", 400);
        text(&db, with_bob.id, me, "mine", 500);

        let list = db.conversations_for_user(me).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, with_bob.id);
        assert_eq!(list[0].participant.username, "bob");
        assert_eq!(list[0].unread_count, 2);
        assert_eq!(list[0].last_message.as_ref().unwrap().preview, "mine");

        assert_eq!(list[1].id, with_eve.id);
        assert_eq!(list[1].participant.username, "unknown");
        assert!(list[1].last_message.is_none());

        // Bob's view counts only my message
        let bob_list = db.conversations_for_user(bob).unwrap();
        assert_eq!(bob_list.len(), 1);
        assert_eq!(bob_list[0].unread_count, 1);
    }

    #[test]
    fn pinning_replaces_previous_pin() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (conv, _) = db.get_or_create_conversation(a, b, Uuid::new_v4(), 1).unwrap();
        let m1 = text(&db, conv.id, a, "one", 2);
        let m2 = text(&db, conv.id, b, "two", 3);

        let change = db.pin_message(conv.id, m1).unwrap().unwrap();
        assert_eq!(change, PinChange { previous: None, current: Some(m1) });

        let change = db.pin_message(conv.id, m2).unwrap().unwrap();
        assert_eq!(change.previous, Some(m1));
        assert!(!db.get_message(m1).unwrap().unwrap().pinned);
        assert!(db.get_message(m2).unwrap().unwrap().pinned);

        // Same pin again is a no-op
        assert!(!db.pin_message(conv.id, m2).unwrap().unwrap().changed());

        let change = db.unpin_message(conv.id).unwrap();
        assert_eq!(change.previous, Some(m2));
        assert!(db.get_conversation(conv.id).unwrap().unwrap().pinned_message_id.is_none());
        assert!(!db.unpin_message(conv.id).unwrap().changed());
    }

    #[test]
    fn deleting_conversation_removes_its_log() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (conv, _) = db.get_or_create_conversation(a, b, Uuid::new_v4(), 1).unwrap();
        let m = text(&db, conv.id, a, "bye", 2);
        db.toggle_reaction(m, b, "👋", 3).unwrap();

        assert!(db.delete_conversation(conv.id).unwrap());
        assert!(!db.delete_conversation(conv.id).unwrap());
        assert!(db.get_message(m).unwrap().is_none());
        assert!(db.conversations_for_user(a).unwrap().is_empty());
    }

    #[test]
    fn participant_filter_drops_foreign_threads() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let (ab, _) = db.get_or_create_conversation(a, b, Uuid::new_v4(), 1).unwrap();
        let (bc, _) = db.get_or_create_conversation(b, c, Uuid::new_v4(), 2).unwrap();

        let allowed = db.participant_conversations(a, &[ab.id, bc.id, Uuid::new_v4()]).unwrap();
        assert_eq!(allowed, vec![ab.id]);
    }
}
