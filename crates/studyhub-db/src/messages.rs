use std::collections::HashMap;

use anyhow::Result;
use rusqlite::{Connection, TransactionBehavior};
use studyhub_types::models::{Message, Reaction, TOMBSTONE_TEXT};
use uuid::Uuid;

use crate::Database;
use crate::models::{
    BodyColumns, MESSAGE_COLUMNS, MessageRow, NewMessage, OptionalExt, ReactionToggle, Tombstoned,
    micros_to_datetime, uuid_at,
};

impl Database {
    // -- Log --

    /// Append a message and move the conversation's `last_message` pointer in
    /// one transaction. Returns `None` if the conversation does not exist
    /// (for example, it was deleted concurrently).
    ///
    /// `created_at` is `now_us`, bumped past the newest message already in the
    /// conversation, so the per-conversation order is total even when two
    /// writers land in the same microsecond.
    pub fn insert_message(&self, new: &NewMessage, now_us: i64) -> Result<Option<Message>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cid = new.conversation_id.to_string();

            let exists = tx
                .prepare("SELECT 1 FROM conversations WHERE id = ?1")?
                .exists([&cid])?;
            if !exists {
                return Ok(None);
            }

            let newest: Option<i64> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [&cid],
                |row| row.get(0),
            )?;
            let created_at = newest.map_or(now_us, |newest| now_us.max(newest + 1));

            let body = BodyColumns::from(&new.body);
            let reply = new.reply_to.as_ref();
            tx.execute(
                "INSERT INTO messages (
                    id, conversation_id, sender_id, created_at, body_kind,
                    content, image_url, image_key, file_url, file_key, file_name,
                    reply_to_id, reply_to_content, reply_to_sender)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                rusqlite::params![
                    new.id.to_string(),
                    cid,
                    new.sender_id.to_string(),
                    created_at,
                    body.kind,
                    body.content,
                    body.image_url,
                    body.image_key,
                    body.file_url,
                    body.file_key,
                    body.file_name,
                    reply.map(|r| r.id.to_string()),
                    reply.map(|r| r.content.clone()),
                    reply.map(|r| r.sender_id.to_string()),
                ],
            )?;

            tx.execute(
                "UPDATE conversations SET last_message_id = ?1, last_message_at = ?2 WHERE id = ?3",
                rusqlite::params![new.id.to_string(), created_at, cid],
            )?;
            tx.commit()?;

            Ok(Some(Message {
                id: new.id,
                conversation_id: new.conversation_id,
                sender_id: new.sender_id,
                created_at: micros_to_datetime(created_at),
                body: new.body.clone(),
                reply_to: new.reply_to.clone(),
                reactions: vec![],
                read_by: vec![],
                edited: false,
                deleted_for_everyone: false,
                pinned: false,
            }))
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
            let row = conn
                .query_row(&sql, [id.to_string()], MessageRow::from_row)
                .optional()?;
            let Some(row) = row else {
                return Ok(None);
            };

            let mut messages = hydrate(conn, vec![row])?;
            Ok(messages.pop())
        })
    }

    /// Up to `limit` messages strictly older than `before_us`, returned oldest
    /// first. Edits and tombstones never touch `created_at`, so cursors stay valid.
    pub fn messages_page(
        &self,
        conversation_id: Uuid,
        before_us: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND created_at < ?2
                 ORDER BY created_at DESC
                 LIMIT ?3",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(
                    rusqlite::params![
                        conversation_id.to_string(),
                        before_us.unwrap_or(i64::MAX),
                        limit
                    ],
                    MessageRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();

            hydrate(conn, rows)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes the `(user, emoji)` pair if present,
    /// inserts it otherwise. Tombstoned messages are left untouched; the
    /// check runs inside the same transaction as the write.
    pub fn toggle_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str, now_us: i64) -> Result<ReactionToggle> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mid = message_id.to_string();
            let uid = user_id.to_string();

            let deleted: Option<bool> = tx
                .query_row(
                    "SELECT deleted_for_everyone FROM messages WHERE id = ?1",
                    [&mid],
                    |row| row.get(0),
                )
                .optional()?;
            match deleted {
                None => return Ok(ReactionToggle::MessageMissing),
                Some(true) => return Ok(ReactionToggle::MessageDeleted),
                Some(false) => {}
            }

            let removed = tx.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                rusqlite::params![mid, uid, emoji],
            )?;
            if removed == 0 {
                tx.execute(
                    "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![mid, uid, emoji, now_us],
                )?;
            }
            tx.commit()?;

            Ok(if removed == 0 {
                ReactionToggle::Added
            } else {
                ReactionToggle::Removed
            })
        })
    }

    // -- Read receipts --

    /// Add `user_id` to the message's `read_by`. Returns false if it was already there.
    pub fn mark_read(&self, message_id: Uuid, user_id: Uuid, now_us: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![message_id.to_string(), user_id.to_string(), now_us],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn read_by(&self, message_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let reads = reads_for(conn, &[message_id.to_string()])?;
            Ok(reads.into_values().next().unwrap_or_default())
        })
    }

    /// Mark every message the other participant sent up to and including
    /// `up_to_us` as read by `user_id`. Returns the ids that changed, oldest first.
    pub fn mark_all_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        up_to_us: Option<i64>,
        now_us: i64,
    ) -> Result<Vec<Uuid>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let user = user_id.to_string();

            let unread: Vec<Uuid> = {
                let mut stmt = tx.prepare(
                    "SELECT m.id FROM messages m
                     WHERE m.conversation_id = ?1
                       AND m.sender_id != ?2
                       AND m.created_at <= ?3
                       AND NOT EXISTS (
                           SELECT 1 FROM message_reads r
                            WHERE r.message_id = m.id AND r.user_id = ?2)
                     ORDER BY m.created_at",
                )?;
                let ids = stmt
                    .query_map(
                        rusqlite::params![conversation_id.to_string(), user, up_to_us.unwrap_or(i64::MAX)],
                        |row| uuid_at(row, 0),
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ids
            };

            let mut marked = Vec::with_capacity(unread.len());
            {
                let mut insert = tx.prepare(
                    "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                )?;
                for id in unread {
                    if insert.execute(rusqlite::params![id.to_string(), user, now_us])? == 1 {
                        marked.push(id);
                    }
                }
            }
            tx.commit()?;

            Ok(marked)
        })
    }

    // -- Edits and tombstones --

    /// Replace the text of a live text message. Returns false if the message
    /// is missing, not text, or already tombstoned.
    pub fn edit_message(&self, message_id: Uuid, content: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET content = ?2, edited = 1
                 WHERE id = ?1 AND deleted_for_everyone = 0 AND body_kind = 'text'",
                rusqlite::params![message_id.to_string(), content],
            )?;
            Ok(updated == 1)
        })
    }

    /// Clear content and attachments, keep the ordering slot, reactions and
    /// read receipts. A pinned message is unpinned.
    pub fn tombstone_message(&self, message_id: Uuid) -> Result<Tombstoned> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mid = message_id.to_string();

            let state: Option<(String, bool, bool)> = tx
                .query_row(
                    "SELECT conversation_id, deleted_for_everyone, pinned FROM messages WHERE id = ?1",
                    [&mid],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((conversation_id, false, pinned)) = state else {
                return Ok(Tombstoned {
                    changed: false,
                    was_pinned: false,
                });
            };

            tx.execute(
                "UPDATE messages SET
                    deleted_for_everyone = 1, pinned = 0, body_kind = 'text', content = ?2,
                    image_url = NULL, image_key = NULL,
                    file_url = NULL, file_key = NULL, file_name = NULL
                 WHERE id = ?1",
                rusqlite::params![mid, TOMBSTONE_TEXT],
            )?;
            if pinned {
                tx.execute(
                    "UPDATE conversations SET pinned_message_id = NULL
                     WHERE id = ?1 AND pinned_message_id = ?2",
                    [&conversation_id, &mid],
                )?;
            }
            tx.commit()?;

            Ok(Tombstoned {
                changed: true,
                was_pinned: pinned,
            })
        })
    }
}

/// Attach reactions and read receipts to message rows (two batched queries, no N+1).
fn hydrate(conn: &Connection, rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    let ids: Vec<String> = rows.iter().map(|r| r.id.to_string()).collect();
    let mut reactions = reactions_for(conn, &ids)?;
    let mut reads = reads_for(conn, &ids)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let id = row.id;
            row.into_message(
                reactions.remove(&id).unwrap_or_default(),
                reads.remove(&id).unwrap_or_default(),
            )
        })
        .collect())
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn reactions_for(conn: &Connection, message_ids: &[String]) -> Result<HashMap<Uuid, Vec<Reaction>>> {
    let mut map: HashMap<Uuid, Vec<Reaction>> = HashMap::new();
    if message_ids.is_empty() {
        return Ok(map);
    }

    let sql = format!(
        "SELECT message_id, user_id, emoji FROM reactions
         WHERE message_id IN ({}) ORDER BY created_at, rowid",
        placeholders(message_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(message_ids), |row| {
        Ok((
            uuid_at(row, 0)?,
            Reaction {
                user_id: uuid_at(row, 1)?,
                emoji: row.get(2)?,
            },
        ))
    })?;
    for row in rows {
        let (message_id, reaction) = row?;
        map.entry(message_id).or_default().push(reaction);
    }
    Ok(map)
}

fn reads_for(conn: &Connection, message_ids: &[String]) -> Result<HashMap<Uuid, Vec<Uuid>>> {
    let mut map: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    if message_ids.is_empty() {
        return Ok(map);
    }

    let sql = format!(
        "SELECT message_id, user_id FROM message_reads
         WHERE message_id IN ({}) ORDER BY read_at, rowid",
        placeholders(message_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(message_ids), |row| {
        Ok((uuid_at(row, 0)?, uuid_at(row, 1)?))
    })?;
    for row in rows {
        let (message_id, user_id) = row?;
        map.entry(message_id).or_default().push(user_id);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::datetime_to_micros;
    use studyhub_types::models::{MessageBody, ReplySnapshot};

    struct Fixture {
        db: Database,
        conversation: Uuid,
        alice: Uuid,
        bob: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (conv, _) = db.get_or_create_conversation(alice, bob, Uuid::new_v4(), 1).unwrap();
        Fixture {
            db,
            conversation: conv.id,
            alice,
            bob,
        }
    }

    impl Fixture {
        fn send(&self, sender: Uuid, body: MessageBody, now: i64) -> Message {
            self.db
                .insert_message(
                    &NewMessage {
                        id: Uuid::new_v4(),
                        conversation_id: self.conversation,
                        sender_id: sender,
                        body,
                        reply_to: None,
                    },
                    now,
                )
                .unwrap()
                .unwrap()
        }

        fn say(&self, sender: Uuid, content: &str, now: i64) -> Message {
            self.send(sender, MessageBody::text(content).unwrap(), now)
        }
    }

    #[test]
    fn same_timestamp_writes_are_still_totally_ordered() {
        let f = fixture();
        let m1 = f.say(f.alice, "a", 1_000);
        let m2 = f.say(f.bob, "b", 1_000);
        let m3 = f.say(f.alice, "c", 999);

        assert!(m1.created_at < m2.created_at);
        assert!(m2.created_at < m3.created_at);

        let conv = f.db.get_conversation(f.conversation).unwrap().unwrap();
        assert_eq!(conv.last_message_id, Some(m3.id));
    }

    #[test]
    fn insert_into_unknown_conversation_writes_nothing() {
        let f = fixture();
        let id = Uuid::new_v4();
        let result = f.db.insert_message(
            &NewMessage {
                id,
                conversation_id: Uuid::new_v4(),
                sender_id: f.alice,
                body: MessageBody::text("lost").unwrap(),
                reply_to: None,
            },
            5,
        );
        assert!(result.unwrap().is_none());
        assert!(f.db.get_message(id).unwrap().is_none());
    }

    #[test]
    fn pages_are_stable_under_mutation() {
        let f = fixture();
        let sent: Vec<Message> = (0..5).map(|i| f.say(f.alice, &format!("m{}", i), 10 + i)).collect();

        let newest = f.db.messages_page(f.conversation, None, 2).unwrap();
        assert_eq!(
            newest.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![sent[3].id, sent[4].id]
        );

        // Mutate older messages between page reads
        f.db.edit_message(sent[2].id, "edited").unwrap();
        f.db.tombstone_message(sent[1].id).unwrap();
        f.db.toggle_reaction(sent[0].id, f.bob, "🔥", 50).unwrap();

        let cursor = datetime_to_micros(newest[0].created_at);
        let older = f.db.messages_page(f.conversation, Some(cursor), 2).unwrap();
        assert_eq!(
            older.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![sent[1].id, sent[2].id]
        );
        assert!(older[0].deleted_for_everyone);
        assert!(older[1].edited);

        let cursor = datetime_to_micros(older[0].created_at);
        let oldest = f.db.messages_page(f.conversation, Some(cursor), 2).unwrap();
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].id, sent[0].id);
        assert_eq!(oldest[0].reactions.len(), 1);
    }

    #[test]
    fn reaction_toggles_without_duplicates() {
        let f = fixture();
        let m = f.say(f.alice, "Hi", 1);

        assert_eq!(f.db.toggle_reaction(m.id, f.bob, "👍", 2).unwrap(), ReactionToggle::Added);
        assert_eq!(f.db.toggle_reaction(m.id, f.bob, "👍", 3).unwrap(), ReactionToggle::Removed);
        assert_eq!(f.db.toggle_reaction(m.id, f.bob, "👍", 4).unwrap(), ReactionToggle::Added);
        assert_eq!(f.db.toggle_reaction(m.id, f.alice, "👍", 5).unwrap(), ReactionToggle::Added);
        assert_eq!(
            f.db.toggle_reaction(Uuid::new_v4(), f.alice, "👍", 6).unwrap(),
            ReactionToggle::MessageMissing
        );

        let reactions = f.db.get_message(m.id).unwrap().unwrap().reactions;
        assert_eq!(reactions.len(), 2);
        assert_eq!(reactions.iter().filter(|r| r.user_id == f.bob).count(), 1);
    }

    #[test]
    fn read_receipts_are_a_set() {
        let f = fixture();
        let m = f.say(f.alice, "Hi", 1);

        assert!(f.db.mark_read(m.id, f.bob, 2).unwrap());
        assert!(!f.db.mark_read(m.id, f.bob, 3).unwrap());
        assert_eq!(f.db.read_by(m.id).unwrap(), vec![f.bob]);
    }

    #[test]
    fn mark_all_read_respects_bound_and_sender() {
        let f = fixture();
        let a1 = f.say(f.alice, "1", 10);
        let _b1 = f.say(f.bob, "mine", 11);
        let a2 = f.say(f.alice, "2", 12);
        let a3 = f.say(f.alice, "3", 13);

        let marked = f
            .db
            .mark_all_read(f.conversation, f.bob, Some(datetime_to_micros(a2.created_at)), 20)
            .unwrap();
        assert_eq!(marked, vec![a1.id, a2.id]);

        let marked = f.db.mark_all_read(f.conversation, f.bob, None, 21).unwrap();
        assert_eq!(marked, vec![a3.id]);

        assert!(f.db.mark_all_read(f.conversation, f.bob, None, 22).unwrap().is_empty());
    }

    #[test]
    fn tombstone_keeps_slot_and_audit_state() {
        let f = fixture();
        let m = f.send(
            f.alice,
            MessageBody::Image {
                url: "https://cdn/x.png".into(),
                key: Some("uploads/x.png".into()),
            },
            1,
        );
        f.db.toggle_reaction(m.id, f.bob, "👍", 2).unwrap();
        f.db.mark_read(m.id, f.bob, 3).unwrap();
        f.db.pin_message(f.conversation, m.id).unwrap().unwrap();

        let outcome = f.db.tombstone_message(m.id).unwrap();
        assert!(outcome.changed);
        assert!(outcome.was_pinned);

        let stored = f.db.get_message(m.id).unwrap().unwrap();
        assert!(stored.deleted_for_everyone);
        assert_eq!(stored.body, MessageBody::tombstone());
        assert_eq!(stored.created_at, m.created_at);
        assert_eq!(stored.reactions.len(), 1);
        assert_eq!(stored.read_by, vec![f.bob]);
        assert!(!stored.pinned);
        assert!(f.db.get_conversation(f.conversation).unwrap().unwrap().pinned_message_id.is_none());

        assert!(!f.db.tombstone_message(m.id).unwrap().changed);
        assert!(!f.db.edit_message(m.id, "revive").unwrap());
    }

    #[test]
    fn tombstoned_messages_reject_reactions_and_pins() {
        let f = fixture();
        let m = f.say(f.alice, "gone soon", 1);
        f.db.toggle_reaction(m.id, f.bob, "👍", 2).unwrap();
        f.db.tombstone_message(m.id).unwrap();

        // Neither adding nor removing touches a tombstone
        assert_eq!(
            f.db.toggle_reaction(m.id, f.bob, "👍", 3).unwrap(),
            ReactionToggle::MessageDeleted
        );
        assert_eq!(
            f.db.toggle_reaction(m.id, f.bob, "🎉", 4).unwrap(),
            ReactionToggle::MessageDeleted
        );
        assert_eq!(f.db.get_message(m.id).unwrap().unwrap().reactions.len(), 1);

        assert!(f.db.pin_message(f.conversation, m.id).unwrap().is_none());
        let stored = f.db.get_message(m.id).unwrap().unwrap();
        assert!(!stored.pinned);
        assert!(f.db.get_conversation(f.conversation).unwrap().unwrap().pinned_message_id.is_none());
    }

    #[test]
    fn reply_snapshot_survives_edit_of_original() {
        let f = fixture();
        let original = f.say(f.alice, "question?", 1);
        let reply = f
            .db
            .insert_message(
                &NewMessage {
                    id: Uuid::new_v4(),
                    conversation_id: f.conversation,
                    sender_id: f.bob,
                    body: MessageBody::text("answer").unwrap(),
                    reply_to: Some(ReplySnapshot {
                        id: original.id,
                        content: original.body.preview(),
                        sender_id: original.sender_id,
                    }),
                },
                2,
            )
            .unwrap()
            .unwrap();

        f.db.edit_message(original.id, "changed question").unwrap();

        let stored = f.db.get_message(reply.id).unwrap().unwrap();
        assert_eq!(stored.reply_to.unwrap().content, "question?");
    }
}
