use anyhow::Result;
use rusqlite::Row;
use rusqlite::types::Type;
use studyhub_types::models::{Notification, NotificationKind};
use uuid::Uuid;

use crate::Database;
use crate::models::{
    NOTIFICATION_COLUMNS, OptionalExt, datetime_to_micros, micros_to_datetime, opt_uuid_at,
    uuid_at,
};

impl Database {
    pub fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, recipient_id, actor_id, kind, message, link, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    notification.id.to_string(),
                    notification.recipient_id.to_string(),
                    notification.actor_id.map(|id| id.to_string()),
                    notification.kind.as_str(),
                    notification.message,
                    notification.link,
                    notification.is_read,
                    datetime_to_micros(notification.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS);
            conn.query_row(&sql, [id.to_string()], notification_from_row)
                .optional()
        })
    }

    /// Newest first, skipping `offset` rows.
    pub fn notifications_for(&self, recipient_id: Uuid, offset: u64, limit: u32) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM notifications
                 WHERE recipient_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3",
                NOTIFICATION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![recipient_id.to_string(), limit, offset as i64],
                    notification_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_notifications(&self, recipient_id: Uuid) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1",
            recipient_id,
        )
    }

    pub fn unread_notification_count(&self, recipient_id: Uuid) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
            recipient_id,
        )
    }

    /// Returns false if the notification was already read or does not exist.
    pub fn mark_notification_read(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND is_read = 0",
                [id.to_string()],
            )?;
            Ok(updated == 1)
        })
    }

    pub fn mark_all_notifications_read(&self, recipient_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id.to_string()],
            )?;
            Ok(updated)
        })
    }

    pub fn delete_notification(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM notifications WHERE id = ?1", [id.to_string()])?;
            Ok(deleted == 1)
        })
    }

    pub fn clear_notifications(&self, recipient_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM notifications WHERE recipient_id = ?1",
                [recipient_id.to_string()],
            )?;
            Ok(deleted)
        })
    }

    fn count(&self, sql: &str, recipient_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(sql, [recipient_id.to_string()], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let kind: String = row.get(3)?;
    let kind = kind
        .parse::<NotificationKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(Notification {
        id: uuid_at(row, 0)?,
        recipient_id: uuid_at(row, 1)?,
        actor_id: opt_uuid_at(row, 2)?,
        kind,
        message: row.get(4)?,
        link: row.get(5)?,
        is_read: row.get(6)?,
        created_at: micros_to_datetime(row.get(7)?),
    })
}
