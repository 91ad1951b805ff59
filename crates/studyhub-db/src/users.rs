use anyhow::Result;
use rusqlite::Connection;
use studyhub_types::models::UserProfile;
use uuid::Uuid;

use crate::Database;
use crate::models::{OptionalExt, uuid_at};

impl Database {
    /// Insert or refresh a profile. `None` fields keep what is already stored.
    pub fn upsert_user_profile(&self, profile: &UserProfile, now_us: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name, avatar_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    display_name = COALESCE(excluded.display_name, users.display_name),
                    avatar_url = COALESCE(excluded.avatar_url, users.avatar_url),
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    profile.id.to_string(),
                    profile.username,
                    profile.display_name,
                    profile.avatar_url,
                    now_us,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user_profile(&self, id: Uuid) -> Result<Option<UserProfile>> {
        self.with_conn(|conn| query_profile(conn, id))
    }
}

fn query_profile(conn: &Connection, id: Uuid) -> Result<Option<UserProfile>> {
    conn.query_row(
        "SELECT id, username, display_name, avatar_url FROM users WHERE id = ?1",
        [id.to_string()],
        |row| {
            Ok(UserProfile {
                id: uuid_at(row, 0)?,
                username: row.get(1)?,
                display_name: row.get(2)?,
                avatar_url: row.get(3)?,
            })
        },
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_existing_optional_fields() {
        let db = Database::open_in_memory().unwrap();
        let id = Uuid::new_v4();

        db.upsert_user_profile(
            &UserProfile {
                id,
                username: "ada".into(),
                display_name: Some("Ada L.".into()),
                avatar_url: Some("https://cdn/ada.png".into()),
            },
            1,
        )
        .unwrap();
        db.upsert_user_profile(
            &UserProfile {
                id,
                username: "ada_l".into(),
                display_name: None,
                avatar_url: None,
            },
            2,
        )
        .unwrap();

        let profile = db.get_user_profile(id).unwrap().unwrap();
        assert_eq!(profile.username, "ada_l");
        assert_eq!(profile.display_name.as_deref(), Some("Ada L."));
        assert_eq!(profile.avatar_url.as_deref(), Some("https://cdn/ada.png"));
        assert!(db.get_user_profile(Uuid::new_v4()).unwrap().is_none());
    }
}
