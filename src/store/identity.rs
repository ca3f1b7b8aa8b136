use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{from_millis, to_millis, Identity, IdentityStore, Profile, SqliteStore};
use crate::error::{RelayError, Result};

impl IdentityStore for SqliteStore {
    fn find_by_username(&self, username: &str) -> Result<Option<Identity>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT username, password_hash, display_name, last_seen
                 FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((username, password_hash, display_name, last_seen)) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare("SELECT friend FROM friends WHERE owner = ?1")?;
        let friends = stmt
            .query_map(params![username], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;

        Ok(Some(Identity {
            username,
            password_hash,
            display_name,
            friends,
            last_seen: last_seen.map(from_millis),
        }))
    }

    fn create(&self, username: &str, password_hash: &str, display_name: &str) -> Result<Identity> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (username, password_hash, display_name, last_seen, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![username, password_hash, display_name, to_millis(Utc::now())],
        )?;

        if inserted == 0 {
            return Err(RelayError::Conflict(format!(
                "username '{}' is already taken",
                username
            )));
        }

        tracing::info!(username = username, "Account created");
        Ok(Identity {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            display_name: display_name.to_string(),
            friends: Default::default(),
            last_seen: None,
        })
    }

    fn update_display_name(&self, username: &str, display_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET display_name = ?2 WHERE username = ?1",
            params![username, display_name],
        )?;
        if updated == 0 {
            return Err(RelayError::RecipientUnknown(username.to_string()));
        }
        Ok(())
    }

    fn add_friend(&self, username: &str, friend: &str) -> Result<Profile> {
        let conn = self.conn.lock();

        let profile = conn
            .query_row(
                "SELECT username, display_name, last_seen FROM users WHERE username = ?1",
                params![friend],
                |row| {
                    Ok(Profile {
                        username: row.get(0)?,
                        display_name: row.get(1)?,
                        last_seen: row.get::<_, Option<i64>>(2)?.map(from_millis),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| RelayError::RecipientUnknown(friend.to_string()))?;

        conn.execute(
            "INSERT OR IGNORE INTO friends (owner, friend, added_at) VALUES (?1, ?2, ?3)",
            params![username, friend, to_millis(Utc::now())],
        )?;

        Ok(profile)
    }

    fn remove_friend(&self, username: &str, friend: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM friends WHERE owner = ?1 AND friend = ?2",
            params![username, friend],
        )?;
        Ok(removed > 0)
    }

    fn friends_of(&self, username: &str) -> Result<Vec<Profile>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT u.username, u.display_name, u.last_seen
             FROM friends f JOIN users u ON u.username = f.friend
             WHERE f.owner = ?1
             ORDER BY f.added_at, u.username",
        )?;
        let profiles = stmt
            .query_map(params![username], |row| {
                Ok(Profile {
                    username: row.get(0)?,
                    display_name: row.get(1)?,
                    last_seen: row.get::<_, Option<i64>>(2)?.map(from_millis),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    fn touch_last_seen(&self, username: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_seen = ?2 WHERE username = ?1",
            params![username, to_millis(at)],
        )?;
        Ok(())
    }

    fn set_push_endpoint(&self, username: &str, endpoint: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO push_subscriptions (username, endpoint, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(username) DO UPDATE SET endpoint = excluded.endpoint,
                                                 updated_at = excluded.updated_at",
            params![username, endpoint, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    fn push_endpoint(&self, username: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let endpoint = conn
            .query_row(
                "SELECT endpoint FROM push_subscriptions WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(endpoint)
    }
}
