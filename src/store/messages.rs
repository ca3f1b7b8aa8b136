use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{from_millis, to_millis, MessageStore, PendingEntry, SqliteStore};
use crate::error::Result;
use crate::protocol::{ChatMessage, MessageContent};

const MESSAGE_COLUMNS: &str = "message_id, sender, sender_display_name, recipient, kind, \
                               body, image_payload, reply_to, sent_at, created_at";

/// Insert a message into `table` (either partition; the layout is shared).
fn insert_message(conn: &Connection, table: &str, message: &ChatMessage) -> Result<i64> {
    let (kind, body, image_payload) = match &message.content {
        MessageContent::Text { body } => ("text", Some(body.as_str()), None),
        MessageContent::Image { image_payload } => ("image", None, Some(image_payload.as_str())),
    };
    let reply_to = message.reply_to.as_ref().map(|v| v.to_string());

    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            table, MESSAGE_COLUMNS
        ),
        params![
            message.id,
            message.from,
            message.from_display_name,
            message.to,
            kind,
            body,
            image_payload,
            reply_to,
            message.sent_at,
            to_millis(message.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Map a row selected as `id, <MESSAGE_COLUMNS>`.
fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<PendingEntry> {
    let kind: String = row.get(5)?;
    let content = match kind.as_str() {
        "image" => MessageContent::Image {
            image_payload: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        },
        _ => MessageContent::Text {
            body: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        },
    };
    let reply_to = row
        .get::<_, Option<String>>(8)?
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(PendingEntry {
        id: row.get(0)?,
        message: ChatMessage {
            id: row.get(1)?,
            from: row.get(2)?,
            from_display_name: row.get(3)?,
            to: row.get(4)?,
            content,
            reply_to,
            sent_at: row.get(9)?,
            created_at: from_millis(row.get(10)?),
        },
    })
}

impl MessageStore for SqliteStore {
    fn archive(&self, message: &ChatMessage) -> Result<()> {
        let conn = self.conn.lock();
        insert_message(&conn, "archived_messages", message)?;
        Ok(())
    }

    fn enqueue_pending(&self, message: &ChatMessage) -> Result<i64> {
        let conn = self.conn.lock();
        let id = insert_message(&conn, "pending_messages", message)?;
        tracing::debug!(
            id = id,
            from = message.from.as_str(),
            to = message.to.as_str(),
            "Queued pending message"
        );
        Ok(id)
    }

    fn pending_for(&self, recipient: &str, not_before: DateTime<Utc>) -> Result<Vec<PendingEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, {} FROM pending_messages
             WHERE recipient = ?1 AND created_at >= ?2
             ORDER BY id",
            MESSAGE_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![recipient, to_millis(not_before)], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn delete_pending(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM pending_messages WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn purge_pending_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM pending_messages WHERE created_at < ?1",
            params![to_millis(cutoff)],
        )?;
        Ok(removed)
    }

    fn pending_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    fn archive_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM archived_messages", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}
