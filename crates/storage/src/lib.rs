use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{fs, path::Path, str::FromStr};

use shared::domain::{ChannelId, ChannelKind, ChannelRole, MessageId, Role, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub parent_id: Option<MessageId>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredChannel {
    pub channel_id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub user_id: UserId,
    pub display_name: String,
    pub channel_role: ChannelRole,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

fn kind_to_str(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Direct => "direct",
        ChannelKind::Group => "group",
        ChannelKind::Department => "department",
        ChannelKind::Announcement => "announcement",
    }
}

fn kind_from_str(raw: &str) -> ChannelKind {
    match raw {
        "direct" => ChannelKind::Direct,
        "department" => ChannelKind::Department,
        "announcement" => ChannelKind::Announcement,
        _ => ChannelKind::Group,
    }
}

fn role_from_str(raw: &str) -> Role {
    match raw {
        "admin" => Role::Admin,
        "manager" => Role::Manager,
        _ => Role::Employee,
    }
}

fn channel_role_to_str(role: ChannelRole) -> &'static str {
    match role {
        ChannelRole::Owner => "owner",
        ChannelRole::Member => "member",
    }
}

fn channel_role_from_str(raw: &str) -> ChannelRole {
    match raw {
        "owner" => ChannelRole::Owner,
        _ => ChannelRole::Member,
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        role: Role,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name, role) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET display_name=excluded.display_name
             RETURNING id",
        )
        .bind(username)
        .bind(display_name)
        .bind(match role {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Employee => "employee",
        })
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_profile(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username, display_name, role FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            display_name: r.get::<String, _>(2),
            role: role_from_str(r.get::<String, _>(3).as_str()),
        }))
    }

    pub async fn display_name_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT display_name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Creates the channel row and enrolls the creator as owner. Channels are
    /// only ever created through this explicit call, never implicitly.
    pub async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        is_private: bool,
        creator: UserId,
    ) -> Result<ChannelId> {
        let rec = sqlx::query(
            "INSERT INTO channels (name, kind, is_private, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(kind_to_str(kind))
        .bind(is_private)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        let channel_id = ChannelId(rec.get::<i64, _>(0));
        self.add_channel_member(channel_id, creator, ChannelRole::Owner)
            .await?;
        Ok(channel_id)
    }

    /// Finds an existing DIRECT channel whose member set is exactly {a, b}.
    pub async fn find_direct_channel(&self, a: UserId, b: UserId) -> Result<Option<ChannelId>> {
        let row = sqlx::query(
            "SELECT c.id FROM channels c
             WHERE c.kind = 'direct'
               AND EXISTS (SELECT 1 FROM channel_members m WHERE m.channel_id = c.id AND m.user_id = ?)
               AND EXISTS (SELECT 1 FROM channel_members m WHERE m.channel_id = c.id AND m.user_id = ?)
               AND (SELECT COUNT(*) FROM channel_members m WHERE m.channel_id = c.id) = 2
             LIMIT 1",
        )
        .bind(a.0)
        .bind(b.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ChannelId(r.get::<i64, _>(0))))
    }

    pub async fn add_channel_member(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        channel_role: ChannelRole,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO channel_members (channel_id, user_id, channel_role)
             VALUES (?, ?, ?)
             ON CONFLICT(channel_id, user_id) DO UPDATE SET channel_role=excluded.channel_role",
        )
        .bind(channel_id.0)
        .bind(user_id.0)
        .bind(channel_role_to_str(channel_role))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_channel_member(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<()> {
        sqlx::query("DELETE FROM channel_members WHERE channel_id = ? AND user_id = ?")
            .bind(channel_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<Option<(ChannelRole, Option<DateTime<Utc>>)>> {
        let row = sqlx::query(
            "SELECT channel_role, last_read_at FROM channel_members
             WHERE channel_id = ? AND user_id = ?",
        )
        .bind(channel_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            (
                channel_role_from_str(r.get::<String, _>(0).as_str()),
                r.get::<Option<DateTime<Utc>>, _>(1),
            )
        }))
    }

    pub async fn members_of_channel(&self, channel_id: ChannelId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT u.id, u.display_name, m.channel_role, m.last_read_at
             FROM channel_members m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.channel_id = ?
             ORDER BY lower(u.display_name) ASC",
        )
        .bind(channel_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredMember {
                user_id: UserId(r.get::<i64, _>(0)),
                display_name: r.get::<String, _>(1),
                channel_role: channel_role_from_str(r.get::<String, _>(2).as_str()),
                last_read_at: r.get::<Option<DateTime<Utc>>, _>(3),
            })
            .collect())
    }

    pub async fn channel_info(&self, channel_id: ChannelId) -> Result<Option<StoredChannel>> {
        let row = sqlx::query(
            "SELECT id, name, kind, is_private, created_at FROM channels WHERE id = ?",
        )
        .bind(channel_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredChannel {
            channel_id: ChannelId(r.get::<i64, _>(0)),
            name: r.get::<String, _>(1),
            kind: kind_from_str(r.get::<String, _>(2).as_str()),
            is_private: r.get::<bool, _>(3),
            created_at: r.get::<DateTime<Utc>, _>(4),
            last_read_at: None,
            unread_count: 0,
        }))
    }

    /// Channels the user belongs to, with the per-member read marker and the
    /// unread count it implies. `last_read_at` only ever advances, so the
    /// count is monotone non-increasing for a fixed message set.
    pub async fn list_channels_for_user(&self, user_id: UserId) -> Result<Vec<StoredChannel>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.kind, c.is_private, c.created_at, m.last_read_at,
                    (SELECT COUNT(*) FROM messages msg
                     WHERE msg.channel_id = c.id
                       AND msg.sender_user_id <> m.user_id
                       AND msg.is_deleted = 0
                       AND (m.last_read_at IS NULL OR msg.created_at > m.last_read_at))
             FROM channels c
             INNER JOIN channel_members m ON m.channel_id = c.id
             WHERE m.user_id = ?
             ORDER BY c.id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredChannel {
                channel_id: ChannelId(r.get::<i64, _>(0)),
                name: r.get::<String, _>(1),
                kind: kind_from_str(r.get::<String, _>(2).as_str()),
                is_private: r.get::<bool, _>(3),
                created_at: r.get::<DateTime<Utc>, _>(4),
                last_read_at: r.get::<Option<DateTime<Utc>>, _>(5),
                unread_count: u32::try_from(r.get::<i64, _>(6)).unwrap_or(u32::MAX),
            })
            .collect())
    }

    pub async fn insert_message(
        &self,
        channel_id: ChannelId,
        sender_id: UserId,
        content: &str,
        parent_id: Option<MessageId>,
    ) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (channel_id, sender_user_id, content, parent_id, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(channel_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(parent_id.map(|p| p.0))
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            channel_id,
            sender_id,
            content: content.to_string(),
            parent_id,
            is_edited: false,
            is_deleted: false,
            created_at,
        })
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, channel_id, sender_user_id, content, parent_id, is_edited, is_deleted, created_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_message))
    }

    pub async fn list_channel_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = if let Some(before_id) = before {
            sqlx::query(
                "SELECT id, channel_id, sender_user_id, content, parent_id, is_edited, is_deleted, created_at
                 FROM messages
                 WHERE channel_id = ? AND id < ?
                 ORDER BY id DESC
                 LIMIT ?",
            )
            .bind(channel_id.0)
            .bind(before_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, channel_id, sender_user_id, content, parent_id, is_edited, is_deleted, created_at
                 FROM messages
                 WHERE channel_id = ?
                 ORDER BY id DESC
                 LIMIT ?",
            )
            .bind(channel_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    pub async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET content = ?, is_edited = 1 WHERE id = ?")
            .bind(content)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft tombstone: the row stays in place so channel ordering and reply
    /// parents survive, but readers see the deleted flag.
    pub async fn soft_delete_message(&self, message_id: MessageId) -> Result<()> {
        sqlx::query("UPDATE messages SET is_deleted = 1 WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advances the member's read marker. The marker is monotonic: a stale
    /// `at` (out-of-order receipt delivery) never moves it backwards.
    pub async fn mark_read(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let current = self
            .membership(channel_id, user_id)
            .await?
            .and_then(|(_, last_read_at)| last_read_at);
        if let Some(current) = current {
            if at <= current {
                return Ok(());
            }
        }
        sqlx::query(
            "UPDATE channel_members SET last_read_at = ? WHERE channel_id = ? AND user_id = ?",
        )
        .bind(at)
        .bind(channel_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        channel_id: ChannelId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        content: r.get::<String, _>(3),
        parent_id: r.get::<Option<i64>, _>(4).map(MessageId),
        is_edited: r.get::<bool, _>(5),
        is_deleted: r.get::<bool, _>(6),
        created_at: r.get::<DateTime<Utc>, _>(7),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent directory for '{database_url}'"))?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
