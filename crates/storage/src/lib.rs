use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::debug;

use shared::domain::{
    Account, AccountId, Address, BareAddress, ChatId, ChatType, Direction, MessageContent,
    MessageId, MessageReaction, MessageState, MessageType, Modification, PartType, QueryResult,
    Range, StateKind, VersionId,
};
use shared::protocol::{ReactionsPayload, Transformation};

#[derive(Debug, Error)]
pub enum StoreError {
    /// More than one persisted row matches a natural key, or a race
    /// loser could not re-resolve its key. The event is unattributable.
    #[error("conflicting rows for message natural key")]
    Conflict,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db)
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatIdentifier {
    pub id: ChatId,
    pub account: AccountId,
    pub address: BareAddress,
    pub chat_type: ChatType,
    pub members_only_non_anonymous: bool,
}

/// A message identity together with its current content revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIdentifier {
    pub id: MessageId,
    pub version: VersionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageWithContents {
    pub id: MessageId,
    pub from_bare: Option<BareAddress>,
    pub from_resource: Option<String>,
    pub sender_key: String,
    pub sent_at: DateTime<Utc>,
    pub latest_version: VersionId,
    pub modification: Modification,
    pub contents: Vec<MessageContent>,
    pub reactions: Vec<MessageReaction>,
    pub in_reply_to_id: Option<String>,
    pub in_reply_to_message: Option<MessageId>,
    /// `[start, end)` span of the quoted-reply prefix inside the body,
    /// excised at render time.
    pub fallback_span: Option<(u32, u32)>,
}

/// One row of the chat log as handed to a view adapter.
#[derive(Debug, Clone, Serialize)]
pub enum ChatLogItem {
    DateSeparator(NaiveDate),
    Message(MessageWithContents),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub messages: i64,
    pub versions: i64,
    pub contents: i64,
    pub states: i64,
    pub reactions: i64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // a pooled :memory: database is one database per connection; keep a
        // single connection so every handle sees the same store
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
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

    pub async fn create_account(&self, address: &BareAddress) -> Result<AccountId> {
        let rec = sqlx::query(
            "INSERT INTO accounts (address) VALUES (?)
             ON CONFLICT(address) DO UPDATE SET address=excluded.address
             RETURNING id",
        )
        .bind(address.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(AccountId(rec.get::<i64, _>(0)))
    }

    pub async fn get_account(&self, address: &BareAddress) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT id FROM accounts WHERE address = ?")
            .bind(address.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Account {
            id: AccountId(r.get::<i64, _>(0)),
            address: address.clone(),
        }))
    }

    pub async fn get_chat(
        &self,
        account: AccountId,
        address: &BareAddress,
        chat_type: ChatType,
    ) -> Result<Option<ChatIdentifier>> {
        let row = sqlx::query(
            "SELECT id, members_only_non_anonymous FROM chats
             WHERE account_id = ? AND address = ? AND chat_type = ?",
        )
        .bind(account.0)
        .bind(address.as_str())
        .bind(chat_type_to_str(chat_type))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ChatIdentifier {
            id: ChatId(r.get::<i64, _>(0)),
            account,
            address: address.clone(),
            chat_type,
            members_only_non_anonymous: r.get::<bool, _>(1),
        }))
    }

    /// Trust bookkeeping fed by room configuration discovery: only rooms
    /// that are members-only and non-anonymous allow pinning occupants to
    /// stable addresses.
    pub async fn set_members_only_non_anonymous(
        &self,
        account: AccountId,
        address: &BareAddress,
        value: bool,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE chats SET members_only_non_anonymous = ? WHERE account_id = ? AND address = ?",
        )
        .bind(value)
        .bind(account.0)
        .bind(address.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Derives which page queries must run next for an archive and closes
    /// the open live page, freezing the anchors until a page result is
    /// submitted: live messages arriving from here on no longer move the
    /// ranges, so in-flight queries stay stable.
    pub async fn reset_live_page(
        &self,
        account: AccountId,
        archive: &BareAddress,
    ) -> Result<Vec<Range>> {
        let oldest = self.oldest_anchor(account, archive).await?;
        let newest = self.newest_page_end(account, archive).await?;
        let reverse_complete = self.reverse_complete(account, archive).await?;

        self.close_live_page(account, archive).await?;

        let mut ranges = Vec::new();
        if oldest.is_none() && newest.is_none() {
            if !reverse_complete {
                ranges.push(Range::reverse(None));
            }
            return Ok(ranges);
        }
        if !reverse_complete {
            ranges.push(Range::reverse(oldest));
        }
        if let Some(newest) = newest {
            ranges.push(Range::normal(Some(newest)));
        }
        Ok(ranges)
    }

    /// Applies one executed page query. Submissions for ranges that are no
    /// longer active are ignored; replays never move an anchor backward or
    /// clear reverse-complete. Completing a normal page reopens the live
    /// page and folds in messages that arrived while queries were running.
    pub async fn submit_page(
        &self,
        account: AccountId,
        archive: &BareAddress,
        range: &Range,
        query_result: &QueryResult,
        is_catchup: bool,
    ) -> Result<()> {
        let active = self.active_ranges(account, archive).await?;
        if !active.contains(range) {
            debug!(archive = %archive, ?range, "ignoring page submission for retired range");
            return Ok(());
        }
        match range.direction {
            Direction::Reverse => {
                // the oldest anchor moves via the page's stored messages;
                // only exhaustion of the archive tail is worth remembering
                if query_result.is_complete {
                    sqlx::query(
                        "INSERT INTO archives (account_id, archive, reverse_complete)
                         VALUES (?, ?, 1)
                         ON CONFLICT(account_id, archive) DO UPDATE SET reverse_complete = 1",
                    )
                    .bind(account.0)
                    .bind(archive.as_str())
                    .execute(&self.pool)
                    .await?;
                }
            }
            Direction::Normal => {
                if let (Some(first), Some(last)) =
                    (&query_result.page.first_id, &query_result.page.last_id)
                {
                    sqlx::query(
                        "INSERT OR IGNORE INTO archive_pages
                             (account_id, archive, first_id, last_id, live, received_at)
                         VALUES (?, ?, ?, ?, 0, ?)",
                    )
                    .bind(account.0)
                    .bind(archive.as_str())
                    .bind(first)
                    .bind(last)
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await?;
                }
                self.close_live_page(account, archive).await?;
                if query_result.is_complete {
                    self.reopen_live_page(account, archive).await?;
                }
            }
        }
        if is_catchup && query_result.is_complete {
            debug!(archive = %archive, "archive caught up to live");
        }
        Ok(())
    }

    /// Wipes the local message set for one archive, including page records
    /// and the reverse-complete flag. Chats are kept.
    pub async fn clear_archive(&self, account: AccountId, archive: &BareAddress) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        const SELECT_MESSAGES: &str = "SELECT m.id FROM messages m
             JOIN chats c ON c.id = m.chat_id
             WHERE c.account_id = ?1 AND (m.archive = ?2 OR c.address = ?2)";

        let message_ids: Vec<i64> = sqlx::query_scalar(SELECT_MESSAGES)
            .bind(account.0)
            .bind(archive.as_str())
            .fetch_all(&mut *tx)
            .await?;

        for message_id in &message_ids {
            sqlx::query(
                "UPDATE messages SET in_reply_to_message_id = NULL
                 WHERE in_reply_to_message_id = ?",
            )
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE messages SET latest_version_id = NULL WHERE id = ?")
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "DELETE FROM message_contents WHERE version_id IN
                 (SELECT id FROM message_versions WHERE message_id = ?)",
            )
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "DELETE FROM message_states WHERE version_id IN
                 (SELECT id FROM message_versions WHERE message_id = ?)",
            )
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM message_reactions WHERE message_id = ?")
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM message_versions WHERE message_id = ?")
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM archive_pages WHERE account_id = ? AND archive = ?")
            .bind(account.0)
            .bind(archive.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM archives WHERE account_id = ? AND archive = ?")
            .bind(account.0)
            .bind(archive.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Opens a transactional writer; every mutation of one transformation
    /// goes through a single writer and commits atomically.
    pub async fn writer(&self) -> Result<MessageWriter<'static>, StoreError> {
        Ok(MessageWriter {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn get_message_with_contents(
        &self,
        message: MessageId,
    ) -> Result<Option<MessageWithContents>> {
        let row = sqlx::query(
            "SELECT m.id, m.from_bare, m.from_resource, m.sender_key, m.received_at,
                    m.latest_version_id, v.modification, m.in_reply_to_id,
                    m.in_reply_to_message_id, m.fallback_start, m.fallback_end
             FROM messages m
             JOIN message_versions v ON v.id = m.latest_version_id
             WHERE m.id = ?",
        )
        .bind(message.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let latest_version = VersionId(row.get::<i64, _>(5));
        let contents = sqlx::query(
            "SELECT part_type, language, body, url, size
             FROM message_contents WHERE version_id = ? ORDER BY seq ASC",
        )
        .bind(latest_version.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| MessageContent {
            part_type: part_type_from_str(&r.get::<String, _>(0)),
            language: r.get::<Option<String>, _>(1),
            body: r.get::<Option<String>, _>(2),
            url: r.get::<Option<String>, _>(3),
            size: r.get::<Option<i64>, _>(4),
        })
        .collect();

        let reactions = sqlx::query(
            "SELECT reaction_by, reaction_by_resource, occupant_id, reaction
             FROM message_reactions WHERE message_id = ? ORDER BY id ASC",
        )
        .bind(message.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| MessageReaction {
            reaction_by: r.get::<Option<String>, _>(0).map(BareAddress::new),
            reaction_by_resource: r.get::<Option<String>, _>(1),
            occupant_id: r.get::<Option<String>, _>(2),
            reaction: r.get::<String, _>(3),
        })
        .collect();

        let fallback_span = match (
            row.get::<Option<i64>, _>(9),
            row.get::<Option<i64>, _>(10),
        ) {
            (Some(start), Some(end)) => Some((start as u32, end as u32)),
            _ => None,
        };

        Ok(Some(MessageWithContents {
            id: MessageId(row.get::<i64, _>(0)),
            from_bare: row.get::<Option<String>, _>(1).map(BareAddress::new),
            from_resource: row.get::<Option<String>, _>(2),
            sender_key: row.get::<String, _>(3),
            sent_at: row.get::<DateTime<Utc>, _>(4),
            latest_version,
            modification: modification_from_str(&row.get::<String, _>(6)),
            contents,
            reactions,
            in_reply_to_id: row.get::<Option<String>, _>(7),
            in_reply_to_message: row.get::<Option<i64>, _>(8).map(MessageId),
            fallback_span,
        }))
    }

    /// The chat log as a view adapter consumes it: oldest first, with a
    /// day separator in front of every date change.
    pub async fn list_chat_log(&self, chat: ChatId, limit: u32) -> Result<Vec<ChatLogItem>> {
        let mut ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM messages
             WHERE chat_id = ? AND latest_version_id IS NOT NULL
             ORDER BY received_at DESC, id DESC
             LIMIT ?",
        )
        .bind(chat.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        ids.reverse();

        let mut items = Vec::new();
        let mut current_day: Option<NaiveDate> = None;
        for id in ids {
            let Some(message) = self.get_message_with_contents(MessageId(id)).await? else {
                continue;
            };
            let day = message.sent_at.date_naive();
            if current_day != Some(day) {
                items.push(ChatLogItem::DateSeparator(day));
                current_day = Some(day);
            }
            items.push(ChatLogItem::Message(message));
        }
        Ok(items)
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let messages = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        let versions = sqlx::query_scalar("SELECT COUNT(*) FROM message_versions")
            .fetch_one(&self.pool)
            .await?;
        let contents = sqlx::query_scalar("SELECT COUNT(*) FROM message_contents")
            .fetch_one(&self.pool)
            .await?;
        let states = sqlx::query_scalar("SELECT COUNT(*) FROM message_states")
            .fetch_one(&self.pool)
            .await?;
        let reactions = sqlx::query_scalar("SELECT COUNT(*) FROM message_reactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreCounts {
            messages,
            versions,
            contents,
            states,
            reactions,
        })
    }

    /// The ranges a page submission may legitimately answer. For the
    /// reverse direction both the page-derived and the message-derived
    /// oldest anchor are acceptable, since applying a reverse page's own
    /// messages moves the latter before the submission arrives.
    async fn active_ranges(
        &self,
        account: AccountId,
        archive: &BareAddress,
    ) -> Result<Vec<Range>> {
        let mut ranges = Vec::new();
        if !self.reverse_complete(account, archive).await? {
            let from_messages = self.oldest_message_anchor(account, archive).await?;
            let from_pages = self.oldest_page_start(account, archive).await?;
            ranges.push(Range::reverse(from_messages.clone()));
            if from_pages.is_some() && from_pages != from_messages {
                ranges.push(Range::reverse(from_pages));
            }
            // an initial tail-backward query stays answerable until a
            // query round actually closed a page
            let closed_pages: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM archive_pages
                 WHERE account_id = ? AND archive = ? AND live = 0",
            )
            .bind(account.0)
            .bind(archive.as_str())
            .fetch_one(&self.pool)
            .await?;
            if from_messages.is_some() && closed_pages == 0 {
                ranges.push(Range::reverse(None));
            }
        }
        if let Some(newest) = self.newest_page_end(account, archive).await? {
            ranges.push(Range::normal(Some(newest)));
        }
        Ok(ranges)
    }

    async fn oldest_anchor(
        &self,
        account: AccountId,
        archive: &BareAddress,
    ) -> Result<Option<String>> {
        if let Some(anchor) = self.oldest_message_anchor(account, archive).await? {
            return Ok(Some(anchor));
        }
        self.oldest_page_start(account, archive).await
    }

    async fn oldest_message_anchor(
        &self,
        account: AccountId,
        archive: &BareAddress,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT m.stanza_id FROM messages m
             JOIN chats c ON c.id = m.chat_id
             WHERE c.account_id = ? AND m.archive = ? AND m.stanza_id IS NOT NULL
             ORDER BY m.received_at ASC, m.id ASC
             LIMIT 1",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn oldest_page_start(
        &self,
        account: AccountId,
        archive: &BareAddress,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT first_id FROM archive_pages
             WHERE account_id = ? AND archive = ? AND first_id IS NOT NULL
             ORDER BY id ASC
             LIMIT 1",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn newest_page_end(
        &self,
        account: AccountId,
        archive: &BareAddress,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT last_id FROM archive_pages
             WHERE account_id = ? AND archive = ? AND last_id IS NOT NULL
             ORDER BY id DESC
             LIMIT 1",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn close_live_page(&self, account: AccountId, archive: &BareAddress) -> Result<()> {
        let result = sqlx::query(
            "UPDATE archive_pages SET live = 0
             WHERE account_id = ? AND archive = ? AND live = 1",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            self.update_live_watermark(account, archive).await?;
        }
        Ok(())
    }

    /// Opens a fresh live page once a normal query round completed,
    /// seeded with the archive ids of messages that were ingested live
    /// while the round was in flight.
    async fn reopen_live_page(&self, account: AccountId, archive: &BareAddress) -> Result<()> {
        let watermark: i64 = sqlx::query_scalar(
            "SELECT live_watermark FROM archives WHERE account_id = ? AND archive = ?",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        let seeds: Vec<String> = sqlx::query_scalar(
            "SELECT m.stanza_id FROM messages m
             JOIN chats c ON c.id = m.chat_id
             WHERE c.account_id = ? AND m.archive = ? AND m.stanza_id IS NOT NULL AND m.id > ?
             ORDER BY m.id ASC",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .bind(watermark)
        .fetch_all(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO archive_pages (account_id, archive, first_id, last_id, live, received_at)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .bind(seeds.first())
        .bind(seeds.last())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.update_live_watermark(account, archive).await
    }

    async fn update_live_watermark(&self, account: AccountId, archive: &BareAddress) -> Result<()> {
        sqlx::query(
            "INSERT INTO archives (account_id, archive, live_watermark)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(m.id), 0) FROM messages m
                              JOIN chats c ON c.id = m.chat_id
                              WHERE c.account_id = ?1 AND m.archive = ?2))
             ON CONFLICT(account_id, archive)
             DO UPDATE SET live_watermark = excluded.live_watermark",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reverse_complete(&self, account: AccountId, archive: &BareAddress) -> Result<bool> {
        let row = sqlx::query(
            "SELECT reverse_complete FROM archives WHERE account_id = ? AND archive = ?",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<bool, _>(0)).unwrap_or(false))
    }
}

/// Transactional store access for one transformation. Every lookup is a
/// natural-key get-or-create: either the key resolves to the existing row
/// or the insert loses the unique-constraint race and re-reads.
pub struct MessageWriter<'c> {
    tx: Transaction<'c, Sqlite>,
}

impl MessageWriter<'_> {
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    pub async fn get_or_create_chat(
        &mut self,
        account: AccountId,
        remote: &BareAddress,
        message_type: MessageType,
        has_muc_user: bool,
    ) -> Result<ChatIdentifier, StoreError> {
        let chat_type = ChatType::of(message_type, has_muc_user);
        let row = sqlx::query(
            "INSERT INTO chats (account_id, address, chat_type) VALUES (?, ?, ?)
             ON CONFLICT(account_id, address, chat_type) DO UPDATE SET address=excluded.address
             RETURNING id, members_only_non_anonymous",
        )
        .bind(account.0)
        .bind(remote.as_str())
        .bind(chat_type_to_str(chat_type))
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(ChatIdentifier {
            id: ChatId(row.get::<i64, _>(0)),
            account,
            address: remote.clone(),
            chat_type,
            members_only_non_anonymous: row.get::<bool, _>(1),
        })
    }

    /// Resolves a transformation to its message identity, creating the
    /// message and its original version when the natural key is new.
    pub async fn get_or_create_message(
        &mut self,
        chat: &ChatIdentifier,
        transformation: &Transformation,
        sender_key: &str,
    ) -> Result<MessageIdentifier, StoreError> {
        if let Some(existing) = self.find_message(chat.id, transformation, sender_key).await? {
            return Ok(existing);
        }
        match self.insert_message(chat, transformation, sender_key).await {
            Ok(identifier) => Ok(identifier),
            Err(StoreError::Database(error)) if is_unique_violation(&error) => {
                // lost the natural-key race; the winner's row is visible now
                self.find_message(chat.id, transformation, sender_key)
                    .await?
                    .ok_or(StoreError::Conflict)
            }
            Err(error) => Err(error),
        }
    }

    /// Resolves the target of a correction or retraction and attaches a
    /// new content version to it. An unknown target is created as a stub
    /// under the target id, so an edit arriving before its original merges
    /// once the original lands. Replays of the same modifying event
    /// resolve to the already-created version.
    pub async fn get_or_create_version(
        &mut self,
        chat: &ChatIdentifier,
        transformation: &Transformation,
        target_id: &str,
        modification: Modification,
        sender_key: &str,
    ) -> Result<MessageIdentifier, StoreError> {
        let message = match self
            .find_target_message(chat.id, target_id, Some(sender_key))
            .await?
        {
            Some(message) => message,
            None => {
                self.insert_target_stub(chat, transformation, target_id, sender_key)
                    .await?
            }
        };
        let version_id = transformation.message_id.as_deref();
        if let Some(version) = self.find_version(message, modification, version_id).await? {
            return Ok(MessageIdentifier {
                id: message,
                version,
            });
        }
        match self
            .insert_version(message, modification, version_id, transformation.received_at)
            .await
        {
            Ok(version) => Ok(MessageIdentifier {
                id: message,
                version,
            }),
            Err(StoreError::Database(error)) if is_unique_violation(&error) => self
                .find_version(message, modification, version_id)
                .await?
                .map(|version| MessageIdentifier {
                    id: message,
                    version,
                })
                .ok_or(StoreError::Conflict),
            Err(error) => Err(error),
        }
    }

    /// Inserts the parsed parts under a version. A version that already
    /// carries parts keeps them untouched; replays change nothing.
    pub async fn insert_message_content(
        &mut self,
        identifier: &MessageIdentifier,
        contents: &[MessageContent],
    ) -> Result<(), StoreError> {
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message_contents WHERE version_id = ?")
                .bind(identifier.version.0)
                .fetch_one(&mut *self.tx)
                .await?;
        if existing > 0 {
            return Ok(());
        }
        for (seq, content) in contents.iter().enumerate() {
            sqlx::query(
                "INSERT INTO message_contents (version_id, seq, part_type, language, body, url, size)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(identifier.version.0)
            .bind(seq as i64)
            .bind(part_type_to_str(content.part_type))
            .bind(content.language.as_deref())
            .bind(content.body.as_deref())
            .bind(content.url.as_deref())
            .bind(content.size)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    /// Leaves a delivery/read/error marker on the referenced message's
    /// current version. Unknown targets are dropped. Returns whether a
    /// marker was actually new.
    pub async fn insert_message_state(
        &mut self,
        chat: &ChatIdentifier,
        target_id: &str,
        state: &MessageState,
    ) -> Result<bool, StoreError> {
        let Some(message) = self.find_target_message(chat.id, target_id, None).await? else {
            debug!(target_id, "dropping state for unknown message");
            return Ok(false);
        };
        let Some(version) = self.latest_version(message).await? else {
            return Ok(false);
        };
        let result = sqlx::query(
            "INSERT INTO message_states (version_id, from_bare, from_resource, state, error_condition, error_text)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(version_id, from_bare, from_resource, state) DO NOTHING",
        )
        .bind(version.0)
        .bind(state.from_bare.as_str())
        .bind(state.from_resource.as_deref().unwrap_or(""))
        .bind(state_kind_to_str(state.kind))
        .bind(state.error_condition.as_deref())
        .bind(state.error_text.as_deref())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replaces one sender's reaction set on the referenced message.
    /// Unknown targets are dropped.
    pub async fn insert_reactions(
        &mut self,
        chat: &ChatIdentifier,
        payload: &ReactionsPayload,
        transformation: &Transformation,
        sender_key: &str,
    ) -> Result<(), StoreError> {
        let Some(message) = self.find_target_message(chat.id, &payload.id, None).await? else {
            debug!(target_id = %payload.id, "dropping reactions for unknown message");
            return Ok(());
        };
        sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND sender_key = ?")
            .bind(message.0)
            .bind(sender_key)
            .execute(&mut *self.tx)
            .await?;
        for reaction in &payload.reactions {
            sqlx::query(
                "INSERT INTO message_reactions (message_id, sender_key, reaction_by, reaction_by_resource, occupant_id, reaction)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(message_id, sender_key, reaction) DO NOTHING",
            )
            .bind(message.0)
            .bind(sender_key)
            .bind(transformation.sender_identity.as_ref().map(BareAddress::as_str))
            .bind(transformation.from_resource())
            .bind(transformation.occupant_id.as_deref())
            .bind(reaction)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    /// Extends the open live page with the archive id of a message that
    /// arrived via live push. While a query round is in flight (the live
    /// page is closed) the id is left for the round's completion to
    /// reconcile, so in-flight ranges do not move underneath the caller.
    pub async fn record_live_anchor(
        &mut self,
        account: AccountId,
        archive: &BareAddress,
        stanza_id: &str,
    ) -> Result<(), StoreError> {
        let extended = sqlx::query(
            "UPDATE archive_pages SET first_id = COALESCE(first_id, ?3), last_id = ?3
             WHERE account_id = ?1 AND archive = ?2 AND live = 1",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .bind(stanza_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        if extended > 0 {
            return Ok(());
        }
        let pages: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM archive_pages WHERE account_id = ? AND archive = ?",
        )
        .bind(account.0)
        .bind(archive.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        if pages == 0 {
            sqlx::query(
                "INSERT INTO archive_pages (account_id, archive, first_id, last_id, live, received_at)
                 VALUES (?1, ?2, ?3, ?3, 1, ?4)",
            )
            .bind(account.0)
            .bind(archive.as_str())
            .bind(stanza_id)
            .bind(Utc::now())
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    /// Links a message to the message it quotes. The raw referenced id is
    /// kept even when the target is not locally known yet.
    pub async fn set_in_reply_to(
        &mut self,
        chat: &ChatIdentifier,
        identifier: &MessageIdentifier,
        to: &Address,
        target_id: &str,
        fallback_span: Option<(u32, u32)>,
    ) -> Result<(), StoreError> {
        let target = self.find_target_message(chat.id, target_id, None).await?;
        if target.is_none() {
            debug!(target_id, to = %to, "reply target not stored yet");
        }
        let (start, end) = match fallback_span {
            Some((start, end)) => (Some(start as i64), Some(end as i64)),
            None => (None, None),
        };
        sqlx::query(
            "UPDATE messages SET in_reply_to_id = ?, in_reply_to_message_id = ?,
                    fallback_start = ?, fallback_end = ?
             WHERE id = ?",
        )
        .bind(target_id)
        .bind(target.map(|message| message.0))
        .bind(start)
        .bind(end)
        .bind(identifier.id.0)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_message(
        &mut self,
        chat: ChatId,
        transformation: &Transformation,
        sender_key: &str,
    ) -> Result<Option<MessageIdentifier>, StoreError> {
        let stanza_id = transformation.stanza_id.as_ref().map(|s| s.id.as_str());
        let message_id = transformation.message_id.as_deref();
        if stanza_id.is_none() && message_id.is_none() {
            return Ok(None);
        }
        let rows = sqlx::query(
            "SELECT id, latest_version_id, stanza_id FROM messages
             WHERE chat_id = ?1 AND sender_key = ?2
               AND ((?3 IS NOT NULL AND stanza_id = ?3)
                 OR (?4 IS NOT NULL AND message_id = ?4))",
        )
        .bind(chat.0)
        .bind(sender_key)
        .bind(stanza_id)
        .bind(message_id)
        .fetch_all(&mut *self.tx)
        .await?;
        if rows.len() > 1 {
            return Err(StoreError::Conflict);
        }
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let id = MessageId(row.get::<i64, _>(0));
        let Some(version) = row.get::<Option<i64>, _>(1) else {
            return Err(StoreError::Conflict);
        };
        if row.get::<Option<String>, _>(2).is_none() {
            if let Some(stanza) = &transformation.stanza_id {
                // archive replay of a message first seen live: remember the
                // archive id it was assigned
                if let Err(error) =
                    sqlx::query("UPDATE messages SET stanza_id = ?, archive = ? WHERE id = ?")
                        .bind(&stanza.id)
                        .bind(stanza.by.as_str())
                        .bind(id.0)
                        .execute(&mut *self.tx)
                        .await
                {
                    if is_unique_violation(&error) {
                        return Err(StoreError::Conflict);
                    }
                    return Err(error.into());
                }
            }
        }
        Ok(Some(MessageIdentifier {
            id,
            version: VersionId(version),
        }))
    }

    async fn insert_message(
        &mut self,
        chat: &ChatIdentifier,
        transformation: &Transformation,
        sender_key: &str,
    ) -> Result<MessageIdentifier, StoreError> {
        let row = sqlx::query(
            "INSERT INTO messages (chat_id, received_at, outgoing, to_bare, to_resource,
                                   from_bare, from_resource, sender_key, occupant_id,
                                   message_id, stanza_id, archive)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(chat.id.0)
        .bind(transformation.received_at)
        .bind(transformation.outgoing())
        .bind(transformation.to_bare().map(|bare| bare.0))
        .bind(transformation.to.as_ref().and_then(|to| to.resource.clone()))
        .bind(transformation.from_bare().map(|bare| bare.0))
        .bind(transformation.from_resource())
        .bind(sender_key)
        .bind(transformation.occupant_id.as_deref())
        .bind(transformation.message_id.as_deref())
        .bind(transformation.stanza_id.as_ref().map(|s| s.id.as_str()))
        .bind(transformation.stanza_id.as_ref().map(|s| s.by.as_str()))
        .fetch_one(&mut *self.tx)
        .await?;
        let message = MessageId(row.get::<i64, _>(0));
        let version = self
            .insert_version(
                message,
                Modification::Original,
                transformation.message_id.as_deref(),
                transformation.received_at,
            )
            .await?;
        Ok(MessageIdentifier {
            id: message,
            version,
        })
    }

    async fn insert_target_stub(
        &mut self,
        chat: &ChatIdentifier,
        transformation: &Transformation,
        target_id: &str,
        sender_key: &str,
    ) -> Result<MessageId, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO messages (chat_id, received_at, outgoing, to_bare, from_bare,
                                   from_resource, sender_key, occupant_id, message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(chat.id.0)
        .bind(transformation.received_at)
        .bind(transformation.outgoing())
        .bind(transformation.to_bare().map(|bare| bare.0))
        .bind(transformation.from_bare().map(|bare| bare.0))
        .bind(transformation.from_resource())
        .bind(sender_key)
        .bind(transformation.occupant_id.as_deref())
        .bind(target_id)
        .fetch_one(&mut *self.tx)
        .await;
        match inserted {
            Ok(row) => Ok(MessageId(row.get::<i64, _>(0))),
            Err(error) if is_unique_violation(&error) => self
                .find_target_message(chat.id, target_id, Some(sender_key))
                .await?
                .ok_or(StoreError::Conflict),
            Err(error) => Err(error.into()),
        }
    }

    async fn find_target_message(
        &mut self,
        chat: ChatId,
        target_id: &str,
        sender_key: Option<&str>,
    ) -> Result<Option<MessageId>, StoreError> {
        let row = match sender_key {
            Some(sender_key) => {
                sqlx::query(
                    "SELECT id FROM messages
                     WHERE chat_id = ?1 AND sender_key = ?2
                       AND (message_id = ?3 OR stanza_id = ?3)
                     ORDER BY id DESC LIMIT 1",
                )
                .bind(chat.0)
                .bind(sender_key)
                .bind(target_id)
                .fetch_optional(&mut *self.tx)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id FROM messages
                     WHERE chat_id = ?1 AND (message_id = ?2 OR stanza_id = ?2)
                     ORDER BY id DESC LIMIT 1",
                )
                .bind(chat.0)
                .bind(target_id)
                .fetch_optional(&mut *self.tx)
                .await?
            }
        };
        Ok(row.map(|r| MessageId(r.get::<i64, _>(0))))
    }

    async fn find_version(
        &mut self,
        message: MessageId,
        modification: Modification,
        version_id: Option<&str>,
    ) -> Result<Option<VersionId>, StoreError> {
        let row = match version_id {
            Some(version_id) => {
                sqlx::query("SELECT id FROM message_versions WHERE message_id = ? AND version_id = ?")
                    .bind(message.0)
                    .bind(version_id)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
            None => {
                sqlx::query(
                    "SELECT id FROM message_versions
                     WHERE message_id = ? AND version_id IS NULL AND modification = ?",
                )
                .bind(message.0)
                .bind(modification_to_str(modification))
                .fetch_optional(&mut *self.tx)
                .await?
            }
        };
        Ok(row.map(|r| VersionId(r.get::<i64, _>(0))))
    }

    async fn insert_version(
        &mut self,
        message: MessageId,
        modification: Modification,
        version_id: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> Result<VersionId, StoreError> {
        let row = sqlx::query(
            "INSERT INTO message_versions (message_id, modification, version_id, received_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.0)
        .bind(modification_to_str(modification))
        .bind(version_id)
        .bind(received_at)
        .fetch_one(&mut *self.tx)
        .await?;
        let version = VersionId(row.get::<i64, _>(0));
        sqlx::query("UPDATE messages SET latest_version_id = ? WHERE id = ?")
            .bind(version.0)
            .bind(message.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(version)
    }

    async fn latest_version(&mut self, message: MessageId) -> Result<Option<VersionId>, StoreError> {
        let row = sqlx::query("SELECT latest_version_id FROM messages WHERE id = ?")
            .bind(message.0)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<i64>, _>(0))
            .map(VersionId))
    }
}

fn chat_type_to_str(chat_type: ChatType) -> &'static str {
    match chat_type {
        ChatType::Individual => "individual",
        ChatType::Group => "group",
        ChatType::GroupPrivateMessage => "group_private_message",
        ChatType::Broadcast => "broadcast",
    }
}

fn modification_to_str(modification: Modification) -> &'static str {
    match modification {
        Modification::Original => "original",
        Modification::Correction => "correction",
        Modification::Retraction => "retraction",
    }
}

fn modification_from_str(value: &str) -> Modification {
    match value {
        "correction" => Modification::Correction,
        "retraction" => Modification::Retraction,
        _ => Modification::Original,
    }
}

fn part_type_to_str(part_type: PartType) -> &'static str {
    match part_type {
        PartType::Text => "text",
        PartType::File => "file",
        PartType::Retraction => "retraction",
        PartType::AudioCall => "audio_call",
        PartType::VideoCall => "video_call",
    }
}

fn part_type_from_str(value: &str) -> PartType {
    match value {
        "file" => PartType::File,
        "retraction" => PartType::Retraction,
        "audio_call" => PartType::AudioCall,
        "video_call" => PartType::VideoCall,
        _ => PartType::Text,
    }
}

fn state_kind_to_str(kind: StateKind) -> &'static str {
    match kind {
        StateKind::Delivered => "delivered",
        StateKind::Displayed => "displayed",
        StateKind::Error => "error",
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
