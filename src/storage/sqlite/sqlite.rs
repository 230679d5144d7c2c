#[cfg(test)]
#[path = "sqlite_test.rs"]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use tokio_rusqlite::{
    Connection, OpenFlags, OptionalExtension, ToSql, named_params, params,
};

use crate::models::session::next_timestamp;
use crate::models::{FilterSession, Message, MessageStatus, Session};
use crate::storage::Storage;

use super::migration::MIGRATION;

pub struct Sqlite {
    conn: Connection,
}

impl Sqlite {
    pub async fn new(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
            .await
            .wrap_err(format!("opening database path: {}", path))?,
            None => Connection::open_in_memory()
                .await
                .wrap_err("opening in-memory database")?,
        };

        let ret = Self { conn };
        ret.run_migration().await.wrap_err("running migration")?;
        Ok(ret)
    }

    async fn run_migration(&self) -> Result<()> {
        self.conn
            .call(|conn| Ok(conn.execute_batch(MIGRATION)?))
            .await
            .wrap_err("executing migration")?;
        Ok(())
    }
}

#[async_trait]
impl Storage for Sqlite {
    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let mut sessions = self
            .get_sessions(FilterSession::default().with_id(id))
            .await
            .wrap_err("getting session")?;
        Ok(sessions.pop())
    }

    async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let session_id = session_id.to_string();
        let messages = self
            .conn
            .call(move |conn| read_messages(conn, &session_id))
            .await?;
        Ok(messages)
    }

    /// Sessions and their messages are read in one transaction so a
    /// concurrent commit is either fully visible or not at all.
    async fn get_sessions(&self, filter: FilterSession) -> Result<Vec<Session>> {
        let sessions = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut sessions = {
                    let (query, params) = filter_to_query(&filter);
                    let mut stmt = tx.prepare(&query)?;
                    let params: Vec<(&str, &dyn ToSql)> =
                        params.iter().map(|(n, v)| (*n, v.as_ref())).collect();
                    let mut rows = stmt.query(params.as_slice())?;

                    let mut sessions = vec![];
                    while let Some(row) = rows.next()? {
                        let id: String = row.get(0)?;
                        let owner: String = row.get(1)?;
                        let title: Option<String> = row.get(2)?;
                        let created_at = from_millis(row.get(3)?, "created_at")?;
                        let updated_at = from_millis(row.get(4)?, "updated_at")?;

                        let mut session = Session::new(owner)
                            .with_id(id)
                            .with_created_at(created_at)
                            .with_updated_at(updated_at);
                        if let Some(title) = title {
                            session = session.with_title(title);
                        }
                        sessions.push(session);
                    }
                    sessions
                };

                for session in &mut sessions {
                    let messages = read_messages(&tx, session.id())?;
                    session.messages_mut().extend(messages);
                }
                tx.commit()?;
                Ok(sessions)
            })
            .await?;
        Ok(sessions)
    }

    async fn upsert_session(&self, session: Session) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"INSERT INTO sessions (id, owner, title, created_at, updated_at)
                VALUES (:id, :owner, :title, :created_at, :updated_at)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    updated_at = excluded.updated_at
                "#,
                    named_params! {
                        ":id": session.id(),
                        ":owner": session.owner(),
                        ":title": session.title(),
                        ":created_at": session.created_at().timestamp_millis(),
                        ":updated_at": session.updated_at().timestamp_millis(),
                    },
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let affected_rows = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM messages WHERE session_id = ?", params![id])?;
                let affected_rows = tx.execute("DELETE FROM sessions WHERE id = ?", params![id])?;
                tx.commit()?;
                Ok(affected_rows)
            })
            .await?;
        Ok(affected_rows > 0)
    }

    async fn commit_message(
        &self,
        session_id: &str,
        message: Message,
        title: Option<String>,
    ) -> Result<bool> {
        let session_id = session_id.to_string();
        let committed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let updated_at: Option<i64> = tx
                    .query_row(
                        "SELECT updated_at FROM sessions WHERE id = ?",
                        params![session_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(updated_at) = updated_at else {
                    return Ok(false);
                };

                let last_idx: usize = tx.query_row(
                    "SELECT COALESCE(MAX(message_idx), 0) FROM messages WHERE session_id = ?",
                    params![session_id],
                    |row| row.get(0),
                )?;
                let idx = message.message_idx();
                if idx != last_idx && idx != last_idx + 1 {
                    return Err(tokio_rusqlite::Error::Other(
                        eyre::eyre!(
                            "message {} cannot be committed after message {}",
                            idx,
                            last_idx
                        )
                        .into(),
                    ));
                }

                tx.execute(
                    r#"INSERT INTO messages (session_id, message_idx, content, model_id, answer, failed, created_at, updated_at)
            VALUES (:session_id, :message_idx, :content, :model_id, :answer, :failed, :created_at, :updated_at)
            ON CONFLICT(session_id, message_idx) DO UPDATE SET
                content = excluded.content,
                model_id = excluded.model_id,
                answer = excluded.answer,
                failed = excluded.failed,
                updated_at = excluded.updated_at
            "#,
                    named_params! {
                        ":session_id": session_id,
                        ":message_idx": idx,
                        ":content": message.content(),
                        ":model_id": message.model_id(),
                        ":answer": message.answer(),
                        ":failed": message.is_failed() as i32,
                        ":created_at": message.created_at().timestamp_millis(),
                        ":updated_at": message.updated_at().timestamp_millis(),
                    },
                )?;

                let prev = from_millis(updated_at, "updated_at")?;
                let session_updated_at = next_timestamp(prev).max(message.updated_at());
                tx.execute(
                    "UPDATE sessions SET updated_at = :updated_at, title = COALESCE(title, :title) WHERE id = :id",
                    named_params! {
                        ":updated_at": session_updated_at.timestamp_millis(),
                        ":title": title,
                        ":id": session_id,
                    },
                )?;

                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(committed)
    }

    async fn delete_last_message(&self, session_id: &str) -> Result<Option<Message>> {
        let session_id = session_id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(last) = read_messages(&tx, &session_id)?.pop() else {
                    return Ok(None);
                };

                tx.execute(
                    "DELETE FROM messages WHERE session_id = ? AND message_idx = ?",
                    params![session_id, last.message_idx()],
                )?;
                let updated_at: i64 = tx.query_row(
                    "SELECT updated_at FROM sessions WHERE id = ?",
                    params![session_id],
                    |row| row.get(0),
                )?;
                let updated_at = next_timestamp(from_millis(updated_at, "updated_at")?);
                tx.execute(
                    "UPDATE sessions SET updated_at = ? WHERE id = ?",
                    params![updated_at.timestamp_millis(), session_id],
                )?;
                tx.commit()?;
                Ok(Some(last))
            })
            .await?;
        Ok(deleted)
    }
}

fn read_messages(
    conn: &rusqlite::Connection,
    session_id: &str,
) -> Result<Vec<Message>, tokio_rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT message_idx, content, model_id, answer, failed, created_at, updated_at FROM messages WHERE session_id = ? ORDER BY message_idx",
    )?;

    let mut rows = stmt.query(params![session_id])?;
    let mut messages = vec![];
    while let Some(row) = rows.next()? {
        let message_idx: usize = row.get(0)?;
        let content: String = row.get(1)?;
        let model_id: String = row.get(2)?;
        let answer: Option<String> = row.get(3)?;
        let failed: i32 = row.get(4)?;
        let created_at = from_millis(row.get(5)?, "created_at")?;
        let updated_at = from_millis(row.get(6)?, "updated_at")?;

        let status = if failed == 1 {
            MessageStatus::Failed
        } else {
            MessageStatus::Committed
        };

        let mut message = Message::new(message_idx, content, model_id)
            .with_status(status)
            .with_created_at(created_at)
            .with_updated_at(updated_at);
        message.set_answer(answer);
        messages.push(message);
    }
    Ok(messages)
}

fn from_millis(millis: i64, column: &str) -> Result<DateTime<Utc>, tokio_rusqlite::Error> {
    DateTime::from_timestamp_millis(millis).ok_or(tokio_rusqlite::Error::Other(
        eyre::eyre!("invalid {}", column).into(),
    ))
}

fn filter_to_query(filter: &FilterSession) -> (String, Vec<(&str, Box<dyn ToSql>)>) {
    let mut query =
        String::from("SELECT id, owner, title, created_at, updated_at FROM sessions WHERE 1=1");
    let mut params: Vec<(&str, Box<dyn ToSql>)> = vec![];

    if let Some(id) = filter.id() {
        query.push_str(" AND id = :id");
        params.push((":id", Box::new(id.to_string())));
    }

    if let Some(owner) = filter.owner() {
        query.push_str(" AND owner = :owner");
        params.push((":owner", Box::new(owner.to_string())));
    }

    if let Some(title) = filter.title() {
        query.push_str(" AND title LIKE :title ESCAPE '\\'");
        params.push((":title", Box::new(like_pattern(title))));
    }

    if let Some(message_contains) = filter.message_contains() {
        query.push_str(" AND EXISTS (SELECT 1 FROM messages WHERE session_id = sessions.id AND content LIKE :message_contains ESCAPE '\\')");
        params.push((":message_contains", Box::new(like_pattern(message_contains))));
    }

    if let Some(from) = filter.updated_at_from() {
        query.push_str(" AND updated_at >= :updated_at_from");
        params.push((":updated_at_from", Box::new(from.timestamp_millis())));
    }

    if let Some(to) = filter.updated_at_to() {
        query.push_str(" AND updated_at <= :updated_at_to");
        params.push((":updated_at_to", Box::new(to.timestamp_millis())));
    }

    query.push_str(" ORDER BY updated_at DESC, id");
    (query, params)
}

/// Substring pattern for `LIKE ... ESCAPE '\'` matching `text` literally.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
