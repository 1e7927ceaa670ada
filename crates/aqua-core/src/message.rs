//! Inter-agent messaging.
//!
//! Delivery is pull-only: a send is a single insert, and addressing is
//! resolved by the reader. The special addresses `@leader` and `@idle` are
//! stored literally and matched against the reader's current standing, so a
//! message to `@leader` follows the lease, not the agent that happened to
//! hold it at send time.
//!
//! `ask`/`reply` layer a blocking request/response on top: the asker polls
//! for a message whose `reply_to` names the request. Polling is the only
//! cross-process wait primitive there is.

use std::time::{Duration, Instant};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::{event, util};

/// Shortest sleep between reply polls.
const POLL_FLOOR: Duration = Duration::from_millis(500);

/// Longest sleep between reply polls.
const POLL_CEILING: Duration = Duration::from_millis(2000);

/// Kind of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain chatter.
    #[default]
    Chat,
    /// A blocking question; the sender polls for a response.
    Request,
    /// The answer to a request, linked via `reply_to`.
    Response,
    /// Kernel-generated notice.
    System,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Request => "request",
            Self::Response => "response",
            Self::System => "system",
        }
    }

    fn parse(text: &str) -> Self {
        match text {
            "request" => Self::Request,
            "response" => Self::Response,
            "system" => Self::System,
            _ => Self::Chat,
        }
    }
}

/// Where a message is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Every agent.
    Broadcast,
    /// One specific agent id.
    Agent(String),
    /// Whoever holds an unexpired leadership lease at read time.
    Leader,
    /// Every agent without a current task at read time.
    Idle,
}

impl Address {
    fn to_column(&self) -> Option<String> {
        match self {
            Self::Broadcast => None,
            Self::Agent(id) => Some(id.clone()),
            Self::Leader => Some("@leader".to_string()),
            Self::Idle => Some("@idle".to_string()),
        }
    }
}

/// A message row.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Monotonic id.
    pub id: i64,
    /// Sender agent id.
    pub from_agent: String,
    /// Raw destination column: agent id, NULL, `@leader`, or `@idle`.
    pub to_agent: Option<String>,
    /// Body.
    pub content: String,
    /// Kind.
    pub message_type: MessageType,
    /// Request this message answers, if it is a response.
    pub reply_to: Option<i64>,
    /// When it was sent.
    pub created_at: String,
    /// When the recipient first read it.
    pub read_at: Option<String>,
}

/// The reader's standing, used to resolve `@leader` and `@idle`.
#[derive(Debug, Clone, Copy)]
pub struct Standing {
    /// Whether the reader holds an unexpired leadership lease.
    pub is_leader: bool,
    /// Whether the reader has no current task.
    pub is_idle: bool,
}

/// Sends a message. Returns the stored row.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn send(
    conn: &Connection,
    from_agent: &str,
    to: &Address,
    content: &str,
    message_type: MessageType,
    reply_to: Option<i64>,
) -> Result<Message> {
    let now = util::now_rfc3339();
    let to_column = to.to_column();
    conn.execute(
        "INSERT INTO messages (from_agent, to_agent, content, message_type, reply_to, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            from_agent,
            to_column,
            content,
            message_type.as_str(),
            reply_to,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();

    event::log(
        conn,
        "message_sent",
        Some(from_agent),
        None,
        Some(serde_json::json!({
            "message_id": id,
            "to": to_column,
            "type": message_type.as_str(),
        })),
    )?;

    Ok(Message {
        id,
        from_agent: from_agent.to_string(),
        to_agent: to_column,
        content: content.to_string(),
        message_type,
        reply_to,
        created_at: now,
        read_at: None,
    })
}

/// Fetches messages addressed to `agent_id` given its standing, newest
/// first, and stamps `read_at` on every returned message that was unread.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn read_inbox(
    conn: &Connection,
    agent_id: &str,
    standing: Standing,
    unread_only: bool,
    limit: u32,
) -> Result<Vec<Message>> {
    let mut sql = String::from(
        "SELECT id, from_agent, to_agent, content, message_type, reply_to, created_at, read_at
         FROM messages
         WHERE (to_agent = ?1 OR to_agent IS NULL
                OR (to_agent = '@leader' AND ?2)
                OR (to_agent = '@idle' AND ?3))",
    );
    if unread_only {
        sql.push_str(" AND read_at IS NULL");
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?4");

    let mut stmt = conn.prepare(&sql)?;
    let messages = stmt
        .query_map(
            params![
                agent_id,
                standing.is_leader,
                standing.is_idle,
                i64::from(limit)
            ],
            row_to_message,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let now = util::now_rfc3339();
    for message in messages.iter().filter(|m| m.read_at.is_none()) {
        conn.execute(
            "UPDATE messages SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
            params![now, message.id],
        )?;
    }

    Ok(messages)
}

/// Counts unread messages addressed to `agent_id` without marking
/// anything read.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn unread_count(conn: &Connection, agent_id: &str, standing: Standing) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE (to_agent = ?1 OR to_agent IS NULL
                OR (to_agent = '@leader' AND ?2)
                OR (to_agent = '@idle' AND ?3))
           AND read_at IS NULL",
        params![agent_id, standing.is_leader, standing.is_idle],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Looks up one message by id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection, message_id: i64) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            "SELECT id, from_agent, to_agent, content, message_type, reply_to, created_at, read_at
             FROM messages WHERE id = ?1",
            params![message_id],
            row_to_message,
        )
        .optional()?)
}

/// Answers a request: inserts a response addressed to the asker with
/// `reply_to` linking back.
///
/// # Errors
///
/// Returns [`Error::MessageNotFound`] when the request id does not exist.
pub fn reply(
    conn: &Connection,
    from_agent: &str,
    request_id: i64,
    content: &str,
) -> Result<Message> {
    let request = get(conn, request_id)?.ok_or(Error::MessageNotFound {
        message_id: request_id,
    })?;

    send(
        conn,
        from_agent,
        &Address::Agent(request.from_agent),
        content,
        MessageType::Response,
        Some(request_id),
    )
}

/// The first response to a request, if one has arrived.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn find_reply(conn: &Connection, request_id: i64) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            "SELECT id, from_agent, to_agent, content, message_type, reply_to, created_at, read_at
             FROM messages WHERE reply_to = ?1 ORDER BY id ASC LIMIT 1",
            params![request_id],
            row_to_message,
        )
        .optional()?)
}

/// Sends a request and blocks until a reply arrives or `timeout` expires.
///
/// Polls with a doubling interval bounded to 500ms..2s. A delivered reply
/// is consumed: it is stamped read so the inbox does not surface it a
/// second time. On timeout the request stays in the store and can still
/// be answered and queried later.
///
/// # Errors
///
/// Returns [`Error::Timeout`] when no reply arrives in time.
pub fn ask(
    store: &Store,
    from_agent: &str,
    to: &Address,
    content: &str,
    timeout: Duration,
) -> Result<Message> {
    let request = send(
        store.conn(),
        from_agent,
        to,
        content,
        MessageType::Request,
        None,
    )?;

    let deadline = Instant::now() + timeout;
    let mut interval = POLL_FLOOR;
    loop {
        if let Some(mut response) = find_reply(store.conn(), request.id)? {
            let now = util::now_rfc3339();
            store.conn().execute(
                "UPDATE messages SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
                params![now, response.id],
            )?;
            response.read_at.get_or_insert(now);
            return Ok(response);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout {
                what: format!("reply to message {}", request.id),
                seconds: timeout.as_secs(),
            });
        }
        std::thread::sleep(interval.min(deadline - now));
        interval = (interval * 2).min(POLL_CEILING);
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let message_type: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        content: row.get(3)?,
        message_type: MessageType::parse(&message_type),
        reply_to: row.get(5)?,
        created_at: row.get(6)?,
        read_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    const WORKING: Standing = Standing {
        is_leader: false,
        is_idle: false,
    };

    #[test]
    fn direct_and_broadcast_delivery() {
        let store = Store::in_memory().unwrap();
        send(
            store.conn(),
            "a1",
            &Address::Agent("b2".into()),
            "hello b",
            MessageType::Chat,
            None,
        )
        .unwrap();
        send(
            store.conn(),
            "a1",
            &Address::Broadcast,
            "hello everyone",
            MessageType::Chat,
            None,
        )
        .unwrap();

        let inbox_b = read_inbox(store.conn(), "b2", WORKING, false, 50).unwrap();
        assert_eq!(inbox_b.len(), 2);

        let inbox_c = read_inbox(store.conn(), "c3", WORKING, false, 50).unwrap();
        assert_eq!(inbox_c.len(), 1);
        assert_eq!(inbox_c[0].content, "hello everyone");
    }

    #[test]
    fn leader_address_follows_standing() {
        let store = Store::in_memory().unwrap();
        send(
            store.conn(),
            "a1",
            &Address::Leader,
            "for the leader",
            MessageType::Chat,
            None,
        )
        .unwrap();

        let as_follower = read_inbox(store.conn(), "b2", WORKING, false, 50).unwrap();
        assert!(as_follower.is_empty());

        let as_leader = read_inbox(
            store.conn(),
            "b2",
            Standing {
                is_leader: true,
                is_idle: false,
            },
            false,
            50,
        )
        .unwrap();
        assert_eq!(as_leader.len(), 1);
    }

    #[test]
    fn idle_address_reaches_all_idle_agents() {
        let store = Store::in_memory().unwrap();
        send(
            store.conn(),
            "a1",
            &Address::Idle,
            "anyone free?",
            MessageType::Chat,
            None,
        )
        .unwrap();

        let idle = Standing {
            is_leader: false,
            is_idle: true,
        };
        assert_eq!(read_inbox(store.conn(), "b2", idle, false, 50).unwrap().len(), 1);
        assert_eq!(read_inbox(store.conn(), "c3", idle, false, 50).unwrap().len(), 1);
        assert!(read_inbox(store.conn(), "d4", WORKING, false, 50)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn inbox_marks_read_exactly_once() {
        let store = Store::in_memory().unwrap();
        send(
            store.conn(),
            "a1",
            &Address::Agent("b2".into()),
            "ping",
            MessageType::Chat,
            None,
        )
        .unwrap();

        let first = read_inbox(store.conn(), "b2", WORKING, true, 50).unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].read_at.is_none());

        let second = read_inbox(store.conn(), "b2", WORKING, true, 50).unwrap();
        assert!(second.is_empty());

        // Still visible without the unread filter, with read_at stamped.
        let all = read_inbox(store.conn(), "b2", WORKING, false, 50).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].read_at.is_some());
    }

    #[test]
    fn unread_count_does_not_consume() {
        let store = Store::in_memory().unwrap();
        send(
            store.conn(),
            "a1",
            &Address::Agent("b2".into()),
            "ping",
            MessageType::Chat,
            None,
        )
        .unwrap();

        assert_eq!(unread_count(store.conn(), "b2", WORKING).unwrap(), 1);
        // Counting twice still reports one; nothing was marked read.
        assert_eq!(unread_count(store.conn(), "b2", WORKING).unwrap(), 1);

        read_inbox(store.conn(), "b2", WORKING, true, 50).unwrap();
        assert_eq!(unread_count(store.conn(), "b2", WORKING).unwrap(), 0);
    }

    #[test]
    fn reply_links_back_to_request() {
        let store = Store::in_memory().unwrap();
        let request = send(
            store.conn(),
            "a1",
            &Address::Agent("b2".into()),
            "ready?",
            MessageType::Request,
            None,
        )
        .unwrap();

        let response = reply(store.conn(), "b2", request.id, "yes").unwrap();
        assert_eq!(response.reply_to, Some(request.id));
        assert_eq!(response.to_agent.as_deref(), Some("a1"));
        assert_eq!(response.message_type, MessageType::Response);

        let found = find_reply(store.conn(), request.id).unwrap().unwrap();
        assert_eq!(found.id, response.id);
    }

    #[test]
    fn reply_to_unknown_request_fails() {
        let store = Store::in_memory().unwrap();
        assert!(reply(store.conn(), "b2", 999, "yes").is_err());
    }

    #[test]
    fn ask_times_out_but_request_survives() {
        let store = Store::in_memory().unwrap();
        let result = ask(
            &store,
            "a1",
            &Address::Agent("b2".into()),
            "anyone?",
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(Error::Timeout { .. })));

        // The request is still queryable and answerable.
        let inbox = read_inbox(store.conn(), "b2", WORKING, true, 50).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_type, MessageType::Request);
    }

    #[test]
    fn ask_returns_an_already_present_reply() {
        // Seed the reply from another "process" before the poll loop runs:
        // the first poll finds it immediately.
        let store = Store::in_memory().unwrap();
        let request = send(
            store.conn(),
            "a1",
            &Address::Agent("b2".into()),
            "ready?",
            MessageType::Request,
            None,
        )
        .unwrap();
        reply(store.conn(), "b2", request.id, "yes").unwrap();

        let response = find_reply(store.conn(), request.id).unwrap().unwrap();
        assert_eq!(response.content, "yes");
    }
}
