use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use warroom_core::ids::{IdentityId, SessionId};
use warroom_core::session::{Session, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_time};

const SESSION_COLUMNS: &str = "id, code, title, description, start_time, end_time, duration_seconds,
     status, creator_id, member_count";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update the scalar state of a session and return the
    /// persisted form.
    ///
    /// The code, start time and creator are fixed at insert. An `ENDED` row
    /// is never rewritten: the update is skipped and the stored row returned.
    /// A code already used by another session yields `UniqueViolation`.
    #[instrument(skip(self, session), fields(session_id = %session.id, code = %session.code))]
    pub fn save(&self, session: &Session) -> Result<Session, StoreError> {
        self.db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, code, title, description, start_time, end_time,
                                       duration_seconds, status, creator_id, member_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    end_time = excluded.end_time,
                    duration_seconds = excluded.duration_seconds,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                 WHERE sessions.status = 'ACTIVE'",
                rusqlite::params![
                    session.id.as_str(),
                    session.code,
                    session.title,
                    session.description,
                    format_time(&session.start_time),
                    session.end_time.as_ref().map(format_time),
                    session.duration_seconds,
                    session.status.to_string(),
                    session.creator_id.as_str(),
                    format_time(&Utc::now()),
                ],
            )?;
            load_by_id(conn, &session.id)?
                .ok_or_else(|| StoreError::NotFound(format!("session {}", session.id)))
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| load_by_id(conn, id))
    }

    #[instrument(skip(self))]
    pub fn get_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row("SELECT id FROM sessions WHERE code = ?1", [code], |row| row.get(0))
                .optional()?;
            match id {
                Some(id) => load_by_id(conn, &SessionId::from_raw(id)),
                None => Ok(None),
            }
        })
    }

    /// Sessions with the given status, oldest first.
    #[instrument(skip(self), fields(status = %status))]
    pub fn list_by_status(&self, status: SessionStatus) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1 ORDER BY start_time ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([status.to_string()])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            for session in &mut sessions {
                session.members = load_members(conn, &session.id)?;
            }
            Ok(sessions)
        })
    }

    /// Membership check straight against the membership table.
    #[instrument(skip(self), fields(session_id = %session_id, identity_id = %identity_id))]
    pub fn is_member(
        &self,
        session_id: &SessionId,
        identity_id: &IdentityId,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM session_members WHERE session_id = ?1 AND identity_id = ?2)",
                [session_id.as_str(), identity_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Insert a membership row and refresh the member-count cache in one
    /// transaction. A duplicate row yields `UniqueViolation`; a session that
    /// is no longer `ACTIVE` yields `Conflict` and nothing is written.
    #[instrument(skip(self), fields(session_id = %session_id, identity_id = %identity_id))]
    pub fn add_member(
        &self,
        session_id: &SessionId,
        identity_id: &IdentityId,
    ) -> Result<Session, StoreError> {
        self.db.with_tx(|conn| {
            let now = format_time(&Utc::now());
            let inserted = conn.execute(
                "INSERT INTO session_members (session_id, identity_id, joined_at)
                 SELECT ?1, ?2, ?3
                 WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?1 AND status = 'ACTIVE')",
                rusqlite::params![session_id.as_str(), identity_id.as_str(), now],
            )?;
            if inserted == 0 {
                return Err(inactive_session(conn, session_id)?);
            }
            refresh_member_count(conn, session_id, &now)?;
            load_by_id(conn, session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
        })
    }

    /// Delete a membership row. Returns false when there was nothing to
    /// remove; a session that is no longer `ACTIVE` yields `Conflict`.
    #[instrument(skip(self), fields(session_id = %session_id, identity_id = %identity_id))]
    pub fn remove_member(
        &self,
        session_id: &SessionId,
        identity_id: &IdentityId,
    ) -> Result<bool, StoreError> {
        self.db.with_tx(|conn| {
            let removed = conn.execute(
                "DELETE FROM session_members
                 WHERE session_id = ?1 AND identity_id = ?2
                   AND EXISTS (SELECT 1 FROM sessions WHERE id = ?1 AND status = 'ACTIVE')",
                [session_id.as_str(), identity_id.as_str()],
            )?;
            if removed == 0 {
                return match session_status(conn, session_id)?.as_deref() {
                    Some("ACTIVE") => Ok(false),
                    _ => Err(inactive_session(conn, session_id)?),
                };
            }
            refresh_member_count(conn, session_id, &format_time(&Utc::now()))?;
            Ok(true)
        })
    }
}

fn session_status(conn: &Connection, id: &SessionId) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row("SELECT status FROM sessions WHERE id = ?1", [id.as_str()], |row| row.get(0))
        .optional()?)
}

/// The error for a membership write that matched no `ACTIVE` session.
fn inactive_session(conn: &Connection, id: &SessionId) -> Result<StoreError, StoreError> {
    Ok(match session_status(conn, id)? {
        Some(status) => StoreError::Conflict(format!("session {id} is {status}")),
        None => StoreError::NotFound(format!("session {id}")),
    })
}

fn refresh_member_count(conn: &Connection, session_id: &SessionId, now: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET
            member_count = (SELECT COUNT(*) FROM session_members WHERE session_id = ?1),
            updated_at = ?2
         WHERE id = ?1",
        rusqlite::params![session_id.as_str(), now],
    )?;
    Ok(())
}

fn load_by_id(conn: &Connection, id: &SessionId) -> Result<Option<Session>, StoreError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut session = match rows.next()? {
        Some(row) => row_to_session(row)?,
        None => return Ok(None),
    };
    session.members = load_members(conn, id)?;
    Ok(Some(session))
}

fn load_members(conn: &Connection, id: &SessionId) -> Result<BTreeSet<IdentityId>, StoreError> {
    let mut stmt = conn.prepare("SELECT identity_id FROM session_members WHERE session_id = ?1")?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut members = BTreeSet::new();
    while let Some(row) = rows.next()? {
        members.insert(IdentityId::from_raw(row_helpers::get::<String>(
            row,
            0,
            "session_members",
            "identity_id",
        )?));
    }
    Ok(members)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let status: String = row_helpers::get(row, 7, "sessions", "status")?;
    let start: String = row_helpers::get(row, 4, "sessions", "start_time")?;
    let end: Option<String> = row_helpers::get_opt(row, 5, "sessions", "end_time")?;

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        code: row_helpers::get(row, 1, "sessions", "code")?,
        title: row_helpers::get(row, 2, "sessions", "title")?,
        description: row_helpers::get_opt(row, 3, "sessions", "description")?,
        start_time: row_helpers::parse_time(&start, "sessions", "start_time")?,
        end_time: end
            .map(|raw| row_helpers::parse_time(&raw, "sessions", "end_time"))
            .transpose()?,
        duration_seconds: row_helpers::get_opt(row, 6, "sessions", "duration_seconds")?,
        status: row_helpers::parse_enum(&status, "sessions", "status")?,
        creator_id: IdentityId::from_raw(row_helpers::get::<String>(row, 8, "sessions", "creator_id")?),
        members: BTreeSet::new(),
        member_count: row_helpers::get(row, 9, "sessions", "member_count")?,
    })
}
