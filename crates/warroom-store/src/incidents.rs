use rusqlite::{Connection, OptionalExtension};
use tracing::{instrument, warn};

use warroom_core::ids::{AlertId, SessionId};
use warroom_core::incident::IncidentRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_time};

const ALERT_COLUMNS: &str =
    "id, packet_id, incident_id, severity, score, model_version, timestamp, session_id";

/// `ALERT_COLUMNS` qualified for queries joined against `sessions`.
const JOINED_ALERT_COLUMNS: &str = "a.id, a.packet_id, a.incident_id, a.severity, a.score,
     a.model_version, a.timestamp, a.session_id";

pub struct IncidentRepo {
    db: Database,
}

impl IncidentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a new alert unless one with the same packet, incident and
    /// severity already exists. Returns the stored row and whether it was
    /// newly inserted.
    #[instrument(skip(self, record), fields(incident_id = %record.incident_id, packet_id = %record.packet_id))]
    pub fn record(&self, record: &IncidentRecord) -> Result<(IncidentRecord, bool), StoreError> {
        self.db.with_tx(|conn| {
            let sql = format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE packet_id = ?1 AND incident_id = ?2 AND severity = ?3 LIMIT 1"
            );
            let existing = conn
                .query_row(
                    &sql,
                    [&record.packet_id, &record.incident_id, &record.severity],
                    |row| Ok(row_to_record(row)),
                )
                .optional()?
                .transpose()?;
            if let Some(existing) = existing {
                warn!(alert_id = %existing.id, "duplicate alert, keeping existing row");
                return Ok((existing, false));
            }
            upsert(conn, record)?;
            Ok((record.clone(), true))
        })
    }

    /// Insert or overwrite an alert row.
    #[instrument(skip(self, record), fields(alert_id = %record.id))]
    pub fn save(&self, record: &IncidentRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| upsert(conn, record))
    }

    #[instrument(skip(self), fields(alert_id = %id))]
    pub fn get(&self, id: &AlertId) -> Result<Option<IncidentRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1");
            conn.query_row(&sql, [id.as_str()], |row| Ok(row_to_record(row)))
                .optional()?
                .transpose()
        })
    }

    /// All alerts raised for an incident, newest first.
    #[instrument(skip(self))]
    pub fn find_by_incident_id(&self, incident_id: &str) -> Result<Vec<IncidentRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE incident_id = ?1 ORDER BY timestamp DESC"
            );
            query_records(conn, &sql, rusqlite::params![incident_id])
        })
    }

    #[instrument(skip(self))]
    pub fn latest_for_incident(&self, incident_id: &str) -> Result<Option<IncidentRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE incident_id = ?1
                 ORDER BY timestamp DESC LIMIT 1"
            );
            conn.query_row(&sql, [incident_id], |row| Ok(row_to_record(row)))
                .optional()?
                .transpose()
        })
    }

    /// Alerts whose correlated session has ended, newest first.
    #[instrument(skip(self))]
    pub fn list_resolved(&self) -> Result<Vec<IncidentRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOINED_ALERT_COLUMNS} FROM alerts a
                 JOIN sessions s ON a.session_id = s.id
                 WHERE s.status = 'ENDED'
                 ORDER BY a.timestamp DESC"
            );
            query_records(conn, &sql, rusqlite::params![])
        })
    }

    /// Alerts with no session or a session still running, newest first.
    #[instrument(skip(self))]
    pub fn list_active(&self, limit: u32) -> Result<Vec<IncidentRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOINED_ALERT_COLUMNS} FROM alerts a
                 LEFT JOIN sessions s ON a.session_id = s.id
                 WHERE s.id IS NULL OR s.status != 'ENDED'
                 ORDER BY a.timestamp DESC
                 LIMIT ?1"
            );
            query_records(conn, &sql, [limit])
        })
    }
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<IncidentRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(row_to_record(row)?);
    }
    Ok(records)
}

fn upsert(conn: &Connection, record: &IncidentRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO alerts (id, packet_id, incident_id, severity, score, model_version, timestamp, session_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            packet_id = excluded.packet_id,
            incident_id = excluded.incident_id,
            severity = excluded.severity,
            score = excluded.score,
            model_version = excluded.model_version,
            timestamp = excluded.timestamp,
            session_id = excluded.session_id",
        rusqlite::params![
            record.id.as_str(),
            record.packet_id,
            record.incident_id,
            record.severity,
            record.score,
            record.model_version,
            format_time(&record.timestamp),
            record.session_id.as_ref().map(SessionId::as_str),
        ],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<IncidentRecord, StoreError> {
    let timestamp: String = row_helpers::get(row, 6, "alerts", "timestamp")?;
    Ok(IncidentRecord {
        id: AlertId::from_raw(row_helpers::get::<String>(row, 0, "alerts", "id")?),
        packet_id: row_helpers::get(row, 1, "alerts", "packet_id")?,
        incident_id: row_helpers::get(row, 2, "alerts", "incident_id")?,
        severity: row_helpers::get(row, 3, "alerts", "severity")?,
        score: row_helpers::get_opt(row, 4, "alerts", "score")?,
        model_version: row_helpers::get_opt(row, 5, "alerts", "model_version")?,
        timestamp: row_helpers::parse_time(&timestamp, "alerts", "timestamp")?,
        session_id: row_helpers::get_opt::<String>(row, 7, "alerts", "session_id")?
            .map(SessionId::from_raw),
    })
}
