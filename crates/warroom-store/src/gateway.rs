//! The storage contract the session coordinator is written against.
//!
//! Calls are synchronous and individually atomic. A duplicate membership or
//! session code is reported as [`StoreError::UniqueViolation`], distinct
//! from every other failure, so callers can converge on concurrent inserts.

use warroom_core::identity::Identity;
use warroom_core::ids::{IdentityId, SessionId};
use warroom_core::incident::IncidentRecord;
use warroom_core::session::{Session, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::incidents::IncidentRepo;
use crate::sessions::SessionRepo;
use crate::users::UserRepo;

pub trait StorageGateway: Send + Sync {
    fn find_session_by_code(&self, code: &str) -> Result<Option<Session>, StoreError>;

    fn find_session_by_id(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Upsert; returns the persisted form. Never rewrites an ended session.
    fn save_session(&self, session: &Session) -> Result<Session, StoreError>;

    fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<Session>, StoreError>;

    fn is_member(&self, session_id: &SessionId, identity_id: &IdentityId)
        -> Result<bool, StoreError>;

    /// Returns the session with its refreshed member set and count. Only an
    /// `ACTIVE` session accepts members; otherwise [`StoreError::Conflict`].
    fn add_member(
        &self,
        session_id: &SessionId,
        identity_id: &IdentityId,
    ) -> Result<Session, StoreError>;

    /// Returns whether a membership row was removed. [`StoreError::Conflict`]
    /// once the session has ended.
    fn remove_member(
        &self,
        session_id: &SessionId,
        identity_id: &IdentityId,
    ) -> Result<bool, StoreError>;

    fn find_incidents_by_incident_id(
        &self,
        incident_id: &str,
    ) -> Result<Vec<IncidentRecord>, StoreError>;

    fn save_incident_record(&self, record: &IncidentRecord) -> Result<(), StoreError>;

    fn find_identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError>;
}

/// [`StorageGateway`] over the SQLite repositories.
pub struct SqliteGateway {
    sessions: SessionRepo,
    incidents: IncidentRepo,
    users: UserRepo,
}

impl SqliteGateway {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            incidents: IncidentRepo::new(db.clone()),
            users: UserRepo::new(db),
        }
    }
}

impl StorageGateway for SqliteGateway {
    fn find_session_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        self.sessions.get_by_code(code)
    }

    fn find_session_by_id(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.sessions.get(id)
    }

    fn save_session(&self, session: &Session) -> Result<Session, StoreError> {
        self.sessions.save(session)
    }

    fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<Session>, StoreError> {
        self.sessions.list_by_status(status)
    }

    fn is_member(
        &self,
        session_id: &SessionId,
        identity_id: &IdentityId,
    ) -> Result<bool, StoreError> {
        self.sessions.is_member(session_id, identity_id)
    }

    fn add_member(
        &self,
        session_id: &SessionId,
        identity_id: &IdentityId,
    ) -> Result<Session, StoreError> {
        self.sessions.add_member(session_id, identity_id)
    }

    fn remove_member(
        &self,
        session_id: &SessionId,
        identity_id: &IdentityId,
    ) -> Result<bool, StoreError> {
        self.sessions.remove_member(session_id, identity_id)
    }

    fn find_incidents_by_incident_id(
        &self,
        incident_id: &str,
    ) -> Result<Vec<IncidentRecord>, StoreError> {
        self.incidents.find_by_incident_id(incident_id)
    }

    fn save_incident_record(&self, record: &IncidentRecord) -> Result<(), StoreError> {
        self.incidents.save(record)
    }

    fn find_identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        self.users.get(id)
    }
}
