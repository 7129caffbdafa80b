use std::sync::Arc;

use tracing::instrument;
use warroom_core::clock::Clock;
use warroom_core::events::{BroadcastEvent, MembershipAction};
use warroom_core::identity::Identity;
use warroom_core::ids::{IdentityId, SessionId};
use warroom_core::session::Session;
use warroom_store::{StorageGateway, StoreError};

use crate::code::generate_code;
use crate::error::CoordinatorError;
use crate::hub::BroadcastHub;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Collision checks per code allocation before giving up.
    pub max_code_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_code_attempts: 5,
        }
    }
}

/// Lifecycle of war-room sessions: create, join, leave, resolve.
///
/// Holds no session state of its own. Every decision is made against the
/// storage gateway, and every committed transition is published to the hub.
pub struct SessionCoordinator {
    storage: Arc<dyn StorageGateway>,
    hub: Arc<BroadcastHub>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl SessionCoordinator {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        hub: Arc<BroadcastHub>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            storage,
            hub,
            clock,
            config,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Open a new session with the creator as its first member.
    #[instrument(skip(self, description, creator), fields(creator_id = %creator.id))]
    pub fn create_session(
        &self,
        title: &str,
        description: Option<&str>,
        incident_id: Option<&str>,
        creator: &Identity,
    ) -> Result<Session, CoordinatorError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(CoordinatorError::InvalidRequest("title must not be empty".into()));
        }
        let creator = self.known_identity(&creator.id)?;
        if !creator.role.is_elevated() {
            return Err(CoordinatorError::Unauthorized(
                "only administrators may open a session".into(),
            ));
        }
        let description = description.map(str::trim).filter(|d| !d.is_empty());

        let session = match self.persist_new(title, description, &creator.id) {
            Ok(session) => session,
            Err(CoordinatorError::Storage(e)) => {
                tracing::warn!(error = %e, "initial session persist failed, retrying with a fresh code");
                self.persist_new(title, description, &creator.id)?
            }
            Err(e) => return Err(e),
        };

        let session = match self.storage.add_member(&session.id, &creator.id) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(
                    session_id = %session.id,
                    error = %e,
                    "failed to add creator to new session; session left without members"
                );
                return Err(e.into());
            }
        };

        let incident_id = incident_id.map(str::trim).filter(|i| !i.is_empty());
        if let Some(incident_id) = incident_id {
            self.correlate_incident(incident_id, &session.id);
        }

        tracing::info!(session_id = %session.id, code = %session.code, "session created");
        self.broadcast(&BroadcastEvent::session_created(&session, incident_id));
        Ok(session)
    }

    /// Join by code. Joining twice is a no-op that still announces the join.
    #[instrument(skip(self, participant), fields(identity_id = %participant.id))]
    pub fn join_session(&self, code: &str, participant: &Identity) -> Result<Session, CoordinatorError> {
        let session = self
            .storage
            .find_session_by_code(code.trim())?
            .ok_or_else(|| CoordinatorError::NotFound(format!("no session with code {code}")))?;
        let participant = self.known_identity(&participant.id)?;
        if !session.is_active() {
            return Err(ended(&session.id));
        }

        let session = if self.storage.is_member(&session.id, &participant.id)? {
            tracing::debug!(session_id = %session.id, "participant already a member");
            self.reload_active(&session.id)?
        } else {
            match self.storage.add_member(&session.id, &participant.id) {
                Ok(session) => session,
                Err(StoreError::UniqueViolation { constraint }) => {
                    tracing::warn!(
                        session_id = %session.id,
                        constraint = %constraint,
                        "concurrent join of the same participant, converging"
                    );
                    self.reload_active(&session.id)?
                }
                Err(StoreError::Conflict(reason)) => {
                    tracing::info!(session_id = %session.id, reason = %reason, "session ended during join");
                    return Err(ended(&session.id));
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(session_id = %session.id, members = session.member_count, "participant joined");
        self.broadcast(&BroadcastEvent::membership(
            &session,
            MembershipAction::Joined,
            &participant.email,
        ));
        Ok(session)
    }

    #[instrument(skip(self, participant), fields(session_id = %session_id, identity_id = %participant.id))]
    pub fn leave_session(
        &self,
        session_id: &SessionId,
        participant: &Identity,
    ) -> Result<Session, CoordinatorError> {
        let session = self.session(session_id)?;
        let participant = self.known_identity(&participant.id)?;
        if !session.is_active() {
            return Err(ended(&session.id));
        }

        let removed = match self.storage.remove_member(&session.id, &participant.id) {
            Ok(removed) => removed,
            Err(StoreError::Conflict(reason)) => {
                tracing::info!(reason = %reason, "session ended during leave");
                return Err(ended(&session.id));
            }
            Err(e) => return Err(e.into()),
        };
        if !removed {
            tracing::debug!("participant was not a member");
            return Ok(session);
        }

        let session = self.reload(&session.id)?;
        tracing::info!(members = session.member_count, "participant left");
        self.broadcast(&BroadcastEvent::membership(
            &session,
            MembershipAction::Left,
            &participant.email,
        ));
        Ok(session)
    }

    /// End the session and freeze its duration. Creator only, exactly once.
    #[instrument(skip(self, actor), fields(session_id = %session_id, identity_id = %actor.id))]
    pub fn resolve_incident(
        &self,
        session_id: &SessionId,
        actor: &Identity,
    ) -> Result<Session, CoordinatorError> {
        let mut session = self.session(session_id)?;
        if actor.id != session.creator_id {
            return Err(CoordinatorError::Unauthorized(
                "only the session creator may resolve it".into(),
            ));
        }
        if !session.is_active() {
            return Err(CoordinatorError::StateConflict(format!(
                "session {} already resolved",
                session.id
            )));
        }

        let now = self.clock.now();
        let duration = session.end(now);
        let persisted = self.storage.save_session(&session)?;
        if persisted.end_time != Some(now) || persisted.duration_seconds != Some(duration) {
            return Err(CoordinatorError::StateConflict(format!(
                "session {} was resolved concurrently",
                session.id
            )));
        }

        tracing::info!(duration_seconds = duration, "session resolved");
        self.broadcast(&BroadcastEvent::resolved(&persisted));
        Ok(persisted)
    }

    pub fn current_duration(&self, session: &Session) -> i64 {
        session.current_duration(self.clock.now())
    }

    pub fn session(&self, id: &SessionId) -> Result<Session, CoordinatorError> {
        self.storage
            .find_session_by_id(id)?
            .ok_or_else(|| CoordinatorError::NotFound(format!("session {id}")))
    }

    pub fn session_by_code(&self, code: &str) -> Result<Session, CoordinatorError> {
        self.storage
            .find_session_by_code(code.trim())?
            .ok_or_else(|| CoordinatorError::NotFound(format!("no session with code {code}")))
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageGateway> {
        &self.storage
    }

    pub(crate) fn broadcast(&self, event: &BroadcastEvent) {
        if let Err(e) = self.hub.publish(event) {
            tracing::warn!(event_type = event.event_type(), error = %e, "broadcast failed");
        }
    }

    fn persist_new(
        &self,
        title: &str,
        description: Option<&str>,
        creator_id: &IdentityId,
    ) -> Result<Session, CoordinatorError> {
        let code = self.allocate_code()?;
        let draft = Session::open(
            code,
            title,
            description.map(str::to_owned),
            creator_id.clone(),
            self.clock.now(),
        );
        Ok(self.storage.save_session(&draft)?)
    }

    fn allocate_code(&self) -> Result<String, CoordinatorError> {
        let mut rng = rand::thread_rng();
        for attempt in 1..=self.config.max_code_attempts {
            let code = generate_code(&mut rng);
            if self.storage.find_session_by_code(&code)?.is_none() {
                return Ok(code);
            }
            tracing::debug!(attempt, code = %code, "session code collision");
        }
        tracing::error!(attempts = self.config.max_code_attempts, "session code space exhausted");
        Err(CoordinatorError::CodeExhausted(self.config.max_code_attempts))
    }

    fn correlate_incident(&self, incident_id: &str, session_id: &SessionId) {
        let records = match self.storage.find_incidents_by_incident_id(incident_id) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(incident_id, error = %e, "incident lookup failed, skipping correlation");
                return;
            }
        };
        let mut linked = 0usize;
        for mut record in records {
            record.session_id = Some(session_id.clone());
            match self.storage.save_incident_record(&record) {
                Ok(()) => linked += 1,
                Err(e) => {
                    tracing::warn!(alert_id = %record.id, error = %e, "failed to correlate alert");
                }
            }
        }
        tracing::debug!(incident_id, linked, "incident correlated");
    }

    fn known_identity(&self, id: &IdentityId) -> Result<Identity, CoordinatorError> {
        self.storage
            .find_identity(id)?
            .ok_or_else(|| CoordinatorError::NotFound(format!("identity {id}")))
    }

    fn reload(&self, id: &SessionId) -> Result<Session, CoordinatorError> {
        self.session(id)
    }

    /// Reload after a membership no-op, refusing a session resolved meanwhile.
    fn reload_active(&self, id: &SessionId) -> Result<Session, CoordinatorError> {
        let session = self.reload(id)?;
        if !session.is_active() {
            return Err(ended(id));
        }
        Ok(session)
    }
}

fn ended(id: &SessionId) -> CoordinatorError {
    CoordinatorError::StateConflict(format!("session {id} has ended"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Barrier;

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{Duration, Utc};
    use warroom_core::clock::ManualClock;
    use warroom_core::identity::Role;
    use warroom_core::incident::IncidentRecord;
    use warroom_core::session::SessionStatus;
    use warroom_store::incidents::IncidentRepo;
    use warroom_store::users::UserRepo;
    use warroom_store::{Database, SqliteGateway};

    use crate::hub::{HubConfig, Observer, TransportError};

    /// Wraps the SQLite gateway with switchable faults.
    #[derive(Default)]
    pub(crate) struct Faults {
        pub save_failures: AtomicU32,
        pub codes_taken: AtomicBool,
        pub hide_membership: AtomicBool,
        pub fail_add_member: AtomicBool,
        pub fail_incident_lookup: AtomicBool,
        pub fail_incident_save: AtomicBool,
        pub fail_find_by_id: AtomicBool,
        pub stale_reads: AtomicBool,
        pub fail_list: AtomicBool,
        pub stale_list: AtomicBool,
        pub resolve_mid_write: AtomicBool,
        pub save_calls: AtomicU32,
    }

    pub(crate) struct FaultyGateway {
        inner: SqliteGateway,
        pub faults: Faults,
    }

    fn injected() -> StoreError {
        StoreError::Database("injected fault".into())
    }

    impl FaultyGateway {
        /// Commit a resolution behind the caller's back, once.
        fn resolve_behind(&self, id: &SessionId) -> Result<(), StoreError> {
            if !self.faults.resolve_mid_write.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(mut session) = self.inner.find_session_by_id(id)? {
                session.end(Utc::now());
                self.inner.save_session(&session)?;
            }
            Ok(())
        }
    }

    impl StorageGateway for FaultyGateway {
        fn find_session_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
            if self.faults.codes_taken.load(Ordering::SeqCst) {
                let placeholder =
                    Session::open(code, "taken", None, IdentityId::new(), Utc::now());
                return Ok(Some(placeholder));
            }
            self.inner.find_session_by_code(code)
        }

        fn find_session_by_id(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
            if self.faults.fail_find_by_id.load(Ordering::SeqCst) {
                return Err(injected());
            }
            let session = self.inner.find_session_by_id(id)?;
            if self.faults.stale_reads.load(Ordering::SeqCst) {
                return Ok(session.map(|mut s| {
                    s.status = SessionStatus::Active;
                    s.end_time = None;
                    s.duration_seconds = None;
                    s
                }));
            }
            Ok(session)
        }

        fn save_session(&self, session: &Session) -> Result<Session, StoreError> {
            self.faults.save_calls.fetch_add(1, Ordering::SeqCst);
            let pending = self.faults.save_failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.faults.save_failures.store(pending - 1, Ordering::SeqCst);
                return Err(injected());
            }
            self.inner.save_session(session)
        }

        fn list_sessions_by_status(
            &self,
            status: SessionStatus,
        ) -> Result<Vec<Session>, StoreError> {
            if self.faults.fail_list.load(Ordering::SeqCst) {
                return Err(injected());
            }
            let mut sessions = self.inner.list_sessions_by_status(status)?;
            if self.faults.stale_list.load(Ordering::SeqCst) && status == SessionStatus::Active {
                sessions.extend(self.inner.list_sessions_by_status(SessionStatus::Ended)?);
            }
            Ok(sessions)
        }

        fn is_member(&self, s: &SessionId, i: &IdentityId) -> Result<bool, StoreError> {
            self.resolve_behind(s)?;
            if self.faults.hide_membership.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.is_member(s, i)
        }

        fn add_member(&self, s: &SessionId, i: &IdentityId) -> Result<Session, StoreError> {
            if self.faults.fail_add_member.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.add_member(s, i)
        }

        fn remove_member(&self, s: &SessionId, i: &IdentityId) -> Result<bool, StoreError> {
            self.resolve_behind(s)?;
            self.inner.remove_member(s, i)
        }

        fn find_incidents_by_incident_id(
            &self,
            incident_id: &str,
        ) -> Result<Vec<IncidentRecord>, StoreError> {
            if self.faults.fail_incident_lookup.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.find_incidents_by_incident_id(incident_id)
        }

        fn save_incident_record(&self, record: &IncidentRecord) -> Result<(), StoreError> {
            if self.faults.fail_incident_save.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.save_incident_record(record)
        }

        fn find_identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
            self.inner.find_identity(id)
        }
    }

    #[derive(Default)]
    pub(crate) struct CapturingObserver {
        pub events: parking_lot::Mutex<Vec<serde_json::Value>>,
    }

    impl CapturingObserver {
        pub fn types(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .map(|e| e["type"].as_str().unwrap_or_default().to_owned())
                .collect()
        }
    }

    #[async_trait]
    impl Observer for CapturingObserver {
        async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
            let value = serde_json::from_slice(&payload).map_err(|e| TransportError::Write(e.to_string()))?;
            self.events.lock().push(value);
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn close(&self) {}
    }

    pub(crate) struct Harness {
        pub db: Database,
        pub gateway: Arc<FaultyGateway>,
        pub clock: Arc<ManualClock>,
        pub coordinator: Arc<SessionCoordinator>,
        pub observer: Arc<CapturingObserver>,
        pub admin: Identity,
    }

    impl Harness {
        pub fn new() -> Self {
            let db = Database::in_memory().unwrap();
            let admin = UserRepo::new(db.clone()).get_or_create("admin@corp.io", Role::Admin).unwrap();
            let gateway = Arc::new(FaultyGateway {
                inner: SqliteGateway::new(db.clone()),
                faults: Faults::default(),
            });
            let clock = Arc::new(ManualClock::default());
            let hub = BroadcastHub::new(HubConfig::default());
            let observer = Arc::new(CapturingObserver::default());
            hub.register_observer(observer.clone());
            let coordinator = Arc::new(SessionCoordinator::new(
                gateway.clone(),
                hub,
                clock.clone(),
                CoordinatorConfig::default(),
            ));
            Self { db, gateway, clock, coordinator, observer, admin }
        }

        pub fn user(&self, email: &str) -> Identity {
            UserRepo::new(self.db.clone()).get_or_create(email, Role::User).unwrap()
        }

        /// Yield until the hub's delivery worker has caught up.
        pub async fn events(&self, expected: usize) -> Vec<serde_json::Value> {
            for _ in 0..200 {
                if self.observer.events.lock().len() >= expected {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            self.observer.events.lock().clone()
        }
    }

    fn assert_kind(result: Result<Session, CoordinatorError>, kind: &str) {
        match result {
            Err(e) => assert_eq!(e.error_kind(), kind, "unexpected error: {e}"),
            Ok(s) => panic!("expected {kind}, got session {}", s.id),
        }
    }

    #[tokio::test]
    async fn incident_bravo_end_to_end() {
        let h = Harness::new();
        let incidents = IncidentRepo::new(h.db.clone());
        let alert = IncidentRecord::new("pkt-1", "INC-BRAVO", "HIGH", Utc::now()).with_score(0.93);
        incidents.save(&alert).unwrap();

        let session = h
            .coordinator
            .create_session("Incident Bravo", Some("lateral movement"), Some("INC-BRAVO"), &h.admin)
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.member_count, 1);
        assert!(session.is_member(&h.admin.id));
        assert_eq!(session.code.len(), 6);

        let linked = incidents.get(&alert.id).unwrap().unwrap();
        assert_eq!(linked.session_id, Some(session.id.clone()));

        let u1 = h.user("one@corp.io");
        let u2 = h.user("two@corp.io");
        h.coordinator.join_session(&session.code, &u1).unwrap();
        let joined = h.coordinator.join_session(&session.code, &u2).unwrap();
        assert_eq!(joined.member_count, 3);
        assert_eq!(joined.members.len(), 3);

        h.clock.advance(Duration::seconds(90));
        let ended = h.coordinator.resolve_incident(&session.id, &h.admin).unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert_eq!(ended.duration_seconds, Some(90));
        assert_eq!(h.coordinator.current_duration(&ended), 90);

        assert_kind(h.coordinator.resolve_incident(&session.id, &h.admin), "state_conflict");

        let events = h.events(4).await;
        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec!["session-created", "membership-changed", "membership-changed", "session-resolved"]
        );
        assert_eq!(events[0]["incidentId"], "INC-BRAVO");
        assert_eq!(events[2]["memberCount"], 3);
        assert_eq!(events[2]["identity"], "two@corp.io");
        assert_eq!(events[3]["durationSeconds"], 90);
    }

    #[tokio::test]
    async fn create_requires_admin_and_title() {
        let h = Harness::new();
        let user = h.user("plain@corp.io");
        assert_kind(h.coordinator.create_session("Outage", None, None, &user), "unauthorized");
        assert_kind(h.coordinator.create_session("   ", None, None, &h.admin), "invalid_request");

        let stranger = Identity::new("ghost@corp.io", Role::Admin);
        assert_kind(h.coordinator.create_session("Outage", None, None, &stranger), "not_found");
        assert!(h.events(0).await.is_empty());
    }

    #[tokio::test]
    async fn create_uses_stored_role_not_claimed_role() {
        let h = Harness::new();
        let mut user = h.user("sneaky@corp.io");
        user.role = Role::Admin;
        assert_kind(h.coordinator.create_session("Outage", None, None, &user), "unauthorized");
    }

    #[tokio::test]
    async fn create_retries_persist_once() {
        let h = Harness::new();
        h.gateway.faults.save_failures.store(1, Ordering::SeqCst);
        let session = h.coordinator.create_session("Retry", None, None, &h.admin).unwrap();
        assert_eq!(h.gateway.faults.save_calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.member_count, 1);
    }

    #[tokio::test]
    async fn create_fails_after_second_persist_failure() {
        let h = Harness::new();
        h.gateway.faults.save_failures.store(2, Ordering::SeqCst);
        assert_kind(h.coordinator.create_session("Retry", None, None, &h.admin), "storage");
        assert_eq!(h.gateway.faults.save_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn code_exhaustion_is_not_retried() {
        let h = Harness::new();
        h.gateway.faults.codes_taken.store(true, Ordering::SeqCst);
        assert_kind(h.coordinator.create_session("Full", None, None, &h.admin), "code_exhausted");
        assert_eq!(h.gateway.faults.save_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn creator_add_failure_is_fatal_and_leaves_row() {
        let h = Harness::new();
        h.gateway.faults.fail_add_member.store(true, Ordering::SeqCst);
        assert_kind(h.coordinator.create_session("Orphan", None, None, &h.admin), "storage");

        let active = h.gateway.list_sessions_by_status(SessionStatus::Active).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].member_count, 0);
        assert!(h.events(0).await.is_empty());
    }

    #[tokio::test]
    async fn correlation_failure_is_swallowed() {
        let h = Harness::new();
        IncidentRepo::new(h.db.clone())
            .save(&IncidentRecord::new("pkt", "INC-9", "LOW", Utc::now()))
            .unwrap();

        h.gateway.faults.fail_incident_save.store(true, Ordering::SeqCst);
        assert!(h.coordinator.create_session("A", None, Some("INC-9"), &h.admin).is_ok());

        h.gateway.faults.fail_incident_lookup.store(true, Ordering::SeqCst);
        assert!(h.coordinator.create_session("B", None, Some("INC-9"), &h.admin).is_ok());
    }

    #[tokio::test]
    async fn join_is_idempotent_but_still_announced() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Dup", None, None, &h.admin).unwrap();
        let user = h.user("twice@corp.io");

        let first = h.coordinator.join_session(&session.code, &user).unwrap();
        let second = h.coordinator.join_session(&session.code, &user).unwrap();
        assert_eq!(first.member_count, 2);
        assert_eq!(second.member_count, 2);
        assert_eq!(
            h.events(3).await.iter().filter(|e| e["type"] == "membership-changed").count(),
            2
        );
    }

    #[tokio::test]
    async fn join_converges_on_unique_violation() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Race", None, None, &h.admin).unwrap();
        let user = h.user("racer@corp.io");
        h.coordinator.join_session(&session.code, &user).unwrap();

        // Pre-check misses, so the insert collides with the existing row.
        h.gateway.faults.hide_membership.store(true, Ordering::SeqCst);
        let converged = h.coordinator.join_session(&session.code, &user).unwrap();
        assert_eq!(converged.member_count, 2);
        assert!(converged.is_member(&user.id));
    }

    #[tokio::test]
    async fn concurrent_joins_of_same_participant() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Race", None, None, &h.admin).unwrap();
        let user = h.user("racer@corp.io");
        h.gateway.faults.hide_membership.store(true, Ordering::SeqCst);

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = Arc::clone(&h.coordinator);
                let barrier = Arc::clone(&barrier);
                let code = session.code.clone();
                let user = user.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    coordinator.join_session(&code, &user)
                })
            })
            .collect();
        for handle in handles {
            let joined = handle.join().unwrap().unwrap();
            assert_eq!(joined.member_count, 2);
        }
        assert_eq!(h.coordinator.session(&session.id).unwrap().member_count, 2);
    }

    #[tokio::test]
    async fn join_rejects_unknown_code_and_ended_session() {
        let h = Harness::new();
        let user = h.user("late@corp.io");
        assert_kind(h.coordinator.join_session("zzzzzz", &user), "not_found");

        let session = h.coordinator.create_session("Done", None, None, &h.admin).unwrap();
        h.coordinator.resolve_incident(&session.id, &h.admin).unwrap();
        assert_kind(h.coordinator.join_session(&session.code, &user), "state_conflict");
        assert_kind(h.coordinator.leave_session(&session.id, &user), "state_conflict");
    }

    #[tokio::test]
    async fn join_refused_when_resolved_before_insert() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Late", None, None, &h.admin).unwrap();
        let user = h.user("late@corp.io");

        h.gateway.faults.resolve_mid_write.store(true, Ordering::SeqCst);
        assert_kind(h.coordinator.join_session(&session.code, &user), "state_conflict");

        let stored = h.coordinator.session(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Ended);
        assert_eq!(stored.member_count, 1);
        assert!(!stored.is_member(&user.id));
        assert!(!h.gateway.is_member(&session.id, &user.id).unwrap());
        assert!(!h.events(1).await.iter().any(|e| e["type"] == "membership-changed"));
    }

    #[tokio::test]
    async fn rejoin_refused_when_resolved_before_reload() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Late", None, None, &h.admin).unwrap();
        let user = h.user("again@corp.io");
        h.coordinator.join_session(&session.code, &user).unwrap();

        h.gateway.faults.resolve_mid_write.store(true, Ordering::SeqCst);
        assert_kind(h.coordinator.join_session(&session.code, &user), "state_conflict");
        assert_eq!(
            h.events(2).await.iter().filter(|e| e["type"] == "membership-changed").count(),
            1
        );
    }

    #[tokio::test]
    async fn leave_refused_when_resolved_before_delete() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Late", None, None, &h.admin).unwrap();
        let user = h.user("stay@corp.io");
        h.coordinator.join_session(&session.code, &user).unwrap();

        h.gateway.faults.resolve_mid_write.store(true, Ordering::SeqCst);
        assert_kind(h.coordinator.leave_session(&session.id, &user), "state_conflict");

        let stored = h.coordinator.session(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Ended);
        assert_eq!(stored.member_count, 2);
        assert!(stored.is_member(&user.id));
    }

    #[tokio::test]
    async fn leave_removes_and_non_member_leave_is_silent() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Leave", None, None, &h.admin).unwrap();
        let user = h.user("bye@corp.io");
        h.coordinator.join_session(&session.code, &user).unwrap();

        let after = h.coordinator.leave_session(&session.id, &user).unwrap();
        assert_eq!(after.member_count, 1);
        assert!(!after.is_member(&user.id));

        let again = h.coordinator.leave_session(&session.id, &user).unwrap();
        assert_eq!(again.member_count, 1);

        let events = h.events(3).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2]["action"], "left");
    }

    #[tokio::test]
    async fn creator_leaving_does_not_resolve() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Empty", None, None, &h.admin).unwrap();
        let empty = h.coordinator.leave_session(&session.id, &h.admin).unwrap();
        assert_eq!(empty.member_count, 0);
        assert!(empty.is_active());

        // The creator may still resolve after leaving.
        let ended = h.coordinator.resolve_incident(&session.id, &h.admin).unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn resolve_only_by_creator() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Mine", None, None, &h.admin).unwrap();
        let other_admin = UserRepo::new(h.db.clone()).get_or_create("boss@corp.io", Role::Admin).unwrap();
        assert_kind(h.coordinator.resolve_incident(&session.id, &other_admin), "unauthorized");
        assert_kind(h.coordinator.resolve_incident(&SessionId::new(), &h.admin), "not_found");
        assert!(h.coordinator.session(&session.id).unwrap().is_active());
    }

    #[tokio::test]
    async fn resolve_detects_lost_race() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Race", None, None, &h.admin).unwrap();

        // Another resolution commits first.
        let mut winner = session.clone();
        winner.end(h.clock.now() + Duration::seconds(10));
        h.gateway.save_session(&winner).unwrap();

        // This caller still reads the row as ACTIVE.
        h.gateway.faults.stale_reads.store(true, Ordering::SeqCst);
        h.clock.advance(Duration::seconds(20));
        assert_kind(h.coordinator.resolve_incident(&session.id, &h.admin), "state_conflict");

        h.gateway.faults.stale_reads.store(false, Ordering::SeqCst);
        let stored = h.coordinator.session(&session.id).unwrap();
        assert_eq!(stored.duration_seconds, Some(10));
        assert_eq!(
            h.events(1).await.iter().filter(|e| e["type"] == "session-resolved").count(),
            0
        );
    }

    #[tokio::test]
    async fn current_duration_tracks_clock() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Tick", None, None, &h.admin).unwrap();
        assert_eq!(h.coordinator.current_duration(&session), 0);
        h.clock.advance(Duration::seconds(45));
        assert_eq!(h.coordinator.current_duration(&session), 45);
    }

    #[tokio::test]
    async fn lookup_by_code() {
        let h = Harness::new();
        let session = h.coordinator.create_session("Find", None, None, &h.admin).unwrap();
        assert_eq!(h.coordinator.session_by_code(&session.code).unwrap().id, session.id);
        assert!(matches!(
            h.coordinator.session_by_code("000000"),
            Err(CoordinatorError::NotFound(_))
        ));
    }
}
