use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::{info, instrument};

use warroom_core::identity::{normalize_email, Identity, Role};
use warroom_core::ids::IdentityId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_time};

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(identity_id = %id))]
    pub fn get(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, email, role FROM users WHERE id = ?1",
                [id.as_str()],
                |row| Ok(row_to_identity(row)),
            )
            .optional()?
            .transpose()
        })
    }

    #[instrument(skip(self))]
    pub fn find_by_email(&self, email: &str) -> Result<Option<Identity>, StoreError> {
        let email = normalize_email(email);
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, email, role FROM users WHERE email = ?1",
                [email.as_str()],
                |row| Ok(row_to_identity(row)),
            )
            .optional()?
            .transpose()
        })
    }

    /// Return the user for `email`, creating it with `role` if absent.
    /// An existing user keeps its stored role.
    #[instrument(skip(self), fields(role = %role))]
    pub fn get_or_create(&self, email: &str, role: Role) -> Result<Identity, StoreError> {
        let identity = Identity::new(email, role);
        self.db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, role, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(email) DO NOTHING",
                rusqlite::params![
                    identity.id.as_str(),
                    identity.email,
                    identity.role.to_string(),
                    format_time(&Utc::now()),
                ],
            )?;
            conn.query_row(
                "SELECT id, email, role FROM users WHERE email = ?1",
                [identity.email.as_str()],
                |row| Ok(row_to_identity(row)),
            )?
        })
    }

    /// Make sure every configured administrator exists. Existing users are
    /// left untouched. Returns how many were created.
    pub fn seed_admins(&self, emails: &[String]) -> Result<usize, StoreError> {
        let mut created = 0;
        for email in emails.iter().map(|e| normalize_email(e)).filter(|e| !e.is_empty()) {
            if self.find_by_email(&email)?.is_some() {
                info!(email = %email, "admin already exists");
                continue;
            }
            self.get_or_create(&email, Role::Admin)?;
            info!(email = %email, "created initial admin");
            created += 1;
        }
        Ok(created)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> Result<Identity, StoreError> {
    let role: String = row_helpers::get(row, 2, "users", "role")?;
    Ok(Identity {
        id: IdentityId::from_raw(row_helpers::get::<String>(row, 0, "users", "id")?),
        email: row_helpers::get(row, 1, "users", "email")?,
        role: row_helpers::parse_enum(&role, "users", "role")?,
    })
}
