use serde::{Deserialize, Serialize};

use crate::ids::IdentityId;

/// Caller role. Only administrators may open a war room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "ADMIN"),
            Self::User => write!(f, "USER"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADMIN" => Ok(Self::Admin),
            "USER" => Ok(Self::User),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// An already-authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub email: String,
    pub role: Role,
}

impl Identity {
    pub fn new(email: impl AsRef<str>, role: Role) -> Self {
        Self {
            id: IdentityId::new(),
            email: normalize_email(email.as_ref()),
            role,
        }
    }
}

/// Emails are compared and stored lowercase.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrips_through_str() {
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(Role::User.to_string(), "USER");
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn only_admin_is_elevated() {
        assert!(Role::Admin.is_elevated());
        assert!(!Role::User.is_elevated());
    }

    #[test]
    fn new_identity_normalizes_email() {
        let identity = Identity::new("  Responder@Example.COM ", Role::User);
        assert_eq!(identity.email, "responder@example.com");
    }
}
