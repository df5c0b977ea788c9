use ulid::Ulid;

use crate::ledger::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Inspector(Ulid),
}

/// Who is calling. Passed explicitly into every ledger operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user: String,
    role: Role,
}

impl Session {
    pub fn admin(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            role: Role::Admin,
        }
    }

    pub fn inspector(id: Ulid) -> Self {
        Self {
            user: id.to_string(),
            role: Role::Inspector(id),
        }
    }

    /// Map a login name to a session: the admin user gets an admin session,
    /// a login that parses as an inspector id gets an inspector session.
    pub fn for_login(user: &str, admin_user: &str) -> Option<Self> {
        if user == admin_user {
            return Some(Self::admin(user));
        }
        Ulid::from_string(user).ok().map(Self::inspector)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), LedgerError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(LedgerError::Forbidden(format!(
                "{} is not an administrator",
                self.user
            )))
        }
    }

    /// Admins may act on any inspector; an inspector only on itself.
    pub fn require_access(&self, inspector_id: Ulid) -> Result<(), LedgerError> {
        match self.role {
            Role::Admin => Ok(()),
            Role::Inspector(id) if id == inspector_id => Ok(()),
            Role::Inspector(_) => Err(LedgerError::Forbidden(format!(
                "{} may not act on inspector {inspector_id}",
                self.user
            ))),
        }
    }

    /// Slot ids carry their owner's random half, so an inspector's access
    /// can be decided before the owner is looked up.
    pub fn require_slot_access(&self, slot_id: Ulid) -> Result<(), LedgerError> {
        match self.role {
            Role::Inspector(id) if id.random() != slot_id.random() => Err(LedgerError::Forbidden(
                format!("{} may not act on slot {slot_id}", self.user),
            )),
            _ => Ok(()),
        }
    }
}
