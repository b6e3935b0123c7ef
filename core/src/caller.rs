//! Caller identity and authorization checks.
//!
//! RULE: Every mutating operation takes a Caller and authorizes it
//! before touching any row. A denied caller mutates nothing, and the
//! denial itself is recorded in the audit log as a security event.

use crate::error::{RecoveryError, RecoveryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// An authenticated customer. May act only on their own entities.
    Customer,
    /// An operations/support admin.
    Admin,
    /// The engine itself (sweep workers, transport callbacks).
    System,
}

#[derive(Debug, Clone)]
pub struct Caller {
    pub actor_id: String,
    pub role: Role,
}

impl Caller {
    pub fn customer(id: impl Into<String>) -> Self {
        Self {
            actor_id: id.into(),
            role: Role::Customer,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            actor_id: id.into(),
            role: Role::Admin,
        }
    }

    pub fn system() -> Self {
        Self {
            actor_id: "system".to_string(),
            role: Role::System,
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin | Role::System)
    }

    pub fn require_admin(&self, action: &'static str) -> RecoveryResult<()> {
        if self.is_privileged() {
            Ok(())
        } else {
            Err(RecoveryError::AccessDenied {
                actor: self.actor_id.clone(),
                action,
            })
        }
    }

    /// The owning customer or a privileged caller.
    pub fn require_owner_or_admin(
        &self,
        customer_id: &str,
        action: &'static str,
    ) -> RecoveryResult<()> {
        if self.is_privileged() || (self.role == Role::Customer && self.actor_id == customer_id) {
            Ok(())
        } else {
            Err(RecoveryError::AccessDenied {
                actor: self.actor_id.clone(),
                action,
            })
        }
    }
}
