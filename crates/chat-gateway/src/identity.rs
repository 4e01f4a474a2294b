//! Caller identity supplied by the fronting identity service.
//!
//! The gateway does no authentication of its own: it trusts the `x-user-id`
//! and `x-user-role` headers set upstream.

use crate::error::GatewayError;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Supervisor,
    Admin,
}

impl FromStr for Role {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "supervisor" => Ok(Role::Supervisor),
            "admin" => Ok(Role::Admin),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    /// Supervisors and admins may watch other users' sessions.
    pub fn can_observe(&self) -> bool {
        matches!(self.role, Role::Supervisor | Role::Admin)
    }

    pub fn require_observer(&self) -> Result<(), GatewayError> {
        if self.can_observe() {
            Ok(())
        } else {
            Err(GatewayError::Forbidden(
                "observing sessions requires the supervisor role".into(),
            ))
        }
    }

    pub fn require_admin(&self) -> Result<(), GatewayError> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            Err(GatewayError::Forbidden("admin role required".into()))
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(GatewayError::Unauthenticated)?;

        let role = match parts.headers.get(USER_ROLE_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|_| GatewayError::InvalidRequest("invalid role header".into()))?
                .parse()?,
            None => Role::default(),
        };

        Ok(Principal::new(user_id, role))
    }
}
