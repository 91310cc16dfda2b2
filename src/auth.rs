use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::engine::Engine;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password auth whose login user must be a registered user id.
pub struct AllocdAuthSource {
    engine: Arc<Engine>,
    password: String,
}

impl fmt::Debug for AllocdAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocdAuthSource")
            .field("password", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl AllocdAuthSource {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self { engine, password }
    }

    fn known_user(&self, login: &LoginInfo) -> bool {
        login
            .user()
            .and_then(|u| Ulid::from_string(u).ok())
            .is_some_and(|id| self.engine.get_user(&id).is_some())
    }
}

#[async_trait]
impl AuthSource for AllocdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if !self.known_user(login) {
            metrics::counter!(AUTH_FAILURES_TOTAL, "reason" => "unknown_user").increment(1);
            tracing::warn!(user = ?login.user(), "login rejected: unknown user");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("unknown user: {}", login.user().unwrap_or_default()),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
