use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::sql::Command;

/// Who is connected. Selected by the startup user name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Everything, including listings and court administration.
    Admin,
    /// Front desk: token lookup and check-in on top of guest access.
    Staff,
    /// Availability, court lookup and booking creation.
    Guest,
}

impl Role {
    pub fn from_user(user: &str) -> Option<Self> {
        match user {
            "admin" => Some(Role::Admin),
            "staff" => Some(Role::Staff),
            "guest" => Some(Role::Guest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
            Role::Guest => "guest",
        }
    }

    pub fn permits(&self, cmd: &Command) -> bool {
        match cmd {
            Command::SelectAvailability(_) | Command::SelectCourts { .. } | Command::InsertBooking(_) => true,
            Command::SelectBookingByToken { .. } | Command::CheckIn { .. } => {
                matches!(self, Role::Admin | Role::Staff)
            }
            Command::SelectBookings(_)
            | Command::InsertCourt { .. }
            | Command::UpdateCourt { .. }
            | Command::DeleteCourt { .. } => *self == Role::Admin,
        }
    }
}

/// One password per role.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub admin: String,
    pub staff: String,
    pub guest: String,
}

impl Credentials {
    pub fn password_for(&self, role: Role) -> &str {
        match role {
            Role::Admin => &self.admin,
            Role::Staff => &self.staff,
            Role::Guest => &self.guest,
        }
    }
}

#[derive(Debug)]
pub struct CourtdAuthSource {
    credentials: Credentials,
}

impl CourtdAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for CourtdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        let Some(role) = Role::from_user(user) else {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(user, "login with unknown user");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("unknown user {user:?}; expected admin, staff or guest"),
            ))));
        };
        Ok(Password::new(
            None,
            self.credentials.password_for(role).as_bytes().to_vec(),
        ))
    }
}
