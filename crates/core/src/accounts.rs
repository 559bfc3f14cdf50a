//! User accounts and their single active session.
//!
//! Tokens are minted outside this crate; what lives here is the session id a token must
//! carry. Opening a session rotates the id, invalidating every token issued before it.

use crate::audit::{AuditAction, AuditEvent};
use crate::db::Store;
use crate::error::{is_unique_violation, EmrError, EmrResult};
use emr_types::NonEmptyText;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Physician,
    FrontDesk,
    Nurse,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Physician => "physician",
            Role::FrontDesk => "front_desk",
            Role::Nurse => "nurse",
        }
    }
}

impl FromStr for Role {
    type Err = EmrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "admin" => Ok(Role::Admin),
            "physician" => Ok(Role::Physician),
            "front_desk" => Ok(Role::FrontDesk),
            "nurse" => Ok(Role::Nurse),
            other => Err(EmrError::InvalidInput(format!("unknown role '{other}'"))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    #[serde(rename = "idUsuario")]
    pub id: i64,
    #[serde(rename = "usuario")]
    pub username: String,
    #[serde(rename = "nombreCompleto")]
    pub full_name: String,
    #[serde(rename = "rol")]
    pub role: Role,
    #[serde(rename = "activo")]
    pub active: bool,
    #[serde(skip)]
    pub session_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    username: String,
    full_name: String,
    role: String,
    active: bool,
    session_id: Option<String>,
}

impl TryFrom<AccountRow> for Account {
    type Error = EmrError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let role = Role::from_str(&row.role)
            .map_err(|_| EmrError::CorruptRecord(format!("user {} role '{}'", row.id, row.role)))?;
        Ok(Account {
            id: row.id,
            username: row.username,
            full_name: row.full_name,
            role,
            active: row.active,
            session_id: row.session_id,
        })
    }
}

impl Account {
    /// True when `session_id` is this account's current session and the account is active.
    pub fn accepts_session(&self, session_id: &str) -> bool {
        self.active && self.session_id.as_deref() == Some(session_id)
    }
}

#[derive(Clone, Debug)]
pub struct AccountService {
    store: Store,
}

impl AccountService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Registers a user. Used by operator tooling.
    pub async fn create_user(
        &self,
        username: &str,
        full_name: &str,
        role: Role,
    ) -> EmrResult<Account> {
        let username = NonEmptyText::new(username)?;
        let full_name = NonEmptyText::new(full_name)?;
        let id = sqlx::query("INSERT INTO users (username, full_name, role) VALUES (?, ?, ?)")
            .bind(username.as_str())
            .bind(full_name.as_str())
            .bind(role.as_str())
            .execute(self.store.pool())
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EmrError::InvalidInput(format!("username '{username}' is taken"))
                } else {
                    EmrError::Database(e)
                }
            })?
            .last_insert_rowid();
        tracing::info!(user_id = id, role = role.as_str(), "user created");
        self.current_session(id)
            .await?
            .ok_or(EmrError::NotFound("user"))
    }

    /// The account with its current session id, if the user exists.
    pub async fn current_session(&self, user_id: i64) -> EmrResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, username, full_name, role, active, session_id FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(Account::try_from).transpose()
    }

    pub async fn find_by_username(&self, username: &str) -> EmrResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, username, full_name, role, active, session_id FROM users
             WHERE username = ?",
        )
        .bind(username.trim())
        .fetch_optional(self.store.pool())
        .await?;
        row.map(Account::try_from).transpose()
    }

    /// Starts a new session for an active user, replacing any previous one.
    ///
    /// Returns the account with its new session id.
    pub async fn open_session(&self, user_id: i64) -> EmrResult<Account> {
        let session_id = Uuid::new_v4().simple().to_string();
        let result = sqlx::query("UPDATE users SET session_id = ? WHERE id = ? AND active = 1")
            .bind(&session_id)
            .bind(user_id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(EmrError::NotFound("active user"));
        }

        self.store
            .audit()
            .emit(AuditEvent::new(user_id, AuditAction::SessionOpened, "user", user_id));
        self.current_session(user_id)
            .await?
            .ok_or(EmrError::NotFound("user"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_store;

    #[tokio::test]
    async fn opening_a_session_invalidates_the_previous_one() {
        let (_dir, store, _audit) = test_store().await;
        let service = AccountService::new(store.clone());
        let user = service
            .create_user("medico", "Dra. Rosa Huamán", Role::Physician)
            .await
            .unwrap();
        assert_eq!(user.session_id, None);

        let first = service.open_session(user.id).await.unwrap();
        let first_sid = first.session_id.clone().unwrap();
        assert!(first.accepts_session(&first_sid));

        let second = service.open_session(user.id).await.unwrap();
        assert!(!second.accepts_session(&first_sid));
        assert!(second.accepts_session(second.session_id.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn inactive_accounts_cannot_open_sessions() {
        let (_dir, store, _audit) = test_store().await;
        let service = AccountService::new(store.clone());
        let user = service
            .create_user("enfermera", "Luis Soto", Role::Nurse)
            .await
            .unwrap();
        sqlx::query("UPDATE users SET active = 0 WHERE id = ?")
            .bind(user.id)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(matches!(
            service.open_session(user.id).await,
            Err(EmrError::NotFound("active user"))
        ));
        assert!(matches!(
            service.create_user("enfermera", "Otro", Role::Nurse).await,
            Err(EmrError::InvalidInput(_))
        ));
    }
}
