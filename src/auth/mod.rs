//! Stream credential verification
//!
//! Stored password hashes come in two forms: a salted memory-hard KDF hash
//! in PHC `$scheme$...$salt$digest` form (Argon2id), and a legacy plaintext
//! value kept only for accounts that predate hashing. Both paths compare in
//! constant time.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use subtle::ConstantTimeEq;
use tokio::task;

use crate::{
    errors::{AppError, StreamError},
    models::User,
    repositories::UserRepository,
};

/// Hash a password into PHC form. CPU-intensive, so it runs on a blocking
/// thread.
pub async fn hash_password(password: &str) -> Result<String, AppError> {
    let password = password.to_string();

    task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::internal(format!("Failed to hash password: {e}")))?
            .to_string();
        Ok(hash)
    })
    .await
    .map_err(|e| AppError::internal(format!("Password hashing task failed: {e}")))?
}

/// Verify a plain password against a stored hash, KDF or legacy form.
pub async fn verify_password(password: &str, stored: &str) -> Result<bool, AppError> {
    if stored.contains('$') {
        let password = password.to_string();
        let stored = stored.to_string();

        task::spawn_blocking(move || {
            let parsed = match PasswordHash::new(&stored) {
                Ok(h) => h,
                // Unparseable hash never verifies; it is not a server fault.
                Err(_) => return Ok(false),
            };
            match Argon2::default().verify_password(password.as_bytes(), &parsed) {
                Ok(()) => Ok(true),
                Err(argon2::password_hash::Error::Password) => Ok(false),
                Err(e) => Err(AppError::internal(format!(
                    "Password verification failed: {e}"
                ))),
            }
        })
        .await
        .map_err(|e| AppError::internal(format!("Password verification task failed: {e}")))?
    } else {
        Ok(constant_time_eq(password.as_bytes(), stored.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Resolve credentials into a user record, enforcing the active flag and
/// expiry. Capacity is checked later against the session registry; this is
/// purely identity.
pub async fn authenticate(
    users: &UserRepository,
    username: &str,
    password: &str,
) -> Result<User, StreamError> {
    let user = users
        .find_by_username(username)
        .await
        .map_err(|_| StreamError::UserInvalid)?
        .ok_or(StreamError::UserInvalid)?;

    if !user.is_active {
        return Err(StreamError::UserInvalid);
    }
    if user.is_expired(Utc::now()) {
        return Err(StreamError::AccountExpired);
    }

    match verify_password(password, &user.password_hash).await {
        Ok(true) => Ok(user),
        _ => Err(StreamError::UserInvalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn kdf_hash_round_trip() {
        let hash = hash_password("s3cret").await.unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("s3cret", &hash).await.unwrap());
        assert!(!verify_password("wrong", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn legacy_plaintext_comparison() {
        assert!(verify_password("hunter2", "hunter2").await.unwrap());
        assert!(!verify_password("hunter", "hunter2").await.unwrap());
        assert!(!verify_password("hunter22", "hunter2").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_kdf_hash_never_verifies() {
        assert!(!verify_password("x", "$bogus$not-a-hash").await.unwrap());
    }

    async fn seeded_users() -> (Database, UserRepository) {
        let db = Database::new_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let repo = UserRepository::new(db.pool().clone());
        (db, repo)
    }

    #[tokio::test]
    async fn authenticate_enforces_expiry_and_active_flag() {
        let (db, repo) = seeded_users().await;
        let expired = (Utc::now() - chrono::Duration::days(1)).to_rfc3339();

        sqlx::query(
            "INSERT INTO users (username, password_hash, max_connections, expires_at, is_active) VALUES \
             ('ok', 'pw', 0, NULL, 1), \
             ('expired', 'pw', 0, ?, 1), \
             ('disabled', 'pw', 0, NULL, 0)",
        )
        .bind(&expired)
        .execute(db.pool())
        .await
        .unwrap();

        assert!(authenticate(&repo, "ok", "pw").await.is_ok());
        assert!(matches!(
            authenticate(&repo, "expired", "pw").await,
            Err(StreamError::AccountExpired)
        ));
        assert!(matches!(
            authenticate(&repo, "disabled", "pw").await,
            Err(StreamError::UserInvalid)
        ));
        assert!(matches!(
            authenticate(&repo, "ok", "nope").await,
            Err(StreamError::UserInvalid)
        ));
        assert!(matches!(
            authenticate(&repo, "ghost", "pw").await,
            Err(StreamError::UserInvalid)
        ));
    }
}
