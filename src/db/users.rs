//! User repository, keyed by `(org_id, auth_provider, auth_provider_id)`.

use crate::db::tx::Exec;
use crate::error::Result;
use crate::with_exec;
use crate::{ids, ChatPlatform, User};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone)]
pub struct UserRepo {
    pool: SqlitePool,
}

impl UserRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find the user for this platform identity, creating one if absent.
    /// Uniqueness on `(org_id, auth_provider, auth_provider_id)` makes this
    /// idempotent under concurrent first-contact messages.
    pub async fn find_or_create(
        &self,
        org_id: &str,
        platform: ChatPlatform,
        auth_provider_id: &str,
        display_name: Option<&str>,
    ) -> Result<User> {
        if let Some(existing) = self.find(org_id, platform, auth_provider_id).await? {
            return Ok(existing);
        }

        let id = ids::generate("usr");
        let insert = with_exec!(self, |ex| {
            sqlx::query(
                "INSERT OR IGNORE INTO users (id, org_id, auth_provider, auth_provider_id, display_name) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(org_id)
            .bind(platform.as_str())
            .bind(auth_provider_id)
            .bind(display_name)
            .execute(ex)
            .await
            .context("failed to insert user")?
        });

        if insert.rows_affected() == 0 {
            // Lost the create race to a concurrent request.
            return self
                .find(org_id, platform, auth_provider_id)
                .await?
                .context("user insert raced but no row found")
                .map_err(Into::into);
        }

        self.find(org_id, platform, auth_provider_id)
            .await?
            .context("user inserted but not found")
            .map_err(Into::into)
    }

    pub async fn find(
        &self,
        org_id: &str,
        platform: ChatPlatform,
        auth_provider_id: &str,
    ) -> Result<Option<User>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, auth_provider, auth_provider_id, display_name, created_at FROM users WHERE org_id = ? AND auth_provider = ? AND auth_provider_id = ?",
            )
            .bind(org_id)
            .bind(platform.as_str())
            .bind(auth_provider_id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch user")?
        });

        row.map(user_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn find_or_create_is_idempotent_on_auth_identity() {
        let pool = connect_in_memory().await;
        let repo = UserRepo::new(pool);

        let first = repo
            .find_or_create("org1", ChatPlatform::Slack, "U123", Some("Ada"))
            .await
            .unwrap();
        let second = repo
            .find_or_create("org1", ChatPlatform::Slack, "U123", Some("Ada Lovelace"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id, "re-contact from the same platform identity reuses the row");
        assert_eq!(second.display_name.as_deref(), Some("Ada"), "display name is set once, on first contact");
    }

    #[tokio::test]
    async fn same_auth_provider_id_is_distinct_across_orgs() {
        let pool = connect_in_memory().await;
        let repo = UserRepo::new(pool);

        let org1_user = repo
            .find_or_create("org1", ChatPlatform::Slack, "U123", None)
            .await
            .unwrap();
        let org2_user = repo
            .find_or_create("org2", ChatPlatform::Slack, "U123", None)
            .await
            .unwrap();

        assert_ne!(org1_user.id, org2_user.id);
    }
}

fn user_from_row(row: sqlx::sqlite::SqliteRow) -> Result<User> {
    let platform_value: String = row
        .try_get("auth_provider")
        .context("failed to read user auth_provider")?;

    Ok(User {
        id: row.try_get("id").context("failed to read user id")?,
        org_id: row.try_get("org_id").context("failed to read user org_id")?,
        auth_provider: platform_value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid auth_provider in database: {platform_value}"))?,
        auth_provider_id: row
            .try_get("auth_provider_id")
            .context("failed to read user auth_provider_id")?,
        display_name: row.try_get("display_name").ok(),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read user created_at")?,
    })
}
