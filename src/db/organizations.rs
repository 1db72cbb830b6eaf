//! Organization (tenant) repository.

use crate::db::tx::Exec;
use crate::error::Result;
use crate::{ids, Organization};
use crate::with_exec;
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone)]
pub struct OrganizationRepo {
    pool: SqlitePool,
}

impl OrganizationRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        agent_secret_ciphertext: Vec<u8>,
        agent_secret_nonce: Vec<u8>,
    ) -> Result<Organization> {
        let id = ids::generate("org");
        with_exec!(self, |ex| {
            sqlx::query(
                "INSERT INTO organizations (id, name, agent_secret_ciphertext, agent_secret_nonce) VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(name)
            .bind(&agent_secret_ciphertext)
            .bind(&agent_secret_nonce)
            .execute(ex)
            .await
            .context("failed to insert organization")?;
        });

        self.get(&id)
            .await?
            .context("organization inserted but not found")
            .map_err(Into::into)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Organization>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, name, agent_secret_ciphertext, agent_secret_nonce, created_at FROM organizations WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch organization")?
        });

        row.map(org_from_row).transpose()
    }

    /// Find the organization whose decrypted agent secret matches
    /// `presented`, used to resolve tenant identity from a bare `hello`
    /// frame. Linear in the number of organizations; acceptable since a
    /// coordinator's tenant count is small relative to its connection count.
    pub async fn find_by_agent_secret(
        &self,
        master_key: &crate::crypto::MasterKey,
        presented: &str,
    ) -> Result<Option<String>> {
        let rows = with_exec!(self, |ex| {
            sqlx::query("SELECT id, agent_secret_ciphertext, agent_secret_nonce FROM organizations")
                .fetch_all(ex)
                .await
                .context("failed to scan organizations for agent secret match")?
        });

        for row in rows {
            let id: String = row.try_get("id").context("failed to read organization id")?;
            let ciphertext: Vec<u8> = row
                .try_get("agent_secret_ciphertext")
                .context("failed to read agent_secret_ciphertext")?;
            let nonce: Vec<u8> = row
                .try_get("agent_secret_nonce")
                .context("failed to read agent_secret_nonce")?;

            let Ok(secret) = master_key.decrypt(&ciphertext, &nonce) else {
                continue;
            };

            if crate::crypto::secrets_match(presented, &secret) {
                return Ok(Some(id));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn find_by_agent_secret_matches_only_the_right_organization() {
        let pool = connect_in_memory().await;
        let repo = OrganizationRepo::new(pool);
        let master_key = MasterKey::from_bytes(&[1u8; 32]);

        let (ciphertext_a, nonce_a) = master_key.encrypt(b"secret-a").unwrap();
        let org_a = repo.create("org-a", ciphertext_a, nonce_a).await.unwrap();

        let (ciphertext_b, nonce_b) = master_key.encrypt(b"secret-b").unwrap();
        let org_b = repo.create("org-b", ciphertext_b, nonce_b).await.unwrap();

        let found_a = repo.find_by_agent_secret(&master_key, "secret-a").await.unwrap();
        assert_eq!(found_a, Some(org_a.id));

        let found_b = repo.find_by_agent_secret(&master_key, "secret-b").await.unwrap();
        assert_eq!(found_b, Some(org_b.id));

        let found_none = repo.find_by_agent_secret(&master_key, "wrong-secret").await.unwrap();
        assert!(found_none.is_none());
    }
}

fn org_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Organization> {
    Ok(Organization {
        id: row.try_get("id").context("failed to read organization id")?,
        name: row.try_get("name").context("failed to read organization name")?,
        agent_secret_ciphertext: row
            .try_get("agent_secret_ciphertext")
            .context("failed to read agent_secret_ciphertext")?,
        agent_secret_nonce: row
            .try_get("agent_secret_nonce")
            .context("failed to read agent_secret_nonce")?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read organization created_at")?,
    })
}
