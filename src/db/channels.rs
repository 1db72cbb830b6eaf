//! Connected Channel repository.

use crate::db::tx::Exec;
use crate::error::Result;
use crate::with_exec;
use crate::{ids, ChatPlatform, ConnectedChannel};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone)]
pub struct ChannelRepo {
    pool: SqlitePool,
}

impl ChannelRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_or_create(
        &self,
        org_id: &str,
        platform: ChatPlatform,
        platform_channel_id: &str,
    ) -> Result<ConnectedChannel> {
        if let Some(existing) = self.find(org_id, platform, platform_channel_id).await? {
            return Ok(existing);
        }

        let id = ids::generate("chn");
        with_exec!(self, |ex| {
            sqlx::query(
                "INSERT OR IGNORE INTO connected_channels (id, org_id, platform, platform_channel_id) VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(org_id)
            .bind(platform.as_str())
            .bind(platform_channel_id)
            .execute(ex)
            .await
            .context("failed to insert connected channel")?;
        });

        self.find(org_id, platform, platform_channel_id)
            .await?
            .context("connected channel inserted but not found")
            .map_err(Into::into)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConnectedChannel>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, platform, platform_channel_id, default_repository_url, created_at FROM connected_channels WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch connected channel by id")?
        });

        row.map(channel_from_row).transpose()
    }

    pub async fn set_default_repository_url(&self, id: &str, repository_url: &str) -> Result<()> {
        with_exec!(self, |ex| {
            sqlx::query("UPDATE connected_channels SET default_repository_url = ? WHERE id = ?")
                .bind(repository_url)
                .bind(id)
                .execute(ex)
                .await
                .context("failed to set channel default repository url")?;
        });
        Ok(())
    }

    pub async fn find(
        &self,
        org_id: &str,
        platform: ChatPlatform,
        platform_channel_id: &str,
    ) -> Result<Option<ConnectedChannel>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, platform, platform_channel_id, default_repository_url, created_at FROM connected_channels WHERE org_id = ? AND platform = ? AND platform_channel_id = ?",
            )
            .bind(org_id)
            .bind(platform.as_str())
            .bind(platform_channel_id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch connected channel")?
        });

        row.map(channel_from_row).transpose()
    }
}


fn channel_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ConnectedChannel> {
    let platform_value: String = row
        .try_get("platform")
        .context("failed to read channel platform")?;

    Ok(ConnectedChannel {
        id: row.try_get("id").context("failed to read channel id")?,
        org_id: row.try_get("org_id").context("failed to read channel org_id")?,
        platform: platform_value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid platform in database: {platform_value}"))?,
        platform_channel_id: row
            .try_get("platform_channel_id")
            .context("failed to read platform_channel_id")?,
        default_repository_url: row.try_get("default_repository_url").ok(),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read channel created_at")?,
    })
}
