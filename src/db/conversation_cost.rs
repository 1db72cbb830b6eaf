//! Conversation Context/Cost repository (SUPPLEMENT). Running per-job token
//! and cost counters, updated additively, never consulted for dispatch.

use crate::db::tx::Exec;
use crate::error::Result;
use crate::with_exec;
use crate::ConversationCost;
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone)]
pub struct ConversationCostRepo {
    pool: SqlitePool,
}

impl ConversationCostRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add(
        &self,
        job_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost_micros: i64,
    ) -> Result<()> {
        with_exec!(self, |ex| {
            sqlx::query(
                "INSERT INTO conversation_costs (job_id, prompt_tokens, completion_tokens, cost_micros) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(job_id) DO UPDATE SET \
                   prompt_tokens = prompt_tokens + excluded.prompt_tokens, \
                   completion_tokens = completion_tokens + excluded.completion_tokens, \
                   cost_micros = cost_micros + excluded.cost_micros",
            )
            .bind(job_id)
            .bind(prompt_tokens)
            .bind(completion_tokens)
            .bind(cost_micros)
            .execute(ex)
            .await
            .context("failed to accumulate conversation cost")?;
        });
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<ConversationCost> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT job_id, prompt_tokens, completion_tokens, cost_micros FROM conversation_costs WHERE job_id = ?",
            )
            .bind(job_id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch conversation cost")?
        });

        match row {
            Some(row) => Ok(ConversationCost {
                job_id: row.try_get("job_id").context("failed to read job_id")?,
                prompt_tokens: row.try_get("prompt_tokens").context("failed to read prompt_tokens")?,
                completion_tokens: row
                    .try_get("completion_tokens")
                    .context("failed to read completion_tokens")?,
                cost_micros: row.try_get("cost_micros").context("failed to read cost_micros")?,
            }),
            None => Ok(ConversationCost {
                job_id: job_id.to_string(),
                ..Default::default()
            }),
        }
    }
}
