//! Dispatcher: periodic tick loop driving the three sub-tasks that keep jobs
//! moving without an operator in the loop (spec.md §4.5). Each sub-task runs
//! under its own row in `dispatcher_leases` so a multi-coordinator deployment
//! never runs the same sub-task twice at once.

use crate::channel::MessageChannel;
use crate::config::DispatcherConfig;
use crate::db::TransactionManager;
use crate::db::jobs::JobRepo;
use crate::db::leases::LeaseRepo;
use crate::registry::Registry;
use crate::statemachine::StateMachine;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Dispatcher {
    holder: String,
    tx: TransactionManager,
    leases: LeaseRepo,
    jobs: JobRepo,
    registry: Registry,
    statemachine: StateMachine,
    channel: MessageChannel,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        tx: TransactionManager,
        leases: LeaseRepo,
        jobs: JobRepo,
        registry: Registry,
        statemachine: StateMachine,
        channel: MessageChannel,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            holder: uuid::Uuid::new_v4().to_string(),
            tx,
            leases,
            jobs,
            registry,
            statemachine,
            channel,
            config,
        }
    }

    /// Background task: fires on `tick` and on every `dispatch_notify` wakeup
    /// so a freshly-queued message doesn't wait out a full tick.
    pub fn spawn(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dispatcher.config.tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = dispatcher.channel.dispatch_notify.notified() => {}
                }
                dispatcher.tick().await;
            }
        })
    }

    async fn tick(&self) {
        self.run_leased("promote_queued", Self::promote_queued).await;
        self.run_leased("idle_job_cleanup", Self::idle_job_cleanup).await;
        self.run_leased("inactive_agent_sweep", Self::inactive_agent_sweep).await;
    }

    /// Acquire `task_name`'s lease, run `body`, then release it early rather
    /// than waiting out `lease_duration` — a no-op if another coordinator
    /// already holds it.
    async fn run_leased<F, Fut>(&self, task_name: &str, body: F)
    where
        F: FnOnce(Self) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let lease_duration = chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(15));
        let expires_at = chrono::Utc::now() + lease_duration;

        match self.leases.acquire(task_name, &self.holder, expires_at).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                tracing::warn!(%error, task_name, "failed to acquire dispatcher lease");
                return;
            }
        }

        body(self.clone()).await;

        if let Err(error) = self.leases.release(task_name, &self.holder).await {
            tracing::warn!(%error, task_name, "failed to release dispatcher lease");
        }
    }

    async fn promote_queued(self) {
        match self.statemachine.promote_queued().await {
            Ok(promoted) if promoted > 0 => tracing::debug!(promoted, "promote-queued advanced jobs"),
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "promote-queued sub-task failed"),
        }
    }

    async fn idle_job_cleanup(self) {
        let idle_for = chrono::Duration::from_std(self.config.job_idle).unwrap_or_else(|_| chrono::Duration::zero());
        let jobs = match self.jobs.list_idle_completed(idle_for).await {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::warn!(%error, "idle-job-cleanup failed to list idle jobs");
                return;
            }
        };

        for job in jobs {
            let job_id = job.id.clone();
            let result = self
                .tx
                .run(|| async { self.jobs.delete_with_messages(&job_id).await })
                .await;
            match result {
                Ok(()) => tracing::info!(job_id = %job.id, "idle job cleaned up"),
                Err(error) => tracing::warn!(%error, job_id = %job.id, "failed to delete idle job"),
            }
        }
    }

    async fn inactive_agent_sweep(self) {
        let agents = match self.registry.inactive(self.config.agent_inactive_threshold).await {
            Ok(agents) => agents,
            Err(error) => {
                tracing::warn!(%error, "inactive-agent-sweep failed to list inactive agents");
                return;
            }
        };

        let mut any_demoted = false;
        for agent in agents {
            let released_job_ids = match self.registry.deregister(&agent.org_id, &agent.ccagent_id).await {
                Ok(job_ids) => job_ids,
                Err(error) => {
                    tracing::warn!(%error, ccagent_id = %agent.ccagent_id, "failed to evict inactive agent");
                    continue;
                }
            };

            for job_id in &released_job_ids {
                if let Err(error) = self.statemachine.demote_job(job_id).await {
                    tracing::warn!(%error, %job_id, "failed to demote job after inactive agent eviction");
                }
            }
            any_demoted |= !released_job_ids.is_empty();

            tracing::info!(ccagent_id = %agent.ccagent_id, "evicted inactive agent");
        }

        if any_demoted {
            self.channel.dispatch_notify.notify_waiters();
        }
    }
}
