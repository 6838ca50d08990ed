//! Auto-close scheduling.
//!
//! A close request arms a one-shot timer; when it fires, the handler closes
//! the ticket under a system identity. Jobs live only in process memory, so
//! pending deadlines are re-armed from the database at startup.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serenity::model::id::GuildId;
use uuid::Uuid;

/// Fired when a job's deadline passes. Receives the ticket, its guild, and
/// the job id that fired.
pub type AutoCloseHandler = Arc<dyn Fn(i64, GuildId, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// One-shot deadline scheduler for ticket auto-close.
pub trait AutoCloseScheduler: Send + Sync {
    /// Arm a timer for a ticket and return its job id.
    fn schedule(&self, ticket_id: i64, guild_id: GuildId, delay: Duration) -> String;

    /// Disarm one job. Returns false when the job already fired or never
    /// existed.
    fn cancel(&self, job_id: &str) -> bool;

    /// Disarm every pending job for a ticket.
    fn cancel_for_ticket(&self, ticket_id: i64);
}

struct ScheduledJob {
    ticket_id: i64,
    handle: tokio::task::JoinHandle<()>,
}

/// Tokio-backed scheduler: one sleeping task per armed job.
///
/// The handler is installed after construction because it closes over the
/// lifecycle service, which itself holds the scheduler.
pub struct TokioScheduler {
    jobs: Arc<DashMap<String, ScheduledJob>>,
    handler: Arc<OnceLock<AutoCloseHandler>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            handler: Arc::new(OnceLock::new()),
        }
    }

    /// Install the fire handler. May be called once.
    pub fn set_handler(&self, handler: AutoCloseHandler) {
        if self.handler.set(handler).is_err() {
            tracing::warn!("auto-close handler installed twice; keeping the first");
        }
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoCloseScheduler for TokioScheduler {
    fn schedule(&self, ticket_id: i64, guild_id: GuildId, delay: Duration) -> String {
        let job_id = Uuid::new_v4().to_string();
        let jobs = self.jobs.clone();
        let handler = self.handler.clone();
        let id_for_task = job_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Claim the entry; a concurrent cancel that wins the race here
            // suppresses the firing.
            if jobs.remove(&id_for_task).is_none() {
                return;
            }
            match handler.get() {
                Some(handler) => handler(ticket_id, guild_id, id_for_task).await,
                None => tracing::error!(
                    ticket_id,
                    "auto-close job fired with no handler installed"
                ),
            }
        });

        self.jobs
            .insert(job_id.clone(), ScheduledJob { ticket_id, handle });
        tracing::debug!(
            ticket_id,
            guild_id = guild_id.get(),
            job_id = %job_id,
            delay_secs = delay.as_secs(),
            "auto-close job scheduled"
        );
        job_id
    }

    fn cancel(&self, job_id: &str) -> bool {
        match self.jobs.remove(job_id) {
            Some((_, job)) => {
                job.handle.abort();
                tracing::debug!(job_id, ticket_id = job.ticket_id, "auto-close job cancelled");
                true
            }
            None => false,
        }
    }

    fn cancel_for_ticket(&self, ticket_id: i64) {
        let ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().ticket_id == ticket_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.cancel(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_handler(counter: Arc<AtomicU32>) -> AutoCloseHandler {
        Arc::new(move |_ticket, _guild, _job| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn job_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let scheduler = TokioScheduler::new();
        scheduler.set_handler(counting_handler(fired.clone()));

        scheduler.schedule(1, GuildId::new(10), Duration::from_millis(10));
        assert_eq!(scheduler.pending_jobs(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn cancelled_job_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let scheduler = TokioScheduler::new();
        scheduler.set_handler(counting_handler(fired.clone()));

        let job_id = scheduler.schedule(1, GuildId::new(10), Duration::from_millis(20));
        assert!(scheduler.cancel(&job_id));
        // Cancelling again is a no-op.
        assert!(!scheduler.cancel(&job_id));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_for_ticket_disarms_all_its_jobs() {
        let fired = Arc::new(AtomicU32::new(0));
        let scheduler = TokioScheduler::new();
        scheduler.set_handler(counting_handler(fired.clone()));

        scheduler.schedule(1, GuildId::new(10), Duration::from_millis(20));
        scheduler.schedule(1, GuildId::new(10), Duration::from_millis(20));
        scheduler.schedule(2, GuildId::new(10), Duration::from_millis(20));

        scheduler.cancel_for_ticket(1);
        assert_eq!(scheduler.pending_jobs(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Only ticket 2's job survived.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
