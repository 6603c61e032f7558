use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::store::ConversationStore;
use crate::utils::cancel::CancelFlag;

/// Deletes old or surplus conversations. Pinned conversations are never
/// touched, and a conversation that changes while a sweep runs survives it.
#[derive(Clone)]
pub struct RetentionManager {
    store: Arc<ConversationStore>,
    max_age: Duration,
    max_count: usize,
}

impl RetentionManager {
    pub fn new(store: Arc<ConversationStore>, config: &RetentionConfig) -> Self {
        Self {
            store,
            max_age: config.max_age(),
            max_count: config.max_count,
        }
    }

    /// Sweep with the configured limits
    pub fn run(&self, cancel: &CancelFlag) -> usize {
        self.sweep(self.max_age, self.max_count, cancel)
    }

    /// Oldest unpinned conversations go first. A conversation is deleted while
    /// it is older than `max_age` or more than `max_count` unpinned ones remain.
    /// Returns how many were deleted.
    pub fn sweep(&self, max_age: Duration, max_count: usize, cancel: &CancelFlag) -> usize {
        let mut candidates: Vec<_> = self
            .store
            .activity()
            .into_iter()
            .filter(|a| !a.pinned)
            .collect();
        candidates.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));

        let cutoff = ChronoDuration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let mut remaining = candidates.len();
        let mut deleted = 0;

        for activity in candidates {
            if cancel.is_cancelled() {
                info!("Retention sweep cancelled after deleting {} conversations", deleted);
                return deleted;
            }

            let expired = cutoff.is_some_and(|cutoff| activity.updated_at <= cutoff);
            if !expired && remaining <= max_count {
                break;
            }

            if self.store.delete_if_idle(activity.id, activity.updated_at) {
                deleted += 1;
            } else {
                debug!("Conversation {} changed during sweep, keeping it", activity.id);
            }
            remaining -= 1;
        }

        if deleted > 0 {
            info!("Retention sweep deleted {} conversations", deleted);
        }
        deleted
    }

    /// Run `run` every `interval` until `cancel` is set
    pub fn spawn_periodic(self, interval: Duration, cancel: CancelFlag) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if cancel.is_cancelled() {
                    break;
                }
                let manager = self.clone();
                let flag = cancel.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || manager.run(&flag)).await {
                    warn!("Retention sweep task failed: {}", e);
                }
            }
            debug!("Retention task stopped");
        })
    }
}
