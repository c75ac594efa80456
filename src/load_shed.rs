//! Concurrency accounting and priority-based shedding.
//!
//! Admission is a two-step gate: per-priority queue caps reject outright,
//! then the load level sheds low-priority classes. Admitted requests wait on
//! a semaphore bounded by the global concurrency cap. The returned permit
//! releases every counter on drop, so cancellation and error paths cannot
//! leak capacity.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::metrics::{self, MetricsSink};
use crate::models::metrics::MetricEvent;
use crate::store::{Store, date_key, now_ts};

pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 4;

#[derive(Debug, Clone, Copy)]
pub struct ShedConfig {
    pub max_concurrent: u32,
    /// Queue caps indexed by priority − 1. Priority 1 is effectively
    /// unbounded.
    pub queue_caps: [u32; 4],
}

impl Default for ShedConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 25,
            queue_caps: [u32::MAX, 50, 20, 5],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl LoadLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadLevel::Normal => "normal",
            LoadLevel::Elevated => "elevated",
            LoadLevel::High => "high",
            LoadLevel::Critical => "critical",
        }
    }

    /// Priorities shed at this level.
    fn sheds(&self, priority: u8) -> bool {
        match self {
            LoadLevel::Normal => false,
            LoadLevel::Elevated => priority >= 4,
            LoadLevel::High | LoadLevel::Critical => priority >= 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedReason {
    QueueFull,
    LoadShed,
}

impl ShedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShedReason::QueueFull => "queue_full",
            ShedReason::LoadShed => "load_shed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadState {
    pub load_level: LoadLevel,
    pub active_requests: u32,
    pub max_concurrent: u32,
    pub load_percent: f64,
    pub queue_depths: [u32; 4],
    pub today_shed_counts: [i64; 4],
}

pub struct LoadShedder {
    store: Arc<Store>,
    metrics: MetricsSink,
    config: ShedConfig,
    semaphore: Arc<Semaphore>,
    active: AtomicU32,
    queues: [AtomicU32; 4],
}

impl LoadShedder {
    pub fn new(store: Arc<Store>, metrics: MetricsSink, config: ShedConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            metrics,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            config,
            active: AtomicU32::new(0),
            queues: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        })
    }

    pub fn load_level(&self) -> LoadLevel {
        let ratio = self.active.load(Ordering::Relaxed) as f64 / self.config.max_concurrent as f64;
        if ratio < 0.5 {
            LoadLevel::Normal
        } else if ratio < 0.75 {
            LoadLevel::Elevated
        } else if ratio < 0.9 {
            LoadLevel::High
        } else {
            LoadLevel::Critical
        }
    }

    /// Admit a request at the given priority, waiting for capacity if the
    /// global cap is reached. Rejections record a shed event.
    pub async fn acquire(&self, priority: u8) -> Result<LoadPermit<'_>, ShedReason> {
        let priority = priority.clamp(PRIORITY_MIN, PRIORITY_MAX);
        let idx = (priority - 1) as usize;

        if self.queues[idx].load(Ordering::Relaxed) >= self.config.queue_caps[idx] {
            self.record_shed(priority, ShedReason::QueueFull);
            return Err(ShedReason::QueueFull);
        }
        let level = self.load_level();
        if level.sheds(priority) {
            self.record_shed(priority, ShedReason::LoadShed);
            return Err(ShedReason::LoadShed);
        }

        self.queues[idx].fetch_add(1, Ordering::Relaxed);
        let queue_guard = QueueGuard {
            shedder: self,
            idx,
        };
        let semaphore = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Semaphore closed; never happens in practice.
                self.record_shed(priority, ShedReason::LoadShed);
                return Err(ShedReason::LoadShed);
            }
        };
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(LoadPermit {
            queue_guard,
            _semaphore: semaphore,
        })
    }

    fn record_shed(&self, priority: u8, reason: ShedReason) {
        if let Err(e) = self
            .store
            .shed_count_increment(&date_key(Utc::now()), priority)
        {
            tracing::warn!("load shedder: failed to record shed count: {e}");
        }
        self.metrics.emit(MetricEvent::new(
            metrics::REQUEST_SHED,
            priority as f64,
            now_ts(),
        ));
        tracing::debug!("load shedder: rejected p{priority} ({})", reason.as_str());
    }

    pub fn snapshot(&self) -> anyhow::Result<LoadState> {
        let active = self.active.load(Ordering::Relaxed);
        let mut today_shed_counts = [0i64; 4];
        for (priority, count) in self.store.shed_counts_for_day(&date_key(Utc::now()))? {
            if (1..=4).contains(&priority) {
                today_shed_counts[(priority - 1) as usize] = count;
            }
        }
        Ok(LoadState {
            load_level: self.load_level(),
            active_requests: active,
            max_concurrent: self.config.max_concurrent,
            load_percent: active as f64 / self.config.max_concurrent as f64 * 100.0,
            queue_depths: [
                self.queues[0].load(Ordering::Relaxed),
                self.queues[1].load(Ordering::Relaxed),
                self.queues[2].load(Ordering::Relaxed),
                self.queues[3].load(Ordering::Relaxed),
            ],
            today_shed_counts,
        })
    }

    #[cfg(test)]
    fn active_count(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }
}

struct QueueGuard<'a> {
    shedder: &'a LoadShedder,
    idx: usize,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.shedder.queues[self.idx].fetch_sub(1, Ordering::Relaxed);
    }
}

/// Scoped admission. Dropping it releases the queue slot, the active count
/// and the concurrency permit, on every exit path.
pub struct LoadPermit<'a> {
    queue_guard: QueueGuard<'a>,
    _semaphore: OwnedSemaphorePermit,
}

impl Drop for LoadPermit<'_> {
    fn drop(&mut self) {
        // Queue slot itself is released by the inner guard.
        self.queue_guard
            .shedder
            .active
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shedder_with_cap(max: u32) -> Arc<LoadShedder> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let metrics = crate::metrics::spawn(store.clone());
        LoadShedder::new(
            store,
            metrics,
            ShedConfig {
                max_concurrent: max,
                ..ShedConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn normal_load_admits_every_priority() {
        let shedder = shedder_with_cap(25);
        for priority in 1..=4 {
            let permit = shedder.acquire(priority).await;
            assert!(permit.is_ok(), "p{priority} rejected at idle");
        }
    }

    #[tokio::test]
    async fn permits_release_on_drop() {
        let shedder = shedder_with_cap(25);
        {
            let _a = shedder.acquire(1).await.unwrap();
            let _b = shedder.acquire(2).await.unwrap();
            assert_eq!(shedder.active_count(), 2);
            let snap = shedder.snapshot().unwrap();
            assert_eq!(snap.queue_depths[0], 1);
            assert_eq!(snap.queue_depths[1], 1);
        }
        assert_eq!(shedder.active_count(), 0);
        let snap = shedder.snapshot().unwrap();
        assert_eq!(snap.queue_depths, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn full_load_sheds_p4_and_p3_but_not_p1() {
        let shedder = shedder_with_cap(4);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(shedder.acquire(1).await.unwrap());
        }
        assert_eq!(shedder.load_level(), LoadLevel::Critical);
        assert_eq!(shedder.acquire(4).await.err(), Some(ShedReason::LoadShed));
        assert_eq!(shedder.acquire(3).await.err(), Some(ShedReason::LoadShed));

        // P1 waits for capacity instead of being shed
        let waiting = {
            let shedder = shedder.clone();
            tokio::spawn(async move {
                let permit = shedder.acquire(1).await;
                assert!(permit.is_ok());
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());
        held.pop();
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn elevated_load_sheds_only_p4() {
        let shedder = shedder_with_cap(10);
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(shedder.acquire(1).await.unwrap());
        }
        // 6/10 = 0.6 → elevated
        assert_eq!(shedder.load_level(), LoadLevel::Elevated);
        assert!(shedder.acquire(3).await.is_ok());
        assert_eq!(shedder.acquire(4).await.err(), Some(ShedReason::LoadShed));
    }

    #[tokio::test]
    async fn queue_caps_reject_before_load_levels() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let metrics = crate::metrics::spawn(store.clone());
        let shedder = LoadShedder::new(
            store,
            metrics,
            ShedConfig {
                max_concurrent: 100,
                queue_caps: [u32::MAX, 50, 20, 2],
            },
        );
        let _a = shedder.acquire(4).await.unwrap();
        let _b = shedder.acquire(4).await.unwrap();
        assert_eq!(shedder.acquire(4).await.err(), Some(ShedReason::QueueFull));
    }

    #[tokio::test]
    async fn shed_events_are_counted_per_day() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let metrics = crate::metrics::spawn(store.clone());
        let shedder = LoadShedder::new(
            store.clone(),
            metrics,
            ShedConfig {
                max_concurrent: 100,
                queue_caps: [u32::MAX, 50, 20, 0],
            },
        );
        let _ = shedder.acquire(4).await;
        let _ = shedder.acquire(4).await;
        let snap = shedder.snapshot().unwrap();
        assert_eq!(snap.today_shed_counts[3], 2);
    }
}
