//! Periodic background loops: the reclamation sweep and backend session
//! refresh. Both stop when their cancellation token fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, SessionCache};
use crate::config::PortainerCredential;
use crate::engine::Engine;

pub struct ReclaimWorker {
    engine: Arc<Engine>,
    period: Duration,
}

impl ReclaimWorker {
    pub fn new(engine: Arc<Engine>, period: Duration) -> Self {
        Self { engine, period }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        // A slow sweep delays the next one instead of bunching ticks up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?self.period, "reclaim worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reclaimed = self.engine.reclaim_due().await;
                    debug!(reclaimed, "reclaim tick");
                }
            }
        }
        info!("reclaim worker stopped");
    }
}

pub struct RefreshWorker {
    backend: Arc<dyn Backend>,
    sessions: Arc<SessionCache>,
    credentials: Vec<PortainerCredential>,
    period: Duration,
}

impl RefreshWorker {
    pub fn new(
        backend: Arc<dyn Backend>,
        sessions: Arc<SessionCache>,
        credentials: Vec<PortainerCredential>,
        period: Duration,
    ) -> Self {
        Self {
            backend,
            sessions,
            credentials,
            period,
        }
    }

    /// Log in to every endpoint once. An endpoint that fails keeps whatever
    /// token it had. Returns how many endpoints now hold a fresh token.
    pub async fn refresh_all(&self) -> usize {
        let mut refreshed = 0;
        for credential in &self.credentials {
            match self
                .backend
                .authenticate(&credential.url, &credential.username, &credential.password)
                .await
            {
                Ok(token) => {
                    self.sessions.set(&credential.url, token);
                    refreshed += 1;
                }
                Err(err) => {
                    warn!(endpoint = %credential.url, error = %err, "session refresh failed");
                }
            }
        }
        debug!(refreshed, total = self.credentials.len(), "sessions refreshed");
        refreshed
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and startup already logged in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh_all().await;
                }
            }
        }
        info!("session refresh worker stopped");
    }
}

/// Wait for spawned workers after shutdown. A worker that panicked or was
/// aborted is logged. Returns how many ended that way.
pub async fn join_workers(handles: Vec<(&'static str, JoinHandle<()>)>) -> usize {
    let mut abnormal = 0;
    for (worker, handle) in handles {
        if let Err(err) = handle.await {
            error!(worker, error = %err, "background worker ended abnormally");
            abnormal += 1;
        }
    }
    abnormal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{Call, FakeBackend};
    use crate::balancer::{BalanceStrategy, Balancer};
    use crate::engine::EngineSettings;
    use crate::models::Challenge;
    use crate::ports::PortAllocator;
    use crate::store::MemoryStore;
    use crate::tasks::TaskQueue;

    fn credential(url: &str) -> PortainerCredential {
        PortainerCredential {
            url: url.into(),
            username: "admin".into(),
            password: "password".into(),
        }
    }

    fn refresher(backend: &Arc<FakeBackend>, sessions: &Arc<SessionCache>) -> RefreshWorker {
        RefreshWorker::new(
            Arc::clone(backend) as Arc<dyn Backend>,
            Arc::clone(sessions),
            vec![credential("https://a:9443"), credential("https://b:9443")],
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_refresh_all_stores_tokens() {
        let backend = Arc::new(FakeBackend::new());
        let sessions = Arc::new(SessionCache::new());

        assert_eq!(refresher(&backend, &sessions).refresh_all().await, 2);
        assert!(sessions.get("https://a:9443").is_some());
        assert!(sessions.get("https://b:9443").is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_old_token() {
        let backend = Arc::new(FakeBackend::new());
        let sessions = Arc::new(SessionCache::new());
        sessions.set("https://a:9443", "old".into());
        backend.fail_auth(true);

        assert_eq!(refresher(&backend, &sessions).refresh_all().await, 0);
        assert_eq!(sessions.get("https://a:9443").as_deref(), Some("old"));
        assert_eq!(sessions.get("https://b:9443"), None);
    }

    #[tokio::test]
    async fn test_refresh_worker_runs_until_cancelled() {
        let backend = Arc::new(FakeBackend::new());
        let sessions = Arc::new(SessionCache::new());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(refresher(&backend, &sessions).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(70)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let logins = backend
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Authenticate { .. }))
            .count();
        assert!(logins >= 2, "expected at least one refresh round, got {logins} logins");
    }

    #[tokio::test]
    async fn test_reclaim_worker_tears_down_due_instances() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Arc::new(Engine::new(
            EngineSettings {
                max_instances: 4,
                instance_duration: Duration::ZERO,
                extend_threshold: Duration::from_secs(60),
                reclaim_retry: Duration::from_secs(1),
            },
            Arc::new(MemoryStore::new()),
            Arc::clone(&backend) as Arc<dyn Backend>,
            PortAllocator::new([8000]),
            Balancer::new(BalanceStrategy::Random, vec!["https://a:9443".into()]),
            TaskQueue::start(8, 2),
        ));
        let challenge = engine
            .add_challenge(Challenge {
                challenge_name: "web".into(),
                image_name: "nginx".into(),
                internal_port: 80,
                ..Challenge::default()
            })
            .await
            .unwrap();
        engine.add_instance("alice", &challenge.challenge_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), engine.tasks().wait_idle())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let worker = ReclaimWorker::new(Arc::clone(&engine), Duration::from_millis(10));
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        for _ in 0..100 {
            if backend.deletes() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(backend.deletes(), 1);
        assert_eq!(engine.live_instances(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_join_workers_reports_panicked_worker() {
        let clean = tokio::spawn(async {});
        let panicked = tokio::spawn(async { panic!("worker blew up") });

        let abnormal = join_workers(vec![("clean", clean), ("broken", panicked)]).await;
        assert_eq!(abnormal, 1);
    }
}
