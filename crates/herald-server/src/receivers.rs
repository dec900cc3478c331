//! Receiver testing with a bounded worker pool.
//!
//! A test request fans one synthetic alert out to every integration of
//! every named receiver. Deliveries run concurrently but never more
//! than [`ReceiverTestSupervisor::max_workers`] at a time, and the
//! whole batch shares one deadline. Integrations whose configuration
//! fails to build are reported as immediate failures without ever
//! occupying a worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::debug;

use herald_core::{
    DispatchEngine, IntegrationConfig, IntegrationFactory, IntegrationTestResult, TestAlert,
    TestStatus,
};

pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A receiver to test: a name and its integrations.
#[derive(Debug, Clone)]
pub struct TestReceiver {
    pub name: String,
    pub integrations: Vec<IntegrationConfig>,
}

/// Outcome of testing one integration.
#[derive(Debug, Clone)]
pub struct IntegrationOutcome {
    pub kind: String,
    /// Position of the integration within its receiver.
    pub index: usize,
    pub status: TestStatus,
    pub error: Option<String>,
}

/// Per-receiver test results, in the order the receivers were given.
#[derive(Debug, Clone)]
pub struct ReceiverTestResult {
    pub name: String,
    pub outcomes: Vec<IntegrationOutcome>,
}

#[derive(Debug, Error)]
pub enum ReceiverTestError {
    /// The request named no receivers at all.
    #[error("no receivers to test")]
    NoReceivers,
}

struct Job {
    receiver_index: usize,
    integration_index: usize,
    receiver_name: Arc<str>,
    config: IntegrationConfig,
}

/// Runs receiver tests against a dispatch engine.
pub struct ReceiverTestSupervisor {
    factory: Arc<dyn IntegrationFactory>,
    max_workers: usize,
    timeout: Duration,
}

impl ReceiverTestSupervisor {
    pub fn new(factory: Arc<dyn IntegrationFactory>) -> Self {
        Self {
            factory,
            max_workers: DEFAULT_MAX_WORKERS,
            timeout: DEFAULT_TEST_TIMEOUT,
        }
    }

    pub fn with_limits(mut self, max_workers: usize, timeout: Duration) -> Self {
        self.max_workers = max_workers.max(1);
        self.timeout = timeout;
        self
    }

    /// Tests every integration of every receiver and returns one result
    /// per receiver, in request order. Receivers with no integrations
    /// yield a result with zero outcomes.
    pub async fn test_receivers(
        &self,
        engine: Arc<dyn DispatchEngine>,
        receivers: &[TestReceiver],
    ) -> Result<Vec<ReceiverTestResult>, ReceiverTestError> {
        if receivers.is_empty() {
            return Err(ReceiverTestError::NoReceivers);
        }

        // One outcome slot per integration, filled either up front (the
        // configuration failed to build) or by a worker.
        let mut slots: Vec<Vec<Option<IntegrationOutcome>>> = receivers
            .iter()
            .map(|r| vec![None; r.integrations.len()])
            .collect();
        let mut jobs = VecDeque::new();

        for (receiver_index, receiver) in receivers.iter().enumerate() {
            let name: Arc<str> = receiver.name.as_str().into();
            for (integration_index, config) in receiver.integrations.iter().enumerate() {
                match self.factory.build(config) {
                    Ok(_) => jobs.push_back(Job {
                        receiver_index,
                        integration_index,
                        receiver_name: Arc::clone(&name),
                        config: config.clone(),
                    }),
                    Err(e) => {
                        slots[receiver_index][integration_index] = Some(IntegrationOutcome {
                            kind: config.kind.clone(),
                            index: integration_index,
                            status: TestStatus::Failed,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
        }

        let job_count = jobs.len();
        if job_count > 0 {
            let workers = self.max_workers.min(job_count);
            debug!(jobs = job_count, workers, "running receiver tests");

            let queue = Arc::new(Mutex::new(jobs));
            let (tx, mut rx) = mpsc::channel(job_count);
            let deadline = Instant::now() + self.timeout;

            for _ in 0..workers {
                let queue = Arc::clone(&queue);
                let engine = Arc::clone(&engine);
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = match queue.lock().await.pop_front() {
                            Some(job) => job,
                            None => break,
                        };
                        let result = run_job(engine.as_ref(), &job, deadline).await;
                        let outcome = IntegrationOutcome {
                            kind: job.config.kind.clone(),
                            index: job.integration_index,
                            status: result.status,
                            error: result.error,
                        };
                        if tx
                            .send((job.receiver_index, job.integration_index, outcome))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            while let Some((receiver_index, integration_index, outcome)) = rx.recv().await {
                slots[receiver_index][integration_index] = Some(outcome);
            }
        }

        let results = receivers
            .iter()
            .zip(slots)
            .map(|(receiver, outcomes)| ReceiverTestResult {
                name: receiver.name.clone(),
                outcomes: outcomes
                    .into_iter()
                    .enumerate()
                    .map(|(index, slot)| {
                        slot.unwrap_or_else(|| IntegrationOutcome {
                            kind: receiver.integrations[index].kind.clone(),
                            index,
                            status: TestStatus::Failed,
                            error: Some("test worker exited before reporting".to_string()),
                        })
                    })
                    .collect(),
            })
            .collect();
        Ok(results)
    }
}

async fn run_job(engine: &dyn DispatchEngine, job: &Job, deadline: Instant) -> IntegrationTestResult {
    let alert = TestAlert::synthetic(&job.receiver_name);
    match tokio::time::timeout_at(
        deadline,
        engine.test_integration(&job.receiver_name, &job.config, &alert),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => IntegrationTestResult::timeout("test deadline exceeded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::DefaultIntegrationFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use herald_core::{EngineError, EngineStatus, RoutingConfig, StateBlob};

    /// Engine whose test calls sleep for a fixed time and track
    /// concurrency, returning ok.
    struct SlowEngine {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowEngine {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DispatchEngine for SlowEngine {
        fn ready(&self) -> bool {
            true
        }

        async fn apply_config(&self, _: &RoutingConfig, _: &[u8]) -> Result<(), EngineError> {
            Ok(())
        }

        fn merge_state(&self, _: StateBlob) -> Result<(), EngineError> {
            Ok(())
        }

        fn status(&self) -> EngineStatus {
            EngineStatus::default()
        }

        async fn test_integration(
            &self,
            _receiver: &str,
            _integration: &IntegrationConfig,
            _alert: &TestAlert,
        ) -> IntegrationTestResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            IntegrationTestResult::ok()
        }

        async fn stop(&self) {}
    }

    fn factory() -> Arc<dyn IntegrationFactory> {
        Arc::new(DefaultIntegrationFactory::new())
    }

    fn log_integration() -> IntegrationConfig {
        IntegrationConfig {
            kind: "log".to_string(),
            settings: serde_json::Value::Null,
        }
    }

    fn receiver(name: &str, integrations: Vec<IntegrationConfig>) -> TestReceiver {
        TestReceiver {
            name: name.to_string(),
            integrations,
        }
    }

    #[tokio::test]
    async fn empty_request_is_an_error() {
        let supervisor = ReceiverTestSupervisor::new(factory());
        let engine = Arc::new(SlowEngine::new(Duration::ZERO));
        let err = supervisor.test_receivers(engine, &[]).await.unwrap_err();
        assert!(matches!(err, ReceiverTestError::NoReceivers));
    }

    #[tokio::test]
    async fn receivers_without_integrations_yield_empty_outcomes() {
        let supervisor = ReceiverTestSupervisor::new(factory());
        let engine = Arc::new(SlowEngine::new(Duration::ZERO));
        let results = supervisor
            .test_receivers(
                engine.clone(),
                &[receiver("a", vec![]), receiver("b", vec![])],
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcomes.is_empty()));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_configs_fail_without_reaching_the_engine() {
        let supervisor = ReceiverTestSupervisor::new(factory());
        let engine = Arc::new(SlowEngine::new(Duration::ZERO));
        let bad = IntegrationConfig {
            kind: "pager".to_string(),
            settings: serde_json::Value::Null,
        };
        let results = supervisor
            .test_receivers(
                engine.clone(),
                &[receiver("ops", vec![bad, log_integration()])],
            )
            .await
            .unwrap();
        assert_eq!(results[0].outcomes.len(), 2);
        assert_eq!(results[0].outcomes[0].status, TestStatus::Failed);
        assert!(results[0].outcomes[0].error.as_deref().unwrap().contains("pager"));
        assert_eq!(results[0].outcomes[1].status, TestStatus::Ok);
        // only the valid integration was delivered
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outcomes_keep_request_order() {
        let supervisor = ReceiverTestSupervisor::new(factory());
        let engine = Arc::new(SlowEngine::new(Duration::from_millis(5)));
        let results = supervisor
            .test_receivers(
                engine,
                &[
                    receiver("a", vec![log_integration(), log_integration()]),
                    receiver("b", vec![log_integration()]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(results[0].name, "a");
        assert_eq!(results[0].outcomes.len(), 2);
        assert_eq!(results[0].outcomes[0].index, 0);
        assert_eq!(results[0].outcomes[1].index, 1);
        assert_eq!(results[1].name, "b");
        assert_eq!(results[1].outcomes.len(), 1);
    }

    #[tokio::test]
    async fn pool_never_exceeds_max_workers() {
        let supervisor =
            ReceiverTestSupervisor::new(factory()).with_limits(2, Duration::from_secs(5));
        let engine = Arc::new(SlowEngine::new(Duration::from_millis(30)));
        let integrations = vec![log_integration(); 6];
        supervisor
            .test_receivers(engine.clone(), &[receiver("ops", integrations)])
            .await
            .unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 6);
        assert!(engine.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn deadline_turns_slow_deliveries_into_timeouts() {
        let supervisor =
            ReceiverTestSupervisor::new(factory()).with_limits(4, Duration::from_millis(20));
        let engine = Arc::new(SlowEngine::new(Duration::from_secs(30)));
        let results = supervisor
            .test_receivers(engine, &[receiver("ops", vec![log_integration(); 3])])
            .await
            .unwrap();
        assert!(results[0]
            .outcomes
            .iter()
            .all(|o| o.status == TestStatus::Timeout));
    }
}
