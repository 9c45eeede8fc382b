//! Guest-readiness conditions.
//!
//! A condition turns a value that a booting instance eventually publishes on its
//! guest-attribute channel into something a deployment can wait on. Each poll has
//! three outcomes: the attribute is absent (keep polling), it equals the expected
//! value (ready), or it equals the error value (failed). Any other API error ends
//! the wait immediately. The expected value is checked before the error value, so
//! a response carrying both reports success.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::provider::{AttributeQueryError, GuestAttribute, GuestAttributes, InstanceTarget};
use crate::errors::ReadinessError;

pub const STARTUP_QUERY_PATH: &str = "status/startup";
pub const STARTUP_COMPLETED: &str = "completed";
pub const STARTUP_FAILED: &str = "failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub interval: Duration,
    /// Upper bound for a single condition; `None` polls until cancelled.
    pub deadline: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCondition {
    pub name: String,
    pub target: InstanceTarget,
    pub query_path: String,
    pub expected_value: String,
    pub error_value: Option<String>,
    pub poll_interval: Duration,
    pub deadline: Option<Duration>,
}

impl ReadinessCondition {
    pub fn new(
        target: InstanceTarget,
        query_path: impl Into<String>,
        expected_value: impl Into<String>,
        poll: PollSettings,
    ) -> Self {
        Self {
            name: format!("{}-ready", target.instance),
            target,
            query_path: query_path.into(),
            expected_value: expected_value.into(),
            error_value: None,
            poll_interval: poll.interval,
            deadline: poll.deadline,
        }
    }

    pub fn with_error_value(mut self, value: impl Into<String>) -> Self {
        self.error_value = Some(value.into());
        self
    }

    /// Gate on the startup script publishing `status/startup = completed`.
    pub fn startup_completed(target: InstanceTarget, poll: PollSettings) -> Self {
        Self::new(target, STARTUP_QUERY_PATH, STARTUP_COMPLETED, poll).with_error_value(STARTUP_FAILED)
    }

    /// Last segment of the query path; the key items are matched on.
    pub fn attribute_key(&self) -> &str {
        self.query_path.rsplit('/').next().unwrap_or(&self.query_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyStatus {
    Ready,
}

/// Dependency anchor produced by a satisfied condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMarker {
    pub id: String,
    pub status: ReadyStatus,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Observation {
    Expected,
    Failed(String),
    Pending(Option<String>),
}

fn observe(items: &[GuestAttribute], key: &str, expected: &str, error_value: Option<&str>) -> Observation {
    let mut values = items.iter().filter(|item| item.key == key).map(|item| item.value.as_str());

    if values.clone().any(|v| v == expected) {
        return Observation::Expected;
    }
    if let Some(error_value) = error_value {
        if let Some(v) = values.clone().find(|v| *v == error_value) {
            return Observation::Failed(v.to_string());
        }
    }
    Observation::Pending(values.next().map(str::to_string))
}

/// Poll until the condition resolves, the deadline passes or `cancel` fires.
pub async fn wait_for_guest_attribute<G>(
    api: &G,
    condition: &ReadinessCondition,
    cancel: &CancellationToken,
) -> Result<ReadyMarker, ReadinessError>
where
    G: GuestAttributes + ?Sized,
{
    info!(
        "Polling {} for {} to be {}",
        condition.target.instance, condition.query_path, condition.expected_value
    );

    let bounded = async {
        match condition.deadline {
            Some(limit) => match tokio::time::timeout(limit, poll_until_terminal(api, condition)).await {
                Ok(result) => result,
                Err(_) => Err(ReadinessError::TimedOut {
                    condition: condition.name.clone(),
                    query_path: condition.query_path.clone(),
                    after: limit,
                }),
            },
            None => poll_until_terminal(api, condition).await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(condition = %condition.name, "readiness polling cancelled");
            Err(ReadinessError::Cancelled { condition: condition.name.clone() })
        }
        result = bounded => result,
    }
}

async fn poll_until_terminal<G>(api: &G, condition: &ReadinessCondition) -> Result<ReadyMarker, ReadinessError>
where
    G: GuestAttributes + ?Sized,
{
    let key = condition.attribute_key();
    let mut polls: u32 = 0;

    loop {
        polls += 1;
        match api.query(&condition.target, &condition.query_path).await {
            Ok(items) => match observe(
                &items,
                key,
                &condition.expected_value,
                condition.error_value.as_deref(),
            ) {
                Observation::Expected => {
                    info!(condition = %condition.name, polls, "instance {} is ready", condition.target.instance);
                    return Ok(ReadyMarker {
                        id: condition.name.clone(),
                        status: ReadyStatus::Ready,
                        polls,
                    });
                }
                Observation::Failed(value) => {
                    error!(
                        condition = %condition.name,
                        query_path = %condition.query_path,
                        value = %value,
                        "guest reported failure"
                    );
                    return Err(ReadinessError::GuestReportedFailure {
                        condition: condition.name.clone(),
                        instance: condition.target.instance.clone(),
                        query_path: condition.query_path.clone(),
                        value,
                    });
                }
                Observation::Pending(current) => {
                    debug!(condition = %condition.name, polls, current = ?current, "not ready yet");
                }
            },
            Err(AttributeQueryError::NotFound) => {
                debug!(condition = %condition.name, polls, "attribute not published yet");
            }
            Err(AttributeQueryError::Api { status, message }) => {
                return Err(ReadinessError::Api {
                    condition: condition.name.clone(),
                    instance: condition.target.instance.clone(),
                    query_path: condition.query_path.clone(),
                    status,
                    message,
                });
            }
        }

        sleep(condition.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::MockGuestAttributes;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    type Reply = Result<Vec<GuestAttribute>, AttributeQueryError>;

    /// Replays canned replies; the last one repeats forever.
    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GuestAttributes for Scripted {
        async fn query(&self, _: &InstanceTarget, _: &str) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        }
    }

    fn attr(key: &str, value: &str) -> GuestAttribute {
        GuestAttribute {
            namespace: "status".into(),
            key: key.into(),
            value: value.into(),
        }
    }

    fn condition() -> ReadinessCondition {
        let target = InstanceTarget {
            project: "lab-project".into(),
            zone: "us-central1-c".into(),
            instance: "lab-k8s-cp-0".into(),
        };
        ReadinessCondition::startup_completed(
            target,
            PollSettings {
                interval: Duration::from_secs(10),
                deadline: None,
            },
        )
    }

    #[test]
    fn test_condition_identity_and_key() {
        let c = condition();
        assert_eq!(c.name, "lab-k8s-cp-0-ready");
        assert_eq!(c.attribute_key(), "startup");
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_attribute_is_retried_at_interval() {
        let mut replies: Vec<Reply> = (0..5).map(|_| Err(AttributeQueryError::NotFound)).collect();
        replies.push(Ok(vec![attr("startup", "completed")]));
        let guest = Scripted::new(replies);

        let started = Instant::now();
        let marker = wait_for_guest_attribute(&guest, &condition(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(marker.id, "lab-k8s-cp-0-ready");
        assert_eq!(marker.status, ReadyStatus::Ready);
        assert_eq!(marker.polls, 6);
        assert_eq!(guest.calls(), 6);
        assert_eq!(started.elapsed(), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_value_terminates_without_retry() {
        let guest = Scripted::new(vec![
            Err(AttributeQueryError::NotFound),
            Ok(vec![attr("startup", "running")]),
            Ok(vec![attr("startup", "failed")]),
            Ok(vec![attr("startup", "completed")]),
        ]);

        let err = wait_for_guest_attribute(&guest, &condition(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ReadinessError::GuestReportedFailure {
                condition: "lab-k8s-cp-0-ready".into(),
                instance: "lab-k8s-cp-0".into(),
                query_path: "status/startup".into(),
                value: "failed".into(),
            }
        );
        assert_eq!(guest.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_value_wins_over_error_value_in_same_response() {
        let guest = Scripted::new(vec![Ok(vec![
            attr("startup", "failed"),
            attr("startup", "completed"),
        ])]);

        let marker = wait_for_guest_attribute(&guest, &condition(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(marker.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_value_for_expected_and_error_reports_success() {
        let c = condition().with_error_value("completed");
        let guest = Scripted::new(vec![Ok(vec![attr("startup", "completed")])]);

        assert!(wait_for_guest_attribute(&guest, &c, &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_keys_under_the_path_are_ignored() {
        let guest = Scripted::new(vec![
            Ok(vec![attr("kubelet", "completed")]),
            Ok(vec![attr("kubelet", "completed"), attr("startup", "completed")]),
        ]);

        let marker = wait_for_guest_attribute(&guest, &condition(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(marker.polls, 2);
    }

    #[tokio::test]
    async fn test_api_error_is_fatal_immediately() {
        let mut guest = MockGuestAttributes::new();
        guest.expect_query().times(1).returning(|_, _| {
            Err(AttributeQueryError::Api {
                status: 403,
                message: "permission denied".into(),
            })
        });

        let err = wait_for_guest_attribute(&guest, &condition(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Api { status: 403, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_polling() {
        let guest = Scripted::new(vec![Err(AttributeQueryError::NotFound)]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(35)).await;
            trigger.cancel();
        });

        let err = wait_for_guest_attribute(&guest, &condition(), &cancel).await.unwrap_err();
        assert_eq!(
            err,
            ReadinessError::Cancelled {
                condition: "lab-k8s-cp-0-ready".into()
            }
        );
        assert_eq!(guest.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_the_wait() {
        let mut c = condition();
        c.deadline = Some(Duration::from_secs(60));
        let guest = Scripted::new(vec![Ok(vec![attr("startup", "running")])]);

        let err = wait_for_guest_attribute(&guest, &c, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::TimedOut { .. }));
    }
}
