// Guest-readiness polling through the simulated guest-attribute channel.

use anyhow::Result;
use gce_lab_manager::core::readiness::{ReadyStatus, STARTUP_QUERY_PATH};
use gce_lab_manager::core::simulated::SimulatedCloud;
use gce_lab_manager::core::{wait_for_guest_attribute, GuestScript, InstanceTarget, PollSettings, ReadinessCondition};
use gce_lab_manager::errors::ReadinessError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn condition(instance: &str, deadline: Option<Duration>) -> ReadinessCondition {
    let target = InstanceTarget {
        project: "lab-project".into(),
        zone: "us-central1-c".into(),
        instance: instance.into(),
    };
    ReadinessCondition::startup_completed(
        target,
        PollSettings {
            interval: Duration::from_secs(10),
            deadline,
        },
    )
}

// Not found five times, then completed: ready on the sixth poll, 50s later
#[tokio::test(start_paused = true)]
async fn test_ready_after_five_absent_polls() -> Result<()> {
    let cloud = SimulatedCloud::new("lab-project").with_script("lab-vm-0", GuestScript::completes_after(5));
    let start = Instant::now();

    let marker = wait_for_guest_attribute(&cloud, &condition("lab-vm-0", None), &CancellationToken::new()).await?;

    assert_eq!(marker.id, "lab-vm-0-ready");
    assert_eq!(marker.status, ReadyStatus::Ready);
    assert_eq!(marker.polls, 6);
    assert_eq!(cloud.polls_of("lab-vm-0"), 6);
    assert_eq!(start.elapsed(), Duration::from_secs(50));
    Ok(())
}

// A guest reporting failure ends polling for good
#[tokio::test(start_paused = true)]
async fn test_guest_failure_is_not_retried() -> Result<()> {
    let cloud = SimulatedCloud::new("lab-project").with_script("lab-vm-0", GuestScript::reports(2, "failed"));

    let err = wait_for_guest_attribute(&cloud, &condition("lab-vm-0", None), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ReadinessError::GuestReportedFailure {
            condition: "lab-vm-0-ready".into(),
            instance: "lab-vm-0".into(),
            query_path: STARTUP_QUERY_PATH.into(),
            value: "failed".into(),
        }
    );
    assert_eq!(cloud.polls_of("lab-vm-0"), 3);
    assert!(err.to_string().contains("status/startup == failed for instance lab-vm-0"));
    Ok(())
}

// Unrelated values keep the condition pending until the deadline
#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_an_unresponsive_guest() -> Result<()> {
    let cloud = SimulatedCloud::new("lab-project").with_script("lab-vm-0", GuestScript::reports(0, "installing"));

    let err = wait_for_guest_attribute(
        &cloud,
        &condition("lab-vm-0", Some(Duration::from_secs(45))),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ReadinessError::TimedOut { after, .. } if after == Duration::from_secs(45)));
    assert_eq!(cloud.polls_of("lab-vm-0"), 5);
    Ok(())
}

// Sibling conditions poll concurrently: total time is the slowest, not the sum
#[tokio::test(start_paused = true)]
async fn test_conditions_poll_concurrently() -> Result<()> {
    let cloud = SimulatedCloud::new("lab-project")
        .with_script("a", GuestScript::completes_after(1))
        .with_script("b", GuestScript::completes_after(3))
        .with_script("c", GuestScript::completes_after(2));
    let cancel = CancellationToken::new();
    let conditions: Vec<ReadinessCondition> = ["a", "b", "c"].iter().map(|i| condition(i, None)).collect();
    let start = Instant::now();

    let markers = futures::future::try_join_all(
        conditions
            .iter()
            .map(|c| wait_for_guest_attribute(&cloud, c, &cancel)),
    )
    .await?;

    let polls: Vec<u32> = markers.iter().map(|m| m.polls).collect();
    assert_eq!(polls, vec![2, 4, 3]);
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    Ok(())
}
