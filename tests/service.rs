// tests/service.rs

//! Integration tests for the asynchronous preservation service.

mod common;

use aipbag::bag::BagLock;
use aipbag::external::{AcceptAll, DirectoryArchive, IdentityTransform};
use aipbag::service::StatusStore;
use aipbag::{
    CancelOutcome, Collaborators, Error, MetadataTransform, PreservationService, PreservationState,
    PreservationStatus, ServiceEvent, Severity, SipLocation,
};
use common::{ID, local_collaborators, resource_metadata, test_config, write_sip};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(30);

/// Transform that always asks for the build to be re-requested
struct AlwaysBusy {
    calls: Arc<AtomicUsize>,
}

impl MetadataTransform for AlwaysBusy {
    fn to_nerdm(&self, _source: &Value, _identifier: &str) -> aipbag::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Rerequest("upstream metadata service busy".to_string()))
    }
}

/// Transform that takes a while before producing the record
struct SlowTransform {
    delay: Duration,
    finished: Arc<AtomicUsize>,
}

impl SlowTransform {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MetadataTransform for SlowTransform {
    fn to_nerdm(&self, source: &Value, identifier: &str) -> aipbag::Result<Value> {
        std::thread::sleep(self.delay);
        self.finished.fetch_add(1, Ordering::SeqCst);
        IdentityTransform.to_nerdm(source, identifier)
    }
}

fn slow_collaborators(root: &std::path::Path, transform: SlowTransform) -> Collaborators {
    Collaborators::new(
        Arc::new(transform),
        Arc::new(AcceptAll),
        Arc::new(DirectoryArchive::new(root.join("archive"))),
    )
}

/// Poll until the request leaves the queue
async fn wait_until_running(service: &PreservationService, request_id: &str) {
    for _ in 0..250 {
        if service.status(request_id).unwrap().state == PreservationState::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("request {} never started", request_id);
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Submit, retrying while the previous request still holds the identifier
async fn submit_when_free(
    service: &PreservationService,
    identifier: &str,
    sip: &SipLocation,
) -> String {
    for _ in 0..500 {
        match service.submit(identifier, sip.clone()) {
            Ok(id) => return id,
            Err(Error::AlreadyInProgress { .. }) => {
                tokio::time::sleep(Duration::from_millis(20)).await
            }
            Err(e) => panic!("submit failed: {}", e),
        }
    }
    panic!("identifier {} never became free", identifier);
}

#[tokio::test]
async fn test_successful_request_is_archived() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let service =
        PreservationService::new(test_config(dir.path()), local_collaborators(dir.path())).unwrap();
    let mut events = service.subscribe();
    service.start().unwrap();

    let request_id = service.submit(ID, sip).unwrap();
    let status = service.wait(&request_id, WAIT).await.unwrap();

    assert_eq!(status.state, PreservationState::Succeeded, "{}", status);
    assert_eq!(status.prob_count(), 0);
    assert!(dir.path().join("archive/88434-mds2-1234.tar.gz").is_file());
    assert!(dir.path().join("bags/88434-mds2-1234/data/b/c.csv").is_file());

    service.shutdown().await;
    let events = drain_events(&mut events);
    assert!(matches!(events.first(), Some(ServiceEvent::Queued { .. })));
    assert!(events.contains(&ServiceEvent::Succeeded {
        request_id: request_id.clone()
    }));
}

#[tokio::test]
async fn test_one_request_per_identifier_until_terminal() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let service =
        PreservationService::new(test_config(dir.path()), local_collaborators(dir.path())).unwrap();

    let first = service.submit(ID, sip.clone()).unwrap();
    match service.submit(ID, sip.clone()) {
        Err(Error::AlreadyInProgress { request_id, .. }) => assert_eq!(request_id, first),
        other => panic!("expected AlreadyInProgress, got {:?}", other),
    }

    service.start().unwrap();
    let status = service.wait(&first, WAIT).await.unwrap();
    assert_eq!(status.state, PreservationState::Succeeded, "{}", status);

    let second = submit_when_free(&service, ID, &sip).await;
    assert_ne!(first, second);
    let status = service.wait(&second, WAIT).await.unwrap();
    assert_eq!(status.state, PreservationState::Succeeded, "{}", status);
    assert_eq!(
        service.status_for_identifier(ID).unwrap().request_id,
        second
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_rerequest_is_retried_then_fails() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let mut config = test_config(dir.path());
    config.service.max_retries = 1;

    let calls = Arc::new(AtomicUsize::new(0));
    let collaborators = Collaborators::new(
        Arc::new(AlwaysBusy {
            calls: calls.clone(),
        }),
        Arc::new(AcceptAll),
        Arc::new(DirectoryArchive::new(dir.path().join("archive"))),
    );
    let service = PreservationService::new(config, collaborators).unwrap();
    let mut events = service.subscribe();
    service.start().unwrap();

    let request_id = service.submit(ID, sip).unwrap();
    let status = service.wait(&request_id, WAIT).await.unwrap();
    service.shutdown().await;

    assert_eq!(status.state, PreservationState::Failed);
    assert_eq!(status.attempt, 1);
    assert!(!status.retry_eligible);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let requeues: Vec<u32> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ServiceEvent::Requeued { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(requeues, vec![1]);
}

#[tokio::test]
async fn test_invalid_bag_fails_with_issues() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &json!({"accessLevel": "public"}));
    let service =
        PreservationService::new(test_config(dir.path()), local_collaborators(dir.path())).unwrap();
    service.start().unwrap();

    let request_id = service.submit(ID, sip).unwrap();
    let status = service.wait(&request_id, WAIT).await.unwrap();
    service.shutdown().await;

    assert_eq!(status.state, PreservationState::Failed);
    assert!(status.prob_count() >= 1);
    assert!(
        status
            .issues
            .iter()
            .any(|i| i.severity == Severity::Prob && i.code == "required-field")
    );
    assert!(!dir.path().join("archive/88434-mds2-1234.tar.gz").exists());
}

#[tokio::test]
async fn test_missing_metadata_fails() {
    let dir = TempDir::new().unwrap();
    let service =
        PreservationService::new(test_config(dir.path()), local_collaborators(dir.path())).unwrap();
    service.start().unwrap();

    let request_id = service
        .submit(ID, SipLocation::new(dir.path().join("nope.json")))
        .unwrap();
    let status = service.wait(&request_id, WAIT).await.unwrap();
    service.shutdown().await;

    assert_eq!(status.state, PreservationState::Failed);
    assert!(status.cause.is_some());
}

#[tokio::test]
async fn test_cancelled_queued_request_never_runs() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let calls = Arc::new(AtomicUsize::new(0));
    let collaborators = Collaborators::new(
        Arc::new(AlwaysBusy {
            calls: calls.clone(),
        }),
        Arc::new(AcceptAll),
        Arc::new(DirectoryArchive::new(dir.path().join("archive"))),
    );
    let service = PreservationService::new(test_config(dir.path()), collaborators).unwrap();

    let request_id = service.submit(ID, sip).unwrap();
    assert_eq!(
        service.cancel(&request_id).unwrap(),
        CancelOutcome::Cancelled
    );

    service.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.shutdown().await;

    assert_eq!(
        service.status(&request_id).unwrap().state,
        PreservationState::Cancelled
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recovery_fails_interrupted_and_resumes_queued() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let config = test_config(dir.path());

    // Rows a crashed service left behind
    let mut interrupted =
        PreservationStatus::queued("req-running".to_string(), "ark:/88434/mds2-1", sip.clone());
    interrupted.state = PreservationState::Running;
    let waiting = PreservationStatus::queued("req-queued".to_string(), ID, sip.clone());
    {
        let store = StatusStore::open(&config.service.status_db).unwrap();
        store.insert(&interrupted).unwrap();
        store.insert(&waiting).unwrap();
    }

    let service = PreservationService::new(config, local_collaborators(dir.path())).unwrap();
    let report = service.recover().unwrap();
    assert_eq!(report.failed, vec!["req-running".to_string()]);
    assert_eq!(report.requeued, vec!["req-queued".to_string()]);

    let failed = service.status("req-running").unwrap();
    assert_eq!(failed.state, PreservationState::Failed);
    assert!(failed.retry_eligible);

    // The interrupted identifier is free for a fresh request
    service
        .submit("ark:/88434/mds2-1", SipLocation::new(dir.path().join("nope.json")))
        .unwrap();

    service.start().unwrap();
    let resumed = service.wait("req-queued", WAIT).await.unwrap();
    assert_eq!(resumed.state, PreservationState::Succeeded, "{}", resumed);
    service.shutdown().await;

    // A second recovery finds nothing left to do
    let report = service.recover().unwrap();
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_cancel_running_request() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let transform = SlowTransform::new(Duration::from_millis(1500));
    let finished = transform.finished.clone();
    let service = PreservationService::new(
        test_config(dir.path()),
        slow_collaborators(dir.path(), transform),
    )
    .unwrap();
    service.start().unwrap();

    let request_id = service.submit(ID, sip).unwrap();
    wait_until_running(&service, &request_id).await;
    assert_eq!(service.cancel(&request_id).unwrap(), CancelOutcome::Requested);

    let status = service.wait(&request_id, WAIT).await.unwrap();
    service.shutdown().await;

    assert_eq!(status.state, PreservationState::Cancelled, "{}", status);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(!dir.path().join("archive/88434-mds2-1234.tar.gz").exists());
}

#[tokio::test]
async fn test_build_timeout_fails_and_holds_identifier_until_build_stops() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let mut config = test_config(dir.path());
    config.service.build_timeout_secs = 1;
    let bag_dir = config.bag_dir_for(ID);

    let transform = SlowTransform::new(Duration::from_secs(3));
    let finished = transform.finished.clone();
    let service =
        PreservationService::new(config, slow_collaborators(dir.path(), transform)).unwrap();
    service.start().unwrap();

    let started = Instant::now();
    let request_id = service.submit(ID, sip.clone()).unwrap();
    let status = service.wait(&request_id, WAIT).await.unwrap();

    assert_eq!(status.state, PreservationState::Failed, "{}", status);
    assert!(status.cause.as_deref().unwrap_or("").contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(3));

    // The blocking build is still inside the transform
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert!(BagLock::is_held(BagLock::path_for(&bag_dir)));
    match service.submit(ID, sip.clone()) {
        Err(Error::AlreadyInProgress { request_id: holder, .. }) => assert_eq!(holder, request_id),
        other => panic!("expected AlreadyInProgress, got {:?}", other),
    }

    let next = submit_when_free(&service, ID, &sip).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_ne!(next, request_id);
    service.cancel(&next).unwrap();
    service.shutdown().await;

    assert!(!dir.path().join("archive/88434-mds2-1234.tar.gz").exists());
    assert_eq!(
        service.status(&request_id).unwrap().state,
        PreservationState::Failed
    );
}

#[tokio::test]
async fn test_start_fails_stale_running_request() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let config = test_config(dir.path());

    // A service that died mid-build left this row behind
    let mut stale = PreservationStatus::queued("req-crashed".to_string(), ID, sip.clone());
    stale.state = PreservationState::Running;
    StatusStore::open(&config.service.status_db)
        .unwrap()
        .insert(&stale)
        .unwrap();

    let service = PreservationService::new(config, local_collaborators(dir.path())).unwrap();
    let report = service.start().unwrap();
    assert_eq!(report.failed, vec!["req-crashed".to_string()]);

    let crashed = service.status("req-crashed").unwrap();
    assert_eq!(crashed.state, PreservationState::Failed);
    assert!(crashed.retry_eligible);

    let request_id = service.submit(ID, sip).unwrap();
    let status = service.wait(&request_id, WAIT).await.unwrap();
    service.shutdown().await;
    assert_eq!(status.state, PreservationState::Succeeded, "{}", status);
}

#[tokio::test]
async fn test_start_leaves_build_live_elsewhere_running() {
    let dir = TempDir::new().unwrap();
    let sip = write_sip(dir.path(), &resource_metadata());
    let config = test_config(dir.path());
    let identifier = "ark:/88434/mds2-7";

    let mut live = PreservationStatus::queued("req-live".to_string(), identifier, sip);
    live.state = PreservationState::Running;
    StatusStore::open(&config.service.status_db)
        .unwrap()
        .insert(&live)
        .unwrap();

    // Another builder is still writing this bag
    let held = BagLock::for_bag(&config.bag_dir_for(identifier)).unwrap();

    let service = PreservationService::new(config, local_collaborators(dir.path())).unwrap();
    let report = service.start().unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(
        service.status("req-live").unwrap().state,
        PreservationState::Running
    );

    // Once that builder is gone the row is reconciled
    drop(held);
    let report = service.recover().unwrap();
    assert_eq!(report.failed, vec!["req-live".to_string()]);
    service.shutdown().await;
}
