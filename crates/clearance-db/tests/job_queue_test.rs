mod common;

use std::collections::HashSet;
use std::time::Duration;

use clearance_core::models::{JobStatus, JobType, NewUpload, RelocationStage};
use clearance_core::JobError;
use clearance_db::{JobRepository, UploadRepository};
use serde_json::json;

use common::{expire_all_leases, setup_test_db};

const LEASE: Duration = Duration::from_secs(60);

fn new_upload(file_id: &str) -> NewUpload {
    NewUpload {
        file_id: file_id.to_string(),
        owner_user_id: "u1".to_string(),
        original_file_name: "study.dcm".to_string(),
        object_key: format!("uploads/temp/u1/{}", file_id),
    }
}

fn is_lease_lost(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<JobError>(), Some(JobError::LeaseLost { .. }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn concurrent_dequeues_never_share_a_job() {
    let db = setup_test_db().await;
    let jobs = JobRepository::new(db.pool.clone());

    for i in 0..24 {
        jobs.enqueue(JobType::VirusScan, json!({ "uploadId": i }), 5)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let jobs = jobs.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{}", w);
            let mut claimed = Vec::new();
            while let Some(job) = jobs
                .try_dequeue(JobType::VirusScan, &worker_id, LEASE)
                .await
                .unwrap()
            {
                assert_eq!(job.locked_by.as_deref(), Some(worker_id.as_str()));
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 24, "every job is claimed exactly once");
    assert_eq!(unique.len(), 24);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn dequeue_is_oldest_first_and_increments_attempts_once() {
    let db = setup_test_db().await;
    let jobs = JobRepository::new(db.pool.clone());

    let first = jobs
        .enqueue(JobType::VirusScan, json!({ "uploadId": 1 }), 5)
        .await
        .unwrap();
    let second = jobs
        .enqueue(JobType::VirusScan, json!({ "uploadId": 2 }), 5)
        .await
        .unwrap();
    assert_eq!(first.attempts, 0);
    assert_eq!(first.status, JobStatus::Pending);

    let leased = jobs
        .try_dequeue(JobType::VirusScan, "worker-a", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.id, first.id);
    assert_eq!(leased.attempts, 1);
    assert_eq!(leased.status, JobStatus::Processing);
    assert!(leased.locked_at.is_some());
    assert!(leased.lease_expires_at.is_some());

    let next = jobs
        .try_dequeue(JobType::VirusScan, "worker-a", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, second.id);

    // Nothing left; an empty dequeue must not touch any row.
    assert!(jobs
        .try_dequeue(JobType::VirusScan, "worker-a", LEASE)
        .await
        .unwrap()
        .is_none());
    let reloaded = jobs.get(first.id).await.unwrap().unwrap();
    assert_eq!(reloaded.attempts, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn expired_lease_is_reclaimed_and_old_owner_loses_it() {
    let db = setup_test_db().await;
    let jobs = JobRepository::new(db.pool.clone());

    let job = jobs
        .enqueue(JobType::VirusScan, json!({ "uploadId": 1 }), 5)
        .await
        .unwrap();
    jobs.try_dequeue(JobType::VirusScan, "worker-a", LEASE)
        .await
        .unwrap()
        .unwrap();

    // A live lease is not eligible.
    assert!(jobs
        .try_dequeue(JobType::VirusScan, "worker-b", LEASE)
        .await
        .unwrap()
        .is_none());

    expire_all_leases(&db.pool).await;

    let reclaimed = jobs
        .try_dequeue(JobType::VirusScan, "worker-b", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.locked_by.as_deref(), Some("worker-b"));

    let err = jobs.fail(job.id, "worker-a", "late failure").await.unwrap_err();
    assert!(is_lease_lost(&err));

    jobs.fail(job.id, "worker-b", "scan engine unavailable")
        .await
        .unwrap();
    let failed = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("scan engine unavailable"));
    assert_eq!(failed.attempts, 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn terminal_jobs_are_never_selected_again() {
    let db = setup_test_db().await;
    let jobs = JobRepository::new(db.pool.clone());

    let a = jobs
        .enqueue(JobType::VirusScan, json!({ "uploadId": 1 }), 5)
        .await
        .unwrap();
    let b = jobs
        .enqueue(JobType::VirusScan, json!({ "uploadId": 2 }), 5)
        .await
        .unwrap();
    jobs.try_dequeue(JobType::VirusScan, "w", LEASE).await.unwrap();
    jobs.try_dequeue(JobType::VirusScan, "w", LEASE).await.unwrap();

    let mut tx = db.pool.begin().await.unwrap();
    jobs.complete_in_tx(&mut tx, a.id, "w").await.unwrap();
    tx.commit().await.unwrap();
    jobs.fail(b.id, "w", "nested archive").await.unwrap();

    // Even with stale lease columns, terminal rows stay put.
    sqlx::query("UPDATE jobs SET lease_expires_at = NOW() - INTERVAL '1 hour'")
        .execute(&db.pool)
        .await
        .unwrap();

    assert!(jobs
        .try_dequeue(JobType::VirusScan, "w2", LEASE)
        .await
        .unwrap()
        .is_none());
    assert_eq!(jobs.reap_exhausted_leases().await.unwrap(), 0);

    let stats = jobs.stats(JobType::VirusScan).await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn exhausted_expired_lease_is_reaped_to_failed() {
    let db = setup_test_db().await;
    let jobs = JobRepository::new(db.pool.clone());

    let job = jobs
        .enqueue(JobType::VirusScan, json!({ "uploadId": 1 }), 1)
        .await
        .unwrap();
    jobs.try_dequeue(JobType::VirusScan, "worker-a", LEASE)
        .await
        .unwrap()
        .unwrap();
    expire_all_leases(&db.pool).await;

    assert!(jobs
        .try_dequeue(JobType::VirusScan, "worker-b", LEASE)
        .await
        .unwrap()
        .is_none());

    assert_eq!(jobs.reap_exhausted_leases().await.unwrap(), 1);
    let reaped = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(reaped.status, JobStatus::Failed);
    assert_eq!(reaped.attempts, 1);
    assert!(reaped.last_error.is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn requeue_respects_backoff() {
    let db = setup_test_db().await;
    let jobs = JobRepository::new(db.pool.clone());

    let job = jobs
        .enqueue(JobType::VirusScan, json!({ "uploadId": 1 }), 5)
        .await
        .unwrap();
    jobs.try_dequeue(JobType::VirusScan, "w", LEASE).await.unwrap();

    jobs.requeue(job.id, "w", "storage timeout", Duration::from_secs(3600))
        .await
        .unwrap();
    let pending = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert!(pending.locked_by.is_none());
    assert!(jobs
        .try_dequeue(JobType::VirusScan, "w", LEASE)
        .await
        .unwrap()
        .is_none());

    sqlx::query("UPDATE jobs SET available_at = NOW() - INTERVAL '1 second'")
        .execute(&db.pool)
        .await
        .unwrap();
    let again = jobs
        .try_dequeue(JobType::VirusScan, "w", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn register_creates_upload_and_job_together() {
    let db = setup_test_db().await;
    let uploads = UploadRepository::new(db.pool.clone());
    let jobs = JobRepository::new(db.pool.clone());

    let (upload, job) = uploads
        .register_completed_upload(&new_upload("f1"), 5)
        .await
        .unwrap();
    assert_eq!(upload.object_key, "uploads/temp/u1/f1");
    assert_eq!(upload.relocation_stage, RelocationStage::Pending);
    assert!(upload.scanned_at.is_none());
    assert_eq!(job.job_type, JobType::VirusScan);
    assert_eq!(job.max_attempts, 5);
    assert_eq!(job.payload, json!({ "uploadId": upload.upload_id }));

    // Duplicate file ids are refused and leave no orphan job behind.
    assert!(uploads
        .register_completed_upload(&new_upload("f1"), 5)
        .await
        .is_err());
    let stats = jobs.stats(JobType::VirusScan).await.unwrap();
    assert_eq!(stats.total(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn finalize_with_lost_lease_rolls_back_upload_update() {
    let db = setup_test_db().await;
    let uploads = UploadRepository::new(db.pool.clone());
    let jobs = JobRepository::new(db.pool.clone());

    let (upload, job) = uploads
        .register_completed_upload(&new_upload("f2"), 5)
        .await
        .unwrap();
    jobs.try_dequeue(JobType::VirusScan, "owner", LEASE)
        .await
        .unwrap()
        .unwrap();

    uploads
        .record_scan_result(upload.upload_id, true, "stream: Eicar-Signature FOUND\0")
        .await
        .unwrap();
    uploads
        .mark_relocation_copied(upload.upload_id)
        .await
        .unwrap();

    let err = uploads
        .finalize_relocation(upload.upload_id, "uploads/scanned/u1/f2", job.id, "intruder")
        .await
        .unwrap_err();
    assert!(is_lease_lost(&err));

    let unchanged = uploads.get(upload.upload_id).await.unwrap().unwrap();
    assert_eq!(unchanged.object_key, "uploads/temp/u1/f2");
    assert_eq!(unchanged.relocation_stage, RelocationStage::Copied);
    assert!(unchanged.virus_detected_at.is_some());
    assert!(unchanged.scanned_at.is_some());

    uploads
        .finalize_relocation(upload.upload_id, "uploads/scanned/u1/f2", job.id, "owner")
        .await
        .unwrap();
    let done = uploads.get_by_file_id("f2").await.unwrap().unwrap();
    assert_eq!(done.object_key, "uploads/scanned/u1/f2");
    assert_eq!(done.relocation_stage, RelocationStage::Completed);
    let completed = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
}
