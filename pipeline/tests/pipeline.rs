//! Behavioral tests for the pipeline coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use matches::matches;
use pacs_pipeline::{
    Error, JobCategory, JobContext, PipelineConfig, PipelineCoordinator, PipelineStage,
};

fn small_config() -> PipelineConfig {
    PipelineConfig {
        net_io_workers: 2,
        protocol_workers: 2,
        execution_workers: 4,
        encode_workers: 1,
        max_queue_depth: 100,
        shutdown_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

#[test]
fn jobs_run_and_hand_off_through_stages() {
    let pipeline = PipelineCoordinator::start_with_config(small_config());
    let visited = Arc::new(Mutex::new(Vec::new()));

    let ctx = JobContext::new(pipeline.generate_job_id(), 1, JobCategory::Echo);
    let visited_in_job = Arc::clone(&visited);
    pipeline
        .submit_task(PipelineStage::NetworkReceive, ctx, "receive", move |p| {
            visited_in_job.lock().unwrap().push(PipelineStage::NetworkReceive);
            let visited_next = Arc::clone(&visited_in_job);
            let ctx = JobContext::new(p.generate_job_id(), 1, JobCategory::Echo);
            p.submit_task(PipelineStage::PduDecode, ctx, "decode", move |p| {
                visited_next.lock().unwrap().push(PipelineStage::PduDecode);
                let visited_last = Arc::clone(&visited_next);
                let ctx = JobContext::new(p.generate_job_id(), 1, JobCategory::Echo);
                p.submit_task(PipelineStage::DimseProcess, ctx, "dimse", move |_| {
                    visited_last.lock().unwrap().push(PipelineStage::DimseProcess);
                    Ok(())
                })
            })
        })
        .unwrap();

    // wait for the chain to drain
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while visited.lock().unwrap().len() < 3 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(
        *visited.lock().unwrap(),
        vec![
            PipelineStage::NetworkReceive,
            PipelineStage::PduDecode,
            PipelineStage::DimseProcess,
        ]
    );

    pipeline.stop();
}

#[test]
fn jobs_of_one_session_keep_submission_order() {
    let pipeline = PipelineCoordinator::start_with_config(small_config());
    let order = Arc::new(Mutex::new(Vec::new()));

    for sequence in 0..200u32 {
        let order = Arc::clone(&order);
        let ctx = JobContext::new(pipeline.generate_job_id(), 7, JobCategory::Store)
            .with_sequence_number(sequence);
        pipeline
            .submit_task(PipelineStage::StorageQueryExec, ctx, "ordered", move |_| {
                order.lock().unwrap().push(sequence);
                Ok(())
            })
            .unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while order.lock().unwrap().len() < 200 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 200);
    assert!(
        order.windows(2).all(|w| w[0] < w[1]),
        "jobs of one session were reordered"
    );

    pipeline.stop();
}

#[test]
fn saturated_stage_reports_queue_full_and_fires_backpressure() {
    let pipeline = PipelineCoordinator::start_with_config(PipelineConfig {
        max_queue_depth: 0,
        ..small_config()
    });

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_cb = Arc::clone(&fired);
    pipeline.set_backpressure_callback(move |stage, _depth| {
        assert_eq!(stage, PipelineStage::DimseProcess);
        fired_in_cb.fetch_add(1, Ordering::SeqCst);
    });

    let ctx = JobContext::new(pipeline.generate_job_id(), 1, JobCategory::Find);
    let err = pipeline
        .submit_task(PipelineStage::DimseProcess, ctx, "overflow", |_| Ok(()))
        .unwrap_err();

    assert!(matches!(err, Error::QueueFull { .. }));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(pipeline.is_backpressure_active(PipelineStage::DimseProcess));

    pipeline.stop();
}

#[test]
fn stop_refuses_new_submissions() {
    let pipeline = PipelineCoordinator::start_with_config(small_config());
    assert!(pipeline.is_running());

    pipeline.stop();
    assert!(!pipeline.is_running());

    let ctx = JobContext::new(1, 1, JobCategory::Other);
    let err = pipeline
        .submit_task(PipelineStage::NetworkSend, ctx, "late", |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, Error::NotRunning { .. }));

    // stop is idempotent
    assert_eq!(pipeline.stop(), 0);
}

#[test]
fn stop_drops_jobs_still_queued_after_the_timeout() {
    let pipeline = PipelineCoordinator::start_with_config(PipelineConfig {
        execution_workers: 1,
        shutdown_timeout: Duration::from_millis(20),
        ..small_config()
    });

    // the first job occupies the only worker long enough
    // for the shutdown timeout to pass
    let ctx = JobContext::new(pipeline.generate_job_id(), 3, JobCategory::Store);
    pipeline
        .submit_task(PipelineStage::StorageQueryExec, ctx, "slow", |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .unwrap();

    let executed = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let executed = Arc::clone(&executed);
        let ctx = JobContext::new(pipeline.generate_job_id(), 3, JobCategory::Store);
        pipeline
            .submit_task(PipelineStage::StorageQueryExec, ctx, "queued", move |_| {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    // give the worker a moment to pick up the slow job
    std::thread::sleep(Duration::from_millis(50));

    let dropped = pipeline.stop();
    assert_eq!(dropped, 5);
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    let snapshot = pipeline.metrics_snapshot();
    let exec = &snapshot.stages[PipelineStage::StorageQueryExec as usize];
    assert_eq!(exec.jobs_dropped, 5);
}

#[test]
fn metrics_count_jobs_by_stage_and_category() {
    let pipeline = PipelineCoordinator::start_with_config(small_config());

    for session in 0..4u64 {
        let ctx = JobContext::new(pipeline.generate_job_id(), session, JobCategory::Echo);
        pipeline
            .submit_task(PipelineStage::DimseProcess, ctx, "echo", |_| Ok(()))
            .unwrap();
    }
    let ctx = JobContext::new(pipeline.generate_job_id(), 9, JobCategory::Find);
    pipeline
        .submit_task(PipelineStage::DimseProcess, ctx, "find-fails", |_| {
            pacs_pipeline::JobFailedSnafu {
                message: "no matches",
            }
            .fail()
        })
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while pipeline.total_pending_jobs() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(20));

    let snapshot = pipeline.metrics_snapshot();
    let dimse = &snapshot.stages[PipelineStage::DimseProcess as usize];
    assert_eq!(dimse.jobs_processed, 5);
    assert_eq!(dimse.jobs_failed, 1);
    assert_eq!(dimse.per_category[JobCategory::Echo as usize], 4);
    assert_eq!(dimse.per_category[JobCategory::Find as usize], 1);
    assert_eq!(dimse.latency.count, 5);

    pipeline.reset_metrics();
    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot.total_processed(), 0);

    pipeline.stop();
}

#[test]
fn completion_callback_sees_every_job() {
    let pipeline = PipelineCoordinator::start_with_config(small_config());

    let completions = Arc::new(Mutex::new(Vec::new()));
    let completions_in_cb = Arc::clone(&completions);
    pipeline.set_job_completion_callback(move |ctx, success| {
        completions_in_cb
            .lock()
            .unwrap()
            .push((ctx.job_id, success));
    });

    let ok_ctx = JobContext::new(pipeline.generate_job_id(), 1, JobCategory::Control);
    let ok_id = ok_ctx.job_id;
    pipeline
        .submit_task(PipelineStage::ResponseEncode, ok_ctx, "ok", |_| Ok(()))
        .unwrap();

    let err_ctx = JobContext::new(pipeline.generate_job_id(), 1, JobCategory::Control);
    let err_id = err_ctx.job_id;
    pipeline
        .submit_task(PipelineStage::ResponseEncode, err_ctx, "err", |_| {
            pacs_pipeline::JobFailedSnafu { message: "boom" }.fail()
        })
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while completions.lock().unwrap().len() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let completions = completions.lock().unwrap();
    assert!(completions.contains(&(ok_id, true)));
    assert!(completions.contains(&(err_id, false)));

    pipeline.stop();
}

#[test]
fn cancel_flags_are_shared_through_the_coordinator() {
    let pipeline = PipelineCoordinator::start_with_config(small_config());

    pipeline.cancels().cancel(5, 21);
    assert!(pipeline.cancels().is_cancelled(5, 21));
    pipeline.cancels().clear_session(5);
    assert!(!pipeline.cancels().is_cancelled(5, 21));

    pipeline.stop();
}

#[test]
fn worker_counts_follow_the_config() {
    let pipeline = PipelineCoordinator::start_with_config(small_config());
    // 2 + 2 + 2 + 4 + 1 + 2
    assert_eq!(pipeline.total_worker_count(), 13);
    assert_eq!(pipeline.queue_depth(PipelineStage::NetworkReceive), 0);
    pipeline.stop();
}
