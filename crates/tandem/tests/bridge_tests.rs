//! Integration tests for the worker bridge

use std::thread;
use std::time::Duration;

use tandem::{
    gather, sleep, submit, wait_for, Error, Scheduler, SchedulerConfig, Shared, SharedReentrant,
    WorkerPool,
};

fn scheduler(workers: usize) -> Scheduler {
    Scheduler::with_config(SchedulerConfig::default().with_worker_threads(workers))
}

fn increment(counter: &Shared<u64>) {
    for _ in 0..1000 {
        counter.with(|value| *value += 1);
    }
}

fn recursive_increment(counter: &SharedReentrant<u64>, n: u32) {
    counter.with(|value| {
        if n == 0 {
            return;
        }
        *value.borrow_mut() += 1;
        recursive_increment(counter, n - 1);
    });
}

// ===== Submission =====

#[test]
fn test_submitted_results_gather_in_order() {
    let sched = scheduler(4);
    let values = sched
        .block_on(async {
            let jobs: Vec<_> = (0..10u64)
                .map(|n| {
                    submit(move || {
                        thread::sleep(Duration::from_millis(10 * (10 - n)));
                        Ok(n * n)
                    })
                })
                .collect();
            gather(jobs).await
        })
        .unwrap();
    assert_eq!(values, (0..10u64).map(|n| n * n).collect::<Vec<_>>());
}

#[test]
fn test_scheduler_keeps_running_tasks_while_job_blocks() {
    let sched = scheduler(1);
    let ticks = sched
        .block_on(async {
            let job = submit(|| {
                thread::sleep(Duration::from_millis(200));
                Ok(())
            });
            let mut ticks = 0;
            while !job.is_done() {
                sleep(Duration::from_millis(10)).await?;
                ticks += 1;
            }
            job.await?;
            Ok(ticks)
        })
        .unwrap();
    assert!(ticks > 1, "scheduler was blocked by the worker job");
}

#[test]
fn test_job_error_reaches_completion() {
    let sched = scheduler(1);
    let err = sched
        .block_on(async { submit(|| -> tandem::Result<()> { Err(Error::msg("disk full")) }).await })
        .unwrap_err();
    assert_eq!(err.to_string(), "disk full");
}

#[test]
fn test_wait_for_on_slow_job_times_out() {
    let sched = scheduler(1);
    let outcome = sched
        .block_on(async {
            let job = submit(|| {
                thread::sleep(Duration::from_millis(300));
                Ok(1)
            });
            Ok(wait_for(job, Duration::from_millis(20)).await.map_err(|e| e.is_timeout()))
        })
        .unwrap();
    assert_eq!(outcome, Err(true));
}

#[test]
fn test_dedicated_pool() {
    let sched = scheduler(1);
    let pool = WorkerPool::new(2).unwrap();
    let handle = pool.clone();
    let name = sched
        .block_on(async move {
            handle
                .submit(|| Ok(thread::current().name().map(str::to_string)))
                .await
        })
        .unwrap();
    assert!(name.is_some_and(|name| name.starts_with("tandem-worker")));
    pool.shutdown();
    assert!(pool.is_shutdown());
}

// ===== Shared state =====

#[test]
fn test_shared_counter_across_workers() {
    let sched = scheduler(5);
    let counter = Shared::new(0u64);
    let jobs_counter = counter.clone();
    sched
        .block_on(async move {
            let jobs: Vec<_> = (0..5)
                .map(|_| {
                    let counter = jobs_counter.clone();
                    submit(move || {
                        increment(&counter);
                        Ok(())
                    })
                })
                .collect();
            gather(jobs).await
        })
        .unwrap();
    assert_eq!(counter.get(), 5000);
}

#[test]
fn test_reentrant_shared_counter_across_workers() {
    let sched = scheduler(5);
    let counter = SharedReentrant::new(0u64);
    let jobs_counter = counter.clone();
    sched
        .block_on(async move {
            let jobs: Vec<_> = (0..5)
                .map(|_| {
                    let counter = jobs_counter.clone();
                    submit(move || {
                        recursive_increment(&counter, 5);
                        Ok(())
                    })
                })
                .collect();
            gather(jobs).await
        })
        .unwrap();
    assert_eq!(counter.get(), 25);
}
