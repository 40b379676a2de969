//! Integration tests for Lock, ReentrantLock, Semaphore and BoundedSemaphore

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use tandem::{
    gather, sleep, spawn, BoundedSemaphore, Error, Lock, ReentrantLock, Result, Scheduler,
    SchedulerConfig, Semaphore,
};

fn scheduler() -> Scheduler {
    Scheduler::with_config(SchedulerConfig::virtual_time())
}

async fn read_modify_write(counter: Rc<Cell<u32>>) -> Result<()> {
    let value = counter.get();
    sleep(Duration::from_millis(10)).await?;
    counter.set(value + 1);
    Ok(())
}

// ===== Lock =====

#[test]
fn test_unlocked_counter_loses_updates() {
    let sched = scheduler();
    let counter = Rc::new(Cell::new(0));
    let shared = Rc::clone(&counter);
    sched
        .block_on(async move {
            gather([
                spawn(read_modify_write(Rc::clone(&shared))),
                spawn(read_modify_write(Rc::clone(&shared))),
            ])
            .await
        })
        .unwrap();
    assert!([1, 2].contains(&counter.get()));
}

#[test]
fn test_locked_counter_never_loses_updates() {
    for _ in 0..10 {
        let sched = scheduler();
        let counter = Rc::new(Cell::new(0));
        let lock = Lock::new();

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let counter = Rc::clone(&counter);
                let lock = lock.clone();
                sched.spawn(async move {
                    let _guard = lock.lock().await?;
                    read_modify_write(counter).await
                })
            })
            .collect();
        sched.block_on(async move { gather(workers).await }).unwrap();

        assert_eq!(counter.get(), 2);
        assert!(!lock.locked());
    }
}

#[test]
fn test_lock_acquire_release_explicitly() {
    let sched = scheduler();
    let lock = Lock::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    for name in ["first", "second", "third"] {
        let lock = lock.clone();
        let order = Rc::clone(&order);
        sched.spawn(async move {
            lock.acquire().await?;
            order.borrow_mut().push(name);
            sleep(Duration::from_secs(1)).await?;
            lock.release()
        });
    }
    let start = sched.now();
    sched.run_until_idle().unwrap();
    assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    assert_eq!(sched.now() - start, Duration::from_secs(3));
}

#[test]
fn test_cancelled_holder_releases_through_guard() {
    let sched = scheduler();
    let lock = Lock::new();

    let holder = {
        let lock = lock.clone();
        sched.spawn(async move {
            let _guard = lock.lock().await?;
            sleep(Duration::from_secs(100)).await?;
            Ok(())
        })
    };
    let next = {
        let lock = lock.clone();
        sched.spawn(async move {
            let _guard = lock.lock().await?;
            Ok("acquired")
        })
    };

    let target = holder.clone();
    sched
        .block_on(async move {
            sleep(Duration::from_secs(1)).await?;
            target.cancel();
            Ok(())
        })
        .unwrap();
    assert_eq!(sched.run_until_complete(&next).unwrap(), "acquired");
    assert!(holder.cancelled());
    assert!(!lock.locked());
}

// ===== ReentrantLock =====

fn recursive_increment(
    lock: ReentrantLock,
    counter: Rc<Cell<u32>>,
    remaining: u32,
) -> Pin<Box<dyn Future<Output = Result<()>>>> {
    Box::pin(async move {
        let _level = lock.lock().await?;
        assert!(lock.is_owned_by_current());
        if remaining == 0 {
            return Ok(());
        }
        counter.set(counter.get() + 1);
        sleep(Duration::from_millis(1)).await?;
        recursive_increment(lock.clone(), counter, remaining - 1).await
    })
}

#[test]
fn test_reentrant_counter_across_tasks() {
    let sched = scheduler();
    let lock = ReentrantLock::new();
    let counter = Rc::new(Cell::new(0));

    let (worker_lock, worker_counter) = (lock.clone(), Rc::clone(&counter));
    sched
        .block_on(async move {
            let workers: Vec<_> = (0..5)
                .map(|_| spawn(recursive_increment(worker_lock.clone(), Rc::clone(&worker_counter), 5)))
                .collect();
            gather(workers).await
        })
        .unwrap();

    assert_eq!(counter.get(), 25);
    assert!(!lock.locked());
    assert_eq!(lock.depth(), 0);
}

#[test]
fn test_reentrant_release_by_other_task_fails() {
    let sched = scheduler();
    let lock = ReentrantLock::new();
    let owner = lock.clone();
    let holder = sched.spawn(async move {
        owner.acquire().await?;
        sleep(Duration::from_secs(2)).await?;
        owner.release()
    });
    let other = lock.clone();
    let outcome = sched
        .block_on(async move {
            sleep(Duration::from_secs(1)).await?;
            Ok(matches!(other.release(), Err(Error::NotOwner)))
        })
        .unwrap();
    assert!(outcome);
    sched.run_until_complete(&holder).unwrap();
    assert!(matches!(lock.release(), Err(Error::NotLocked)));
}

// ===== Semaphore =====

#[test]
fn test_semaphore_caps_concurrency() {
    let sched = scheduler();
    let semaphore = Semaphore::new(2);
    let active = Rc::new(Cell::new(0));
    let peak = Rc::new(Cell::new(0));

    let workers: Vec<_> = (0..10)
        .map(|_| {
            let semaphore = semaphore.clone();
            let active = Rc::clone(&active);
            let peak = Rc::clone(&peak);
            sched.spawn(async move {
                let _permit = semaphore.permit().await?;
                active.set(active.get() + 1);
                peak.set(peak.get().max(active.get()));
                sleep(Duration::from_secs(1)).await?;
                active.set(active.get() - 1);
                Ok(())
            })
        })
        .collect();

    let start = sched.now();
    sched.block_on(async move { gather(workers).await }).unwrap();
    assert_eq!(peak.get(), 2);
    assert_eq!(sched.now() - start, Duration::from_secs(5));
    assert_eq!(semaphore.available_permits(), 2);
}

#[test]
fn test_bounded_semaphore_rejects_over_release() {
    let sched = scheduler();
    let semaphore = BoundedSemaphore::new(1);
    let handle = semaphore.clone();
    let over = sched
        .block_on(async move {
            handle.acquire().await?;
            handle.release()?;
            Ok(handle.release().map_err(|error| matches!(error, Error::OverReleased)))
        })
        .unwrap();
    assert_eq!(over, Err(true));
    assert_eq!(semaphore.available_permits(), 1);
}

#[test]
fn test_semaphore_skips_cancelled_waiter() {
    let sched = scheduler();
    let semaphore = Semaphore::new(1);
    assert!(semaphore.try_acquire());

    let queued = {
        let semaphore = semaphore.clone();
        sched.spawn(async move { semaphore.acquire().await })
    };
    let served = {
        let semaphore = semaphore.clone();
        sched.spawn(async move {
            semaphore.acquire().await?;
            Ok(())
        })
    };

    let (releaser, target) = (semaphore.clone(), queued.clone());
    sched
        .block_on(async move {
            sleep(Duration::from_millis(1)).await?;
            target.cancel();
            sleep(Duration::from_millis(1)).await?;
            releaser.release()
        })
        .unwrap();
    sched.run_until_complete(&served).unwrap();
    assert!(queued.cancelled());
    assert_eq!(semaphore.available_permits(), 0);
    assert_eq!(semaphore.waiting(), 0);
}
