//! wait_for and shield

use std::time::Duration;

use super::FirstDone;
use crate::completion::{Awaitable, CompletionState};
use crate::error::{Error, Result};
use crate::scheduler::{sleep, spawn_named, Task};

/// Await `awaitable`, giving up after `timeout`.
///
/// On timeout the awaitable is cancelled and this waits until the
/// cancellation has actually landed before failing with `TimedOut`. If the
/// awaitable finished with a value in the meantime, that value is returned.
/// Cancelling the caller cancels the awaitable too, and a lock or permit
/// granted to it is passed on unless this returns `Ok`.
///
/// # Panics
///
/// Panics when polled outside a running scheduler.
pub async fn wait_for<A: Awaitable>(awaitable: A, timeout: Duration) -> Result<A::Output> {
    let completion = awaitable.completion();
    let timer = sleep(timeout);

    let race = FirstDone::new(true)
        .watch(&completion)
        .watch(&timer.completion());
    if let Err(error) = race.await {
        awaitable.cancel();
        return Err(error);
    }
    drop(timer);

    let timed_out = !completion.is_done();
    if timed_out {
        tracing::debug!(?timeout, "wait_for timed out, cancelling");
        awaitable.cancel();
        // The caller's own cancellation stays pending until this settles.
        FirstDone::new(false).watch(&completion).await?;
    }
    let outcome = match completion.result() {
        Err(Error::Cancelled) if timed_out => Err(Error::TimedOut),
        outcome => outcome,
    };
    if outcome.is_ok() {
        awaitable.claim();
    }
    outcome
}

/// Protect `awaitable` from cancellation of whoever waits on it.
///
/// Returns a proxy task resolving to the awaitable's outcome. Cancelling the
/// proxy, directly or through [`wait_for`], leaves the awaitable running;
/// await it directly to collect its outcome later.
///
/// The awaitable itself is owned by a separate keeper task until it
/// finishes, so dropping the proxy never drops it. A grant it receives goes
/// to the proxy's caller when the proxy resolves with it, and is passed on
/// otherwise.
///
/// # Panics
///
/// Panics when called outside a running scheduler.
pub fn shield<A>(awaitable: A) -> Task<A::Output>
where
    A: Awaitable + 'static,
{
    let inner = awaitable.completion();
    let proxy = spawn_named("shield", {
        let inner = inner.clone();
        async move { inner.await }
    });

    let delivered = proxy.completion();
    spawn_named("shield-keeper", async move {
        FirstDone::new(false).watch(&inner).await?;
        FirstDone::new(false).watch(&delivered).await?;
        if delivered.state() == CompletionState::ResultSet {
            awaitable.claim();
        }
        Ok(())
    });
    proxy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::{spawn, Scheduler};
    use crate::sync::Lock;

    fn scheduler() -> Scheduler {
        Scheduler::with_config(SchedulerConfig::virtual_time())
    }

    fn delayed(secs: u64) -> Task<u64> {
        spawn(async move {
            sleep(Duration::from_secs(secs)).await?;
            Ok(secs)
        })
    }

    #[test]
    fn test_wait_for_returns_in_time() {
        let sched = scheduler();
        let value = sched
            .block_on(async { wait_for(delayed(1), Duration::from_secs(5)).await })
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_wait_for_timeout_cancels_member() {
        let sched = scheduler();
        let start = sched.now();
        let (outcome, slow) = sched
            .block_on(async {
                let slow = delayed(10);
                let outcome = wait_for(&slow, Duration::from_secs(1)).await;
                Ok((outcome.map_err(|error| error.is_timeout()), slow))
            })
            .unwrap();
        assert_eq!(outcome, Err(true));
        assert!(slow.cancelled());
        assert_eq!(sched.now() - start, Duration::from_secs(1));
    }

    #[test]
    fn test_wait_for_propagates_member_error() {
        let sched = scheduler();
        let error = sched
            .block_on(async {
                let broken = spawn(async {
                    sleep(Duration::from_secs(1)).await?;
                    Err::<(), _>(Error::msg("broken"))
                });
                Ok(wait_for(broken, Duration::from_secs(5)).await.err().map(|e| e.to_string()))
            })
            .unwrap();
        assert_eq!(error.as_deref(), Some("broken"));
    }

    #[test]
    fn test_wait_for_lock_acquire_times_out_and_leaves_queue() {
        let sched = scheduler();
        let lock = Lock::new();
        assert!(lock.try_acquire());
        let contended = lock.clone();
        let outcome = sched
            .block_on(async move {
                let outcome = wait_for(contended.acquire(), Duration::from_secs(1)).await;
                Ok(outcome.map_err(|error| error.is_timeout()))
            })
            .unwrap();
        assert_eq!(outcome, Err(true));
        assert_eq!(lock.waiting(), 0);
        lock.release().unwrap();
        assert!(!lock.locked());
    }

    #[test]
    fn test_cancelled_caller_cancels_member() {
        let sched = scheduler();
        let slow = sched.spawn(async {
            sleep(Duration::from_secs(10)).await?;
            Ok(())
        });
        let member = slow.clone();
        let caller = sched.spawn(async move { wait_for(member, Duration::from_secs(5)).await });
        let target = caller.clone();
        sched
            .block_on(async move {
                sleep(Duration::from_secs(1)).await?;
                target.cancel();
                Ok(())
            })
            .unwrap();
        sched.run_until_idle().unwrap();
        assert!(caller.cancelled());
        assert!(slow.cancelled());
    }

    #[test]
    fn test_shield_survives_timeout() {
        let sched = scheduler();
        let value = sched
            .block_on(async {
                let inner = delayed(3);
                let outer = wait_for(shield(inner.clone()), Duration::from_secs(1)).await;
                assert!(matches!(outer, Err(Error::TimedOut)));
                assert!(!inner.cancel_requested());
                inner.await
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_cancelling_shield_proxy_leaves_inner_running() {
        let sched = scheduler();
        let inner = sched.spawn(async {
            sleep(Duration::from_secs(2)).await?;
            Ok("done")
        });
        let shielded = inner.clone();
        let proxy = sched
            .block_on(async move {
                let proxy = shield(shielded);
                sleep(Duration::from_secs(1)).await?;
                proxy.cancel();
                Ok(proxy)
            })
            .unwrap();
        assert_eq!(sched.run_until_complete(&inner).unwrap(), "done");
        assert!(proxy.cancelled());
    }

    #[test]
    fn test_cancelled_caller_passes_on_landed_grant() {
        let sched = scheduler();
        let lock = Lock::new();
        assert!(lock.try_acquire());

        let contended = lock.clone();
        let caller =
            sched.spawn(async move { wait_for(contended.acquire(), Duration::from_secs(5)).await });

        let (holder, target) = (lock.clone(), caller.clone());
        sched
            .block_on(async move {
                sleep(Duration::from_secs(1)).await?;
                // The grant lands in the same step the caller is cancelled.
                holder.release()?;
                target.cancel();
                Ok(())
            })
            .unwrap();
        sched.run_until_idle().unwrap();

        assert!(caller.cancelled());
        assert!(!lock.locked());
    }

    #[test]
    fn test_wait_for_keeps_claimed_grant() {
        let sched = scheduler();
        let lock = Lock::new();
        let held = lock.clone();
        let locked = sched
            .block_on(async move {
                wait_for(held.acquire(), Duration::from_secs(1)).await?;
                Ok(held.locked())
            })
            .unwrap();
        assert!(locked);
        lock.release().unwrap();
        assert!(!lock.locked());
    }

    #[test]
    fn test_shield_keeps_sleep_alive() {
        let sched = scheduler();
        let start = sched.now();
        let nap = sched
            .block_on(async {
                let nap = sleep(Duration::from_secs(3));
                let cell = nap.completion();
                let outcome = wait_for(shield(nap), Duration::from_secs(1)).await;
                assert!(matches!(outcome, Err(Error::TimedOut)));
                assert!(!cell.is_done());
                cell.clone().await?;
                Ok(cell)
            })
            .unwrap();
        assert_eq!(nap.state(), CompletionState::ResultSet);
        assert_eq!(sched.now() - start, Duration::from_secs(3));
    }

    #[test]
    fn test_shielded_grant_is_passed_on_after_proxy_gave_up() {
        let sched = scheduler();
        let lock = Lock::new();
        assert!(lock.try_acquire());

        let contended = lock.clone();
        let outcome = sched
            .block_on(async move {
                let outcome = wait_for(shield(contended.acquire()), Duration::from_secs(1)).await;
                Ok(outcome.map_err(|error| error.is_timeout()))
            })
            .unwrap();
        assert_eq!(outcome, Err(true));
        assert_eq!(lock.waiting(), 1);

        lock.release().unwrap();
        sched.run_until_idle().unwrap();
        assert!(!lock.locked());
        assert_eq!(lock.waiting(), 0);
    }
}
