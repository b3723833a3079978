//! Stress tests that hammer actions and registries from many tasks at once.
//!
//! These exercise the races between run, supersede, abort, and settle.

#[cfg(test)]
mod stress_tests {
    use crate::action::Action;
    use crate::cancel::CancelToken;
    use crate::error::{AbortReason, ActionError};
    use crate::future::Status;
    use crate::invocation::Invocation;
    use crate::registry::{Criteria, EntryOptions, Registry};
    use crate::testing::{CallCounter, ManualWork};
    use crate::work::WorkContext;
    use std::sync::Arc;
    use std::time::Duration;

    // ==========================================================================
    // Helpers
    // ==========================================================================

    async fn jittered(n: u64, _ctx: WorkContext<u64>) -> anyhow::Result<u64> {
        tokio::time::sleep(Duration::from_millis(fastrand::u64(0..5))).await;
        Ok(n)
    }

    async fn settle_all<F>(futures: Vec<F>) -> Vec<Result<u64, ActionError>>
    where
        F: std::future::IntoFuture<Output = Result<u64, ActionError>>,
    {
        let mut results = Vec::with_capacity(futures.len());
        for fut in futures {
            let result = tokio::time::timeout(Duration::from_secs(5), fut.into_future())
                .await
                .expect("future never settled");
            results.push(result);
        }
        results
    }

    // ==========================================================================
    // Single-flight
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_shares_entries() {
        let registry: Arc<Registry<u64, u64>> = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for i in 0..64u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("k{}", i % 4);
                registry.get_or_create(jittered, EntryOptions::keyed(key))
            }));
        }

        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.unwrap());
        }

        assert_eq!(registry.len(), 4);
        for entry in &entries {
            let canonical = registry.get(entry.id().to_string()).unwrap();
            assert!(entry.ptr_eq(&canonical));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_call_work_once_per_run() {
        let counter = CallCounter::new();
        let registry: Arc<Registry<u64, u64>> = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for i in 0..32u64 {
            let registry = registry.clone();
            let work = counter.wrap(jittered);
            handles.push(tokio::spawn(async move {
                registry.run(work, EntryOptions::keyed("shared"), i, None)
            }));
        }

        let mut futures = Vec::new();
        for handle in handles {
            futures.push(handle.await.unwrap());
        }
        let results = settle_all(futures).await;

        assert_eq!(registry.len(), 1);
        assert_eq!(counter.count(), 32);
        assert!(results.iter().any(|r| r.is_ok()));
        for result in &results {
            if let Err(err) = result {
                assert_eq!(err.abort_reason(), Some(&AbortReason::Superseded));
            }
        }

        let entry = registry.get("shared").unwrap();
        assert!(!entry.is_running());
        assert_eq!(entry.status(), Status::Resolved);
    }

    // ==========================================================================
    // Supersede / abort
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_supersede_storm_keeps_a_resolved_value() {
        let action = Action::new(jittered);
        let mut futures = Vec::new();

        for i in 0..100u64 {
            futures.push(action.run(i, None));
            if fastrand::bool() {
                tokio::task::yield_now().await;
            }
        }

        let results = settle_all(futures).await;

        // The last run is never superseded.
        assert_eq!(results.last().unwrap().as_ref().unwrap(), &99);
        assert!(!action.is_running());
        assert_eq!(action.value(), Some(99));
        assert_eq!(action.finished().unwrap().input(), Some(99));

        let resolved: Vec<u64> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        let superseded = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(resolved.len() + superseded, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_external_cancel_races_completion() {
        let action = Action::new(jittered);

        for i in 0..50u64 {
            let external = CancelToken::new();
            let fut = action.run(i, Some(&external));

            let canceller = {
                let external = external.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(fastrand::u64(0..5))).await;
                    external.cancel(AbortReason::requested("page closed"));
                })
            };

            let result = tokio::time::timeout(Duration::from_secs(5), fut)
                .await
                .expect("future never settled");
            canceller.await.unwrap();

            match result {
                Ok(value) => assert_eq!(value, i),
                Err(err) => assert_eq!(err.abort_reason(), Some(&AbortReason::requested("page closed"))),
            }
            assert!(!action.is_running());
            assert_eq!(external.listener_count(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_yield_lands_after_abort() {
        for _ in 0..50 {
            let work = ManualWork::<u64, ()>::new();
            let inv = Invocation::new(work.clone());
            inv.start((), None);
            let call = work.next_call().await;

            let ctx = call.ctx.clone();
            let yielder = tokio::spawn(async move {
                let mut n = 0u64;
                while ctx.yield_value(n) {
                    n += 1;
                    tokio::task::yield_now().await;
                }
            });

            tokio::time::sleep(Duration::from_millis(fastrand::u64(0..3))).await;
            inv.abort(AbortReason::Superseded);
            let at_abort = inv.current();

            tokio::time::timeout(Duration::from_secs(5), yielder)
                .await
                .expect("yielder kept running after abort")
                .unwrap();
            assert_eq!(inv.current(), at_abort);
            drop(call);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_while_running() {
        let registry: Arc<Registry<u64, u64>> = Arc::new(Registry::new());
        let mut futures = Vec::new();

        for i in 0..40u64 {
            let options = EntryOptions::keyed(format!("k{}", i)).tag(if i % 2 == 0 { "even" } else { "odd" });
            futures.push(registry.run(jittered, options, i, None));
        }

        let deleter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.delete(Criteria::new().tag("even")) })
        };
        let removed = deleter.await.unwrap();
        let results = settle_all(futures).await;

        assert_eq!(removed.len(), 20);
        assert_eq!(registry.len(), 20);
        for (i, result) in results.iter().enumerate() {
            match result {
                Ok(value) => assert_eq!(*value, i as u64),
                Err(err) => {
                    assert_eq!(i % 2, 0);
                    assert_eq!(err.abort_reason(), Some(&AbortReason::Removed));
                }
            }
        }
    }
}
