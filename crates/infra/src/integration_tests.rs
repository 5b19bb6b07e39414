//! Cross-component tests over the in-memory backends.
//!
//! Covers:
//! - concurrent transfers in both directions over one account pair
//! - the lock-order hazard the transfer workflow avoids
//! - cancellation of an open transaction
//! - registration → task dispatch → verification email

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::Barrier;

    use simplebank_core::AccountId;
    use simplebank_ledger::{
        BalanceAdjustment, CreateAccountParams, CreateUserParams, Currency, ListTransfersParams,
        TransferMoneyParams, User,
    };

    use crate::db::{InMemoryDatabase, LedgerStore, Queries, StoreError, StoreResult};
    use crate::mail::testing::RecordingSender;
    use crate::tasks::{
        InMemoryTaskQueue, ProcessorConfig, RetryBackoff, SendVerifyEmailPayload, TaskDistributor,
        TaskOptions, TaskOutcome, TaskProcessor, TaskQueue, TaskState, VerifyEmailHandler,
        QUEUE_CRITICAL,
    };

    type Store = LedgerStore<InMemoryDatabase>;

    fn user(name: &str) -> CreateUserParams {
        CreateUserParams {
            username: name.to_string(),
            hashed_password: "hash".to_string(),
            full_name: format!("{name} tester"),
            email: format!("{name}@example.com"),
        }
    }

    async fn two_accounts(db: InMemoryDatabase) -> (Store, AccountId, AccountId) {
        let store = LedgerStore::new(db);
        let mut ids = Vec::new();
        for (owner, balance) in [("alice", 100), ("bob", 50)] {
            store.create_user(&user(owner)).await.unwrap();
            let account = store
                .create_account(&CreateAccountParams {
                    owner: owner.to_string(),
                    balance,
                    currency: Currency::Usd,
                })
                .await
                .unwrap();
            ids.push(account.id);
        }
        (store, ids[0], ids[1])
    }

    fn transfer(from: AccountId, to: AccountId, amount: i64) -> TransferMoneyParams {
        TransferMoneyParams {
            from_account_id: from,
            to_account_id: to,
            amount,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn opposite_direction_transfers_do_not_deadlock() {
        let (store, a, b) = two_accounts(InMemoryDatabase::new()).await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            handles.push(tokio::spawn(async move {
                store.transfer_money(transfer(from, to, 10)).await
            }));
        }

        let all = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(handles))
            .await
            .expect("transfers should not deadlock");
        for result in all {
            result.unwrap().unwrap().check_conservation().unwrap();
        }

        assert_eq!(store.get_account(a).await.unwrap().balance, 100);
        assert_eq!(store.get_account(b).await.unwrap().balance, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transfers_move_exactly_k_times_amount() {
        let (store, a, b) = two_accounts(InMemoryDatabase::new()).await;
        let k = 10;

        let handles: Vec<_> = (0..k)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.transfer_money(transfer(a, b, 5)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.get_account(a).await.unwrap().balance, 100 - 5 * k);
        assert_eq!(store.get_account(b).await.unwrap().balance, 50 + 5 * k);
        let transfers = store
            .list_transfers(ListTransfersParams {
                from_account_id: a,
                to_account_id: b,
                limit: 100,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(transfers.len(), k as usize);
    }

    /// Locks `first` then `second`, pausing in between so that two callers
    /// with swapped arguments each hold the lock the other wants.
    async fn lock_pair(
        store: Store,
        first: AccountId,
        second: AccountId,
        barrier: Arc<Barrier>,
    ) -> StoreResult<()> {
        store
            .exec_tx(move |q| {
                Box::pin(async move {
                    q.get_account_for_update(first).await?;
                    barrier.wait().await;
                    q.get_account_for_update(second).await?;
                    Ok(())
                })
            })
            .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn role_ordered_locking_times_out_under_contention() {
        let db = InMemoryDatabase::with_lock_timeout(Duration::from_millis(200));
        let (store, a, b) = two_accounts(db).await;
        let barrier = Arc::new(Barrier::new(2));

        let ab = tokio::spawn(lock_pair(store.clone(), a, b, barrier.clone()));
        let ba = tokio::spawn(lock_pair(store.clone(), b, a, barrier));
        let results = [ab.await.unwrap(), ba.await.unwrap()];

        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(StoreError::Transient(_)))),
            "expected a lock timeout, got {results:?}"
        );

        // The ordered workflow over the same pair still completes.
        store.transfer_money(transfer(a, b, 1)).await.unwrap();
        store.transfer_money(transfer(b, a, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_transaction_leaves_no_writes_and_releases_locks() {
        let (store, a, b) = two_accounts(InMemoryDatabase::new()).await;

        let stalled = store.exec_tx(move |q| {
            Box::pin(async move {
                q.add_account_balance(BalanceAdjustment {
                    account_id: a,
                    amount: 10,
                })
                .await?;
                futures::future::pending::<()>().await;
                Ok(())
            })
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stalled)
                .await
                .is_err()
        );

        assert_eq!(store.get_account(a).await.unwrap().balance, 100);
        tokio::time::timeout(
            Duration::from_secs(1),
            store.transfer_money(transfer(a, b, 30)),
        )
        .await
        .expect("row lock should be released")
        .unwrap();
        assert_eq!(store.get_account(a).await.unwrap().balance, 70);
    }

    struct Harness {
        store: Store,
        queue: Arc<InMemoryTaskQueue>,
        distributor: TaskDistributor,
        processor: TaskProcessor,
        mailer: RecordingSender,
    }

    fn harness() -> Harness {
        let store = LedgerStore::new(InMemoryDatabase::new());
        let queue = InMemoryTaskQueue::arc();
        let distributor = TaskDistributor::new(queue.clone());
        let mailer = RecordingSender::default();

        let mut processor = TaskProcessor::new(queue.clone());
        Arc::new(VerifyEmailHandler::new(
            store.clone(),
            Arc::new(mailer.clone()),
            "http://localhost:8080/v1/verify_email",
        ))
        .register(&mut processor);

        Harness {
            store,
            queue,
            distributor,
            processor,
            mailer,
        }
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig::default().with_backoff(RetryBackoff::none())
    }

    async fn register(
        h: &Harness,
        name: &str,
        options: TaskOptions,
        fail_after_dispatch: bool,
    ) -> Result<User, StoreError> {
        let distributor = h.distributor.clone();
        h.store
            .create_user_with_side_effect(user(name), move |user| async move {
                distributor
                    .send_verify_email(
                        &SendVerifyEmailPayload {
                            username: user.username,
                        },
                        options,
                    )
                    .await?;
                if fail_after_dispatch {
                    anyhow::bail!("post-dispatch check failed");
                }
                Ok::<(), anyhow::Error>(())
            })
            .await
    }

    #[tokio::test]
    async fn registration_sends_verification_email() {
        let h = harness();
        let options = TaskOptions::default().max_retry(10).queue(QUEUE_CRITICAL);

        let created = register(&h, "carol", options, false).await.unwrap();
        assert_eq!(created.username, "carol");
        assert_eq!(h.queue.stats(QUEUE_CRITICAL).await.unwrap().pending, 1);

        let mut rng = StdRng::seed_from_u64(11);
        let outcome = h.processor.process_next(&fast_config(), &mut rng).await.unwrap();
        assert_eq!(outcome, Some(TaskOutcome::Completed));

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["carol@example.com".to_string()]);
        assert!(sent[0].content.contains("secret_code="));
        assert_eq!(h.queue.stats(QUEUE_CRITICAL).await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn callback_error_rolls_back_user_but_task_is_orphaned() {
        let h = harness();
        let options = TaskOptions::default().max_retry(1).queue(QUEUE_CRITICAL);

        let err = register(&h, "dave", options, true).await.unwrap_err();
        assert!(matches!(err, StoreError::AfterCreate(_)));
        assert!(matches!(
            h.store.get_user("dave").await,
            Err(StoreError::NotFound(_))
        ));

        // The task was enqueued before the rollback; it can never find the
        // user, so it runs out of retries.
        let mut rng = StdRng::seed_from_u64(5);
        let config = fast_config();
        let first = h.processor.process_next(&config, &mut rng).await.unwrap();
        assert!(matches!(first, Some(TaskOutcome::Retried { retry: 1, .. })));
        let second = h.processor.process_next(&config, &mut rng).await.unwrap();
        assert_eq!(second, Some(TaskOutcome::Dead));

        let dead = h.queue.dead_tasks(QUEUE_CRITICAL, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].state, TaskState::Dead);
        assert!(dead[0]
            .last_error
            .as_deref()
            .unwrap_or_default()
            .starts_with("failed to get user"));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_conflict_and_dispatches_nothing() {
        let h = harness();
        h.store.create_user(&user("erin")).await.unwrap();

        let err = register(&h, "erin", TaskOptions::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(h.queue.stats("default").await.unwrap().pending, 0);
    }
}
