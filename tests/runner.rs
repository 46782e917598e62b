use futures::future::{join_all, BoxFuture};
use request_runner::{RequestRunner, RunError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Records the args of every call the operation receives.
#[derive(Clone, Default)]
struct Calls(Arc<Mutex<Vec<Vec<i32>>>>);

impl Calls {
    /// Returns the 1-based number of this call.
    fn push(&self, args: &[i32]) -> usize {
        let mut calls = self.0.lock().unwrap();
        calls.push(args.to_vec());
        calls.len()
    }

    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn all(&self) -> Vec<Vec<i32>> {
        self.0.lock().unwrap().clone()
    }
}

type Op = Box<dyn Fn(Vec<i32>) -> BoxFuture<'static, Result<i32, String>> + Send + Sync>;

/// Doubles the sum of its args after `delay`.
fn doubler(calls: &Calls, delay: Duration) -> Op {
    let calls = calls.clone();
    Box::new(move |args| {
        calls.push(&args);
        Box::pin(async move {
            sleep(delay).await;
            Ok(args.iter().sum::<i32>() * 2)
        })
    })
}

/// Follows `script` (true = succeed) call by call, then keeps succeeding.
/// Failures read `fail <n>` where n is the call number.
fn scripted(calls: &Calls, script: Vec<bool>) -> Op {
    let calls = calls.clone();
    Box::new(move |args| {
        let n = calls.push(&args);
        let ok = script.get(n - 1).copied().unwrap_or(true);
        Box::pin(async move {
            if ok {
                Ok(n as i32)
            } else {
                Err(format!("fail {n}"))
            }
        })
    })
}

fn always_failing(calls: &Calls) -> Op {
    scripted(calls, vec![false; 64])
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, line: String) {
        self.0.lock().unwrap().push(line);
    }

    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[tokio::test(start_paused = true)]
async fn auto_run_invokes_once_with_default_params() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(10)))
        .default_params(vec![1, 2])
        .build();

    // The prologue runs during construction.
    assert_eq!(calls.all(), vec![vec![1, 2]]);

    sleep(ms(50)).await;
    assert_eq!(calls.count(), 1);
    assert_eq!(runner.result(), Some(6));
    assert_eq!(runner.params(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn manual_runner_waits_for_invoke() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(10)))
        .manual(true)
        .default_params(vec![1])
        .build();

    sleep(ms(100)).await;
    assert_eq!(calls.count(), 0);
    assert!(runner.result().is_none());

    assert_eq!(runner.invoke(vec![4]).await, Ok(8));
    assert_eq!(calls.all(), vec![vec![4]]);
}

#[tokio::test(start_paused = true)]
async fn single_shot_doubles_and_toggles_busy_once() {
    let runner = RequestRunner::builder(|args: Vec<i32>| async move {
        sleep(ms(10)).await;
        Ok::<_, String>(args[0] * 2)
    })
    .manual(true)
    .build();

    let mut busy = runner.subscribe_busy();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while busy.changed().await.is_ok() {
            seen.push(*busy.borrow_and_update());
        }
        seen
    });

    let invocation = runner.invoke(vec![5]);
    assert!(runner.is_busy());
    assert_eq!(invocation.await, Ok(10));
    assert_eq!(runner.result(), Some(10));
    assert_eq!(runner.failure(), None);
    assert!(!runner.is_busy());

    drop(runner);
    assert_eq!(recorder.await.unwrap(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn fast_operation_never_shows_busy() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(50)))
        .manual(true)
        .loading_delay(ms(100))
        .build();
    let busy = runner.subscribe_busy();

    let invocation = runner.invoke(vec![1]);
    assert!(!runner.is_busy());
    sleep(ms(30)).await;
    assert!(!runner.is_busy());
    assert_eq!(invocation.await, Ok(2));

    sleep(ms(200)).await;
    assert!(!runner.is_busy());
    assert!(!busy.has_changed().unwrap());
}

#[tokio::test(start_paused = true)]
async fn slow_operation_shows_busy_after_delay() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(300)))
        .manual(true)
        .loading_delay(ms(100))
        .build();

    let invocation = runner.invoke(vec![1]);
    sleep(ms(50)).await;
    assert!(!runner.is_busy());
    sleep(ms(100)).await;
    assert!(runner.is_busy());

    assert_eq!(invocation.await, Ok(2));
    assert!(!runner.is_busy());
}

#[tokio::test(start_paused = true)]
async fn polling_success_resets_retry_count() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(scripted(
        &calls,
        vec![false, false, true, false, false],
    ))
    .manual(true)
    .polling_interval(ms(100))
    .polling_max_error_retries(3)
    .build();

    drop(runner.invoke(vec![]));

    // Executions at 0, 100, 200, 300 and 400ms.
    sleep(ms(450)).await;
    assert_eq!(calls.count(), 5);
    assert!(runner.is_polling());
    assert_eq!(runner.polling_retry_count(), 2);

    sleep(ms(100)).await;
    assert_eq!(calls.count(), 6);
    assert_eq!(runner.polling_retry_count(), 0);

    runner.cancel();
    assert!(!runner.is_polling());
}

#[tokio::test(start_paused = true)]
async fn polling_stops_after_max_consecutive_failures() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(always_failing(&calls))
        .manual(true)
        .polling_interval(ms(100))
        .polling_max_error_retries(3)
        .build();
    let mut polling = runner.subscribe_polling();

    drop(runner.invoke(vec![]));
    assert!(runner.is_polling());

    sleep(ms(2_000)).await;
    assert_eq!(calls.count(), 3);
    assert!(!runner.is_polling());
    assert!(runner.is_cancelled());
    assert_eq!(runner.polling_retry_count(), 3);
    assert_eq!(runner.failure().as_deref(), Some("fail 3"));
    assert!(!*polling.borrow_and_update());
}

#[tokio::test(start_paused = true)]
async fn zero_retries_stops_after_first_failure() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(always_failing(&calls))
        .manual(true)
        .polling_interval(ms(100))
        .polling_max_error_retries(0)
        .build();

    drop(runner.invoke(vec![]));
    sleep(ms(1_000)).await;
    assert_eq!(calls.count(), 1);
    assert!(!runner.is_polling());
}

#[tokio::test(start_paused = true)]
async fn polling_halts_after_two_rejections() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(always_failing(&calls))
        .manual(true)
        .polling_interval(ms(100))
        .polling_max_error_retries(2)
        .build();

    // The invocation reports the first execution of the chain.
    assert_eq!(
        runner.invoke(vec![]).await,
        Err(RunError::Operation("fail 1".to_string()))
    );

    sleep(ms(1_000)).await;
    assert_eq!(calls.count(), 2);
    assert!(!runner.is_polling());
    assert_eq!(runner.failure().as_deref(), Some("fail 2"));
}

#[tokio::test(start_paused = true)]
async fn polling_keeps_current_params_over_invoke_args() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(0)))
        .manual(true)
        .default_params(vec![1])
        .polling_interval(ms(100))
        .build();

    assert_eq!(runner.invoke(vec![7]).await, Ok(2));
    sleep(ms(150)).await;
    assert_eq!(calls.all(), vec![vec![1], vec![1]]);
    assert_eq!(runner.params(), vec![1]);
    runner.cancel();
}

#[tokio::test(start_paused = true)]
async fn reinvoking_replaces_the_polling_chain() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(0)))
        .manual(true)
        .polling_interval(ms(100))
        .build();

    drop(runner.invoke(vec![]));
    assert_eq!(calls.count(), 1);
    sleep(ms(30)).await;
    drop(runner.invoke(vec![]));
    assert_eq!(calls.count(), 2);

    // The first chain would have ticked at 100ms.
    sleep(ms(80)).await;
    assert_eq!(calls.count(), 2);
    sleep(ms(30)).await;
    assert_eq!(calls.count(), 3);
    sleep(ms(100)).await;
    assert_eq!(calls.count(), 4);
    assert!(runner.is_polling());
    runner.cancel();
}

#[tokio::test(start_paused = true)]
async fn retry_count_carries_over_into_a_new_chain() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(always_failing(&calls))
        .manual(true)
        .polling_interval(ms(100))
        .polling_max_error_retries(2)
        .build();

    drop(runner.invoke(vec![]));
    sleep(ms(1_000)).await;
    assert_eq!(calls.count(), 2);
    assert_eq!(runner.polling_retry_count(), 2);

    // The budget is already spent, so one more failure stops the new chain.
    drop(runner.invoke(vec![]));
    sleep(ms(1_000)).await;
    assert_eq!(calls.count(), 3);
    assert_eq!(runner.polling_retry_count(), 3);
    assert!(!runner.is_polling());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replaced_chain_skips_a_tick_caught_in_before_run() {
    let calls = Calls::default();
    let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let seen = AtomicUsize::new(0);

    let runner = RequestRunner::builder(doubler(&calls, ms(0)))
        .manual(true)
        .default_params(vec![1])
        .polling_interval(ms(200))
        .before_run(move |_| {
            // Hold the first scheduled tick of the first chain.
            if seen.fetch_add(1, Ordering::SeqCst) == 1 {
                let _ = entered_tx.lock().unwrap().send(());
                let _ = release_rx.lock().unwrap().recv();
            }
        })
        .build();

    drop(runner.invoke(vec![]));
    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .unwrap()
        .unwrap();

    drop(runner.invoke(vec![]));
    assert_eq!(calls.count(), 2);
    release_tx.send(()).unwrap();

    sleep(ms(50)).await;
    assert_eq!(calls.count(), 2);
    assert!(runner.is_polling());
    assert!(!runner.is_cancelled());

    sleep(ms(250)).await;
    assert_eq!(calls.count(), 3);
    assert!(runner.is_polling());
    runner.cancel();
}

#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(10)))
        .manual(true)
        .build();

    runner.cancel();
    runner.cancel();
    assert!(runner.is_cancelled());
    assert!(!runner.is_busy());
    assert!(!runner.is_polling());
    assert_eq!(calls.count(), 0);

    // A fresh invoke clears the abort flag.
    assert_eq!(runner.invoke(vec![2]).await, Ok(4));
    runner.cancel();
    runner.cancel();
    assert_eq!(runner.result(), Some(4));
}

#[tokio::test(start_paused = true)]
async fn debounce_runs_only_the_last_call() {
    let calls = Calls::default();
    let log = Log::default();
    let before = log.clone();
    let runner = RequestRunner::builder(doubler(&calls, ms(0)))
        .manual(true)
        .debounce(ms(100))
        .before_run(move |args| before.push(format!("before {args:?}")))
        .build();

    let mut invocations = Vec::new();
    for i in 1..=5 {
        invocations.push(runner.invoke(vec![i]));
        sleep(ms(10)).await;
    }
    sleep(ms(300)).await;

    assert_eq!(calls.all(), vec![vec![5]]);
    assert_eq!(log.lines(), vec!["before [5]".to_string()]);

    let outcomes = join_all(invocations).await;
    assert!(outcomes[..4]
        .iter()
        .all(|o| *o == Err(RunError::Discarded)));
    assert_eq!(outcomes[4], Ok(10));
}

#[tokio::test(start_paused = true)]
async fn debounce_takes_priority_over_throttle() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(0)))
        .manual(true)
        .debounce(ms(50))
        .throttle(ms(50))
        .build();

    let first = runner.invoke(vec![1]);
    let last = runner.invoke(vec![2]);
    assert_eq!(last.await, Ok(4));
    assert_eq!(first.await, Err(RunError::Discarded));
    assert_eq!(calls.all(), vec![vec![2]]);
}

#[tokio::test(start_paused = true)]
async fn throttle_keeps_the_leading_call() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(0)))
        .manual(true)
        .throttle(ms(100))
        .build();

    let mut invocations = Vec::new();
    for i in 1..=5 {
        invocations.push(runner.invoke(vec![i]));
        sleep(ms(10)).await;
    }

    let outcomes = join_all(invocations).await;
    assert_eq!(outcomes[0], Ok(2));
    assert!(outcomes[1..]
        .iter()
        .all(|o| *o == Err(RunError::Throttled)));
    assert_eq!(calls.all(), vec![vec![1]]);

    // A new window admits the next call.
    sleep(ms(200)).await;
    assert_eq!(runner.invoke(vec![9]).await, Ok(18));
    assert_eq!(calls.all(), vec![vec![1], vec![9]]);
}

#[tokio::test(start_paused = true)]
async fn cancel_does_not_stop_an_execution_in_flight() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(100)))
        .manual(true)
        .build();

    let invocation = runner.invoke(vec![3]);
    sleep(ms(10)).await;
    runner.cancel();
    assert!(runner.is_busy());

    assert_eq!(invocation.await, Ok(6));
    assert_eq!(runner.result(), Some(6));
    assert!(!runner.is_busy());
}

#[tokio::test(start_paused = true)]
async fn cancel_discards_a_pending_debounced_call() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(0)))
        .manual(true)
        .debounce(ms(100))
        .build();

    let invocation = runner.invoke(vec![1]);
    runner.cancel();
    assert_eq!(invocation.await, Err(RunError::Discarded));

    sleep(ms(300)).await;
    assert_eq!(calls.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_runner_stops_polling() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(0)))
        .polling_interval(ms(100))
        .build();

    // Executions at 0, 100 and 200ms.
    sleep(ms(250)).await;
    assert_eq!(calls.count(), 3);

    drop(runner);
    sleep(ms(1_000)).await;
    assert_eq!(calls.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn failure_propagates_and_hooks_run_in_order() {
    let calls = Calls::default();
    let log = Log::default();
    let (before, error, success, settle) = (log.clone(), log.clone(), log.clone(), log.clone());
    let runner = RequestRunner::builder(scripted(&calls, vec![false, true]))
        .manual(true)
        .before_run(move |args| before.push(format!("before {args:?}")))
        .on_error(move |err, params| error.push(format!("error {err} {params:?}")))
        .on_success(move |value, params| success.push(format!("success {value} {params:?}")))
        .on_settle(move |params, result, failure| {
            settle.push(format!("settle {params:?} {result:?} {failure:?}"))
        })
        .build();

    assert_eq!(
        runner.invoke(vec![7]).await,
        Err(RunError::Operation("fail 1".to_string()))
    );
    assert_eq!(runner.failure().as_deref(), Some("fail 1"));
    assert!(runner.result().is_none());

    assert_eq!(runner.invoke(vec![8]).await, Ok(2));
    assert_eq!(runner.failure(), None);

    assert_eq!(
        log.lines(),
        vec![
            "before [7]",
            "error fail 1 [7]",
            r#"settle [7] None Some("fail 1")"#,
            "before [8]",
            "success 2 [8]",
            "settle [8] Some(2) None",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn empty_args_fall_back_to_defaults_and_refresh_reuses_params() {
    let calls = Calls::default();
    let runner = RequestRunner::builder(doubler(&calls, ms(5)))
        .manual(true)
        .default_params(vec![1])
        .build();

    assert_eq!(runner.invoke(vec![]).await, Ok(2));
    assert_eq!(runner.params(), vec![1]);

    assert_eq!(runner.invoke(vec![4]).await, Ok(8));
    assert_eq!(runner.refresh().await, Ok(8));
    assert_eq!(calls.all(), vec![vec![1], vec![4], vec![4]]);
}
