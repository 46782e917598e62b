//! Operation runner.
//!
//! Wraps a caller-supplied async operation and layers execution policy on top of it:
//! automatic or manual triggering, parameter tracking, a delayed busy flag,
//! debounce/throttle gating, interval polling with bounded error retry, and
//! cooperative cancellation.

mod gate;
mod hooks;
pub mod http;
mod loading;
mod polling;

pub use hooks::{BeforeRun, OnError, OnSettle, OnSuccess};

use hooks::Hooks;

use crate::model::RunnerConfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Bound shared by parameters, results and failures kept in the execution context.
pub trait Value: Clone + Send + Sync + 'static {}

impl<V: Clone + Send + Sync + 'static> Value for V {}

type Operation<A, T, E> = Arc<dyn Fn(Vec<A>) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type Reply<T, E> = oneshot::Sender<Result<T, RunError<E>>>;
/// Remainder of an execution after its synchronous prologue.
type Pending<T, E> = BoxFuture<'static, Result<T, E>>;

/// Why an invocation did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError<E> {
    /// The wrapped operation failed.
    #[error("operation failed: {0}")]
    Operation(E),
    /// The runner was cancelled before the execution reached its entry checkpoint.
    #[error("runner was cancelled before the execution started")]
    Aborted,
    /// Superseded by a later debounced call, or cleared by `cancel` before it fired.
    #[error("invocation was discarded before it executed")]
    Discarded,
    /// Dropped because an earlier call already opened the throttle window.
    #[error("invocation was dropped by the throttle window")]
    Throttled,
}

/// Outcome of a single `invoke` or `refresh` call.
///
/// Awaiting it is optional: dropping an `Invocation` never cancels the work it
/// represents. In polling mode it resolves with the first execution of the chain.
pub struct Invocation<T, E> {
    rx: oneshot::Receiver<Result<T, RunError<E>>>,
}

impl<T, E> Future for Invocation<T, E> {
    type Output = Result<T, RunError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            // The reply was dropped unanswered: a debounce timer was replaced or cleared.
            Err(_) => Poll::Ready(Err(RunError::Discarded)),
        }
    }
}

struct State<A, T, E> {
    result: Option<T>,
    failure: Option<E>,
    params: Vec<A>,
    abort: bool,
    polling_retry_count: u32,
    polling_timer: Option<JoinHandle<()>>,
    /// Identifies the live polling chain. Bumped whenever a chain starts or is cancelled.
    polling_chain: u64,
    loading: loading::LoadingTimer,
    gate: gate::GateState,
}

impl<A, T, E> State<A, T, E> {
    fn superseded(&self, chain: Option<u64>) -> bool {
        chain.is_some_and(|chain| chain != self.polling_chain)
    }
}

struct Shared<A, T, E> {
    operation: Operation<A, T, E>,
    config: RunnerConfig,
    default_params: Vec<A>,
    hooks: Hooks<A, T, E>,
    state: Mutex<State<A, T, E>>,
    busy: watch::Sender<bool>,
    polling: watch::Sender<bool>,
}

impl<A: Value, T: Value, E: Value> Shared<A, T, E> {
    fn cancel(&self) {
        let mut state = self.state.lock();
        self.halt(&mut state);
    }

    /// Clears every timer, sets the abort flag and retires the polling chain.
    ///
    /// The polling flag is published under the state lock so a retired chain
    /// can never overwrite the flag of the chain that replaced it.
    fn halt(&self, state: &mut State<A, T, E>) {
        if let Some(timer) = state.polling_timer.take() {
            timer.abort();
        }
        state.polling_chain = state.polling_chain.wrapping_add(1);
        state.loading.disarm();
        state.gate.clear_pending();
        state.abort = true;
        self.polling
            .send_if_modified(|active| std::mem::replace(active, false));
    }

    fn start(self: &Arc<Self>, args: Vec<A>) -> Result<Pending<T, E>, RunError<E>> {
        self.start_in(args, None)
    }

    /// Synchronous prologue of an execution.
    ///
    /// Runs the abort checkpoint, `before_run`, parameter bookkeeping and the
    /// busy-delay, then returns the rest of the execution as a future. A polling
    /// tick passes its `chain` and is skipped once that chain has been replaced,
    /// even if the replacement happened while `before_run` was running.
    fn start_in(
        self: &Arc<Self>,
        args: Vec<A>,
        chain: Option<u64>,
    ) -> Result<Pending<T, E>, RunError<E>> {
        {
            let state = self.state.lock();
            if state.abort || state.superseded(chain) {
                tracing::debug!("runner cancelled, skipping execution");
                return Err(RunError::Aborted);
            }
        }

        if let Some(hook) = &self.hooks.before_run {
            hook(args.as_slice());
        }

        let params = {
            let mut state = self.state.lock();
            if state.superseded(chain) {
                tracing::debug!("polling chain replaced, skipping tick");
                return Err(RunError::Aborted);
            }
            state.failure = None;
            state.params = if args.is_empty() {
                self.default_params.clone()
            } else {
                args
            };
            state.params.clone()
        };

        self.begin_loading();
        tracing::debug!(params = params.len(), "execution started");

        let pending = (self.operation)(params);
        let shared = Arc::clone(self);
        Ok(async move {
            let outcome = pending.await;
            shared.settle(outcome)
        }
        .boxed())
    }

    fn settle(&self, outcome: Result<T, E>) -> Result<T, E> {
        match &outcome {
            Ok(value) => {
                let params = {
                    let mut state = self.state.lock();
                    state.result = Some(value.clone());
                    state.params.clone()
                };
                if let Some(hook) = &self.hooks.on_success {
                    hook(value, params.as_slice());
                }
            }
            Err(err) => {
                let params = {
                    let mut state = self.state.lock();
                    state.failure = Some(err.clone());
                    state.params.clone()
                };
                if let Some(hook) = &self.hooks.on_error {
                    hook(err, params.as_slice());
                }
            }
        }

        self.stop_loading();

        if let Some(hook) = &self.hooks.on_settle {
            let (params, result, failure) = {
                let state = self.state.lock();
                (
                    state.params.clone(),
                    state.result.clone(),
                    state.failure.clone(),
                )
            };
            hook(params.as_slice(), result.as_ref(), failure.as_ref());
        }

        outcome
    }

    /// Runs the prologue now and the remainder on its own task, so that
    /// cancelling timers never drops an execution that already started.
    fn execute(self: &Arc<Self>, args: Vec<A>, reply: Reply<T, E>) {
        match self.start(args) {
            Ok(pending) => {
                tokio::spawn(async move {
                    let _ = reply.send(pending.await.map_err(RunError::Operation));
                });
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Wraps an async operation with triggering, busy-delay, gating, polling and cancellation.
///
/// Dropping the runner cancels it: pending timers are cleared and executions that
/// have not reached their entry checkpoint are skipped.
///
/// All methods that schedule work must be called from within a Tokio runtime.
pub struct RequestRunner<A, T, E>
where
    A: Value,
    T: Value,
    E: Value,
{
    shared: Arc<Shared<A, T, E>>,
}

impl<A: Value, T: Value, E: Value> RequestRunner<A, T, E> {
    /// Start configuring a runner around `operation`.
    pub fn builder<F, Fut>(operation: F) -> RunnerBuilder<A, T, E>
    where
        F: Fn(Vec<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let operation: Operation<A, T, E> = Arc::new(move |params| operation(params).boxed());
        RunnerBuilder {
            operation,
            config: RunnerConfig::default(),
            default_params: Vec::new(),
            hooks: Hooks::default(),
        }
    }

    /// Trigger a run with `args`, or with the default params when `args` is empty.
    ///
    /// Any pending polling chain and loading-delay timer are cleared first. With a
    /// polling interval configured this starts a new polling chain over the
    /// current params and `args` is not used; otherwise a single execution goes
    /// through the debounce/throttle gate.
    pub fn invoke(&self, args: Vec<A>) -> Invocation<T, E> {
        let (reply, rx) = oneshot::channel();

        self.shared.cancel();
        self.shared.state.lock().abort = false;

        if self.shared.config.polling_enabled() {
            self.shared.start_polling(reply);
        } else {
            self.shared.dispatch(args, reply);
        }

        Invocation { rx }
    }

    /// Invoke again with the last-used params.
    pub fn refresh(&self) -> Invocation<T, E> {
        let params = self.params();
        self.invoke(params)
    }

    /// Stop polling, clear pending timers and skip executions that have not started.
    ///
    /// Executions already past their entry checkpoint still complete and still
    /// update the context. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_busy(&self) -> bool {
        *self.shared.busy.borrow()
    }

    /// Watch the busy flag. Only real transitions are published.
    pub fn subscribe_busy(&self) -> watch::Receiver<bool> {
        self.shared.busy.subscribe()
    }

    pub fn result(&self) -> Option<T> {
        self.shared.state.lock().result.clone()
    }

    pub fn failure(&self) -> Option<E> {
        self.shared.state.lock().failure.clone()
    }

    pub fn params(&self) -> Vec<A> {
        self.shared.state.lock().params.clone()
    }

    pub fn polling_retry_count(&self) -> u32 {
        self.shared.state.lock().polling_retry_count
    }

    pub fn is_polling(&self) -> bool {
        *self.shared.polling.borrow()
    }

    /// Watch whether a polling chain is active.
    pub fn subscribe_polling(&self) -> watch::Receiver<bool> {
        self.shared.polling.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().abort
    }
}

impl<A: Value, T: Value, E: Value> Drop for RequestRunner<A, T, E> {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

/// Builder for [`RequestRunner`].
///
/// ```no_run
/// # async fn demo() {
/// use request_runner::RequestRunner;
/// use std::time::Duration;
///
/// let runner = RequestRunner::builder(|args: Vec<u64>| async move {
///     Ok::<_, String>(args.iter().sum::<u64>())
/// })
/// .manual(true)
/// .loading_delay(Duration::from_millis(200))
/// .on_success(|sum, _params| println!("sum = {sum}"))
/// .build();
///
/// let sum = runner.invoke(vec![1, 2, 3]).await;
/// # }
/// ```
pub struct RunnerBuilder<A, T, E> {
    operation: Operation<A, T, E>,
    config: RunnerConfig,
    default_params: Vec<A>,
    hooks: Hooks<A, T, E>,
}

impl<A: Value, T: Value, E: Value> RunnerBuilder<A, T, E> {
    /// Replace the whole execution policy.
    #[must_use]
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn manual(mut self, manual: bool) -> Self {
        self.config.manual = manual;
        self
    }

    /// Params for the automatic first run and for invocations with no args.
    #[must_use]
    pub fn default_params(mut self, params: Vec<A>) -> Self {
        self.default_params = params;
        self
    }

    #[must_use]
    pub fn loading_delay(mut self, delay: Duration) -> Self {
        self.config.loading_delay = delay;
        self
    }

    #[must_use]
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.config.polling_interval = interval;
        self
    }

    #[must_use]
    pub fn polling_max_error_retries(mut self, retries: u32) -> Self {
        self.config.polling_max_error_retries = retries;
        self
    }

    #[must_use]
    pub fn debounce(mut self, wait: Duration) -> Self {
        self.config.debounce = wait;
        self
    }

    #[must_use]
    pub fn throttle(mut self, window: Duration) -> Self {
        self.config.throttle = window;
        self
    }

    #[must_use]
    pub fn before_run(mut self, hook: impl Fn(&[A]) + Send + Sync + 'static) -> Self {
        self.hooks.before_run = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_success(mut self, hook: impl Fn(&T, &[A]) + Send + Sync + 'static) -> Self {
        self.hooks.on_success = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&E, &[A]) + Send + Sync + 'static) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_settle(
        mut self,
        hook: impl Fn(&[A], Option<&T>, Option<&E>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_settle = Some(Arc::new(hook));
        self
    }

    /// Build the runner. Unless `manual` is set, this immediately invokes once
    /// with the default params, so it must run inside a Tokio runtime.
    pub fn build(self) -> RequestRunner<A, T, E> {
        let (busy, _) = watch::channel(false);
        let (polling, _) = watch::channel(false);
        let manual = self.config.manual;

        let runner = RequestRunner {
            shared: Arc::new(Shared {
                operation: self.operation,
                config: self.config,
                state: Mutex::new(State {
                    result: None,
                    failure: None,
                    params: self.default_params.clone(),
                    abort: false,
                    polling_retry_count: 0,
                    polling_timer: None,
                    polling_chain: 0,
                    loading: loading::LoadingTimer::default(),
                    gate: gate::GateState::default(),
                }),
                default_params: self.default_params,
                hooks: self.hooks,
                busy,
                polling,
            }),
        };

        if !manual {
            let params = runner.shared.default_params.clone();
            drop(runner.invoke(params));
        }

        runner
    }
}
