//! Self-rescheduling polling chain with a consecutive-failure budget.

use super::{Reply, RunError, Shared, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A polling tick that either got past its prologue and runs on its own task,
/// or was skipped at the checkpoint.
type Tick<T, E> = Result<JoinHandle<Result<T, E>>, RunError<E>>;

impl<A: Value, T: Value, E: Value> Shared<A, T, E> {
    /// Start a new chain over the current params.
    ///
    /// The first execution's prologue runs before this returns; the chain task
    /// itself is the single polling timer that `cancel` aborts.
    pub(super) fn start_polling(self: &Arc<Self>, reply: Reply<T, E>) {
        let (chain, params) = {
            let mut state = self.state.lock();
            state.polling_chain = state.polling_chain.wrapping_add(1);
            (state.polling_chain, state.params.clone())
        };

        let first = self.tick(params, chain);
        let task = tokio::spawn(Arc::clone(self).poll_chain(chain, first, reply));

        let mut state = self.state.lock();
        if state.polling_chain == chain {
            self.polling.send_replace(true);
            state.polling_timer = Some(task);
        } else {
            task.abort();
        }
    }

    /// Runs the prologue and spawns the rest with no await in between, so
    /// aborting the chain never strands an execution that already started.
    fn tick(self: &Arc<Self>, params: Vec<A>, chain: u64) -> Tick<T, E> {
        self.start_in(params, Some(chain)).map(tokio::spawn)
    }

    async fn poll_chain(self: Arc<Self>, chain: u64, first: Tick<T, E>, reply: Reply<T, E>) {
        let mut reply = Some(reply);
        let mut next = first;

        loop {
            let execution = match next {
                Ok(execution) => execution,
                Err(err) => {
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(err));
                    }
                    return;
                }
            };

            let outcome = match execution.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(error = %err, "polling execution task failed, stopping");
                    self.stop_chain(chain);
                    return;
                }
            };

            if let Some(reply) = reply.take() {
                let _ = reply.send(outcome.clone().map_err(RunError::Operation));
            }

            if !self.record_poll(chain, outcome.is_ok()) {
                return;
            }

            tokio::time::sleep(self.config.polling_interval).await;
            let params = self.state.lock().params.clone();
            next = self.tick(params, chain);
        }
    }

    /// Update the retry budget. Returns `false` once the chain must stop,
    /// including when a newer chain has replaced it.
    fn record_poll(&self, chain: u64, ok: bool) -> bool {
        let mut state = self.state.lock();
        if state.polling_chain != chain {
            return false;
        }
        if ok {
            state.polling_retry_count = 0;
            return true;
        }

        state.polling_retry_count = state.polling_retry_count.saturating_add(1);
        let retries = state.polling_retry_count;
        let max = self.config.polling_max_error_retries;
        if retries < max {
            drop(state);
            tracing::warn!(retries, max, "polling execution failed");
            return true;
        }

        self.halt(&mut state);
        drop(state);
        tracing::warn!(retries, max, "polling reached max error retries, stopping");
        false
    }

    fn stop_chain(&self, chain: u64) {
        let mut state = self.state.lock();
        if state.polling_chain == chain {
            self.halt(&mut state);
        }
    }
}
