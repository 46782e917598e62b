//! Debounce/throttle gate in front of the core execution.
//!
//! The gate decides whether and when an execution starts. A call it rejects
//! never reaches `before_run` or any other hook.

use super::{Reply, RunError, Shared, Value};
use crate::model::InvocationGate;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Default)]
pub(super) struct GateState {
    /// Trailing debounce timer holding the latest call.
    pending: Option<JoinHandle<()>>,
    generation: u64,
    /// End of the current throttle window.
    window_until: Option<Instant>,
}

impl GateState {
    /// Drop the pending debounced call. Its caller observes `RunError::Discarded`.
    pub(super) fn clear_pending(&mut self) {
        if let Some(timer) = self.pending.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }
}

impl<A: Value, T: Value, E: Value> Shared<A, T, E> {
    pub(super) fn dispatch(self: &Arc<Self>, args: Vec<A>, reply: Reply<T, E>) {
        match self.config.invocation_gate() {
            InvocationGate::Immediate => self.execute(args, reply),
            InvocationGate::Debounce(wait) => self.debounce(wait, args, reply),
            InvocationGate::Throttle(window) => self.throttle(window, args, reply),
        }
    }

    fn debounce(self: &Arc<Self>, wait: Duration, args: Vec<A>, reply: Reply<T, E>) {
        let mut state = self.state.lock();
        if state.gate.pending.is_some() {
            tracing::debug!("debounce: superseding pending call");
        }
        state.gate.clear_pending();
        let generation = state.gate.generation;
        let shared = Arc::clone(self);
        state.gate.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            {
                let mut state = shared.state.lock();
                if state.gate.generation != generation {
                    return;
                }
                state.gate.pending = None;
            }
            shared.execute(args, reply);
        }));
    }

    fn throttle(self: &Arc<Self>, window: Duration, args: Vec<A>, reply: Reply<T, E>) {
        let now = Instant::now();
        let admitted = {
            let mut state = self.state.lock();
            match state.gate.window_until {
                Some(until) if now < until => false,
                _ => {
                    state.gate.window_until = Some(now + window);
                    true
                }
            }
        };

        if admitted {
            self.execute(args, reply);
        } else {
            tracing::debug!("throttle: dropping call inside window");
            let _ = reply.send(Err(RunError::Throttled));
        }
    }
}
