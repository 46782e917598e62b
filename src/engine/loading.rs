//! Busy-delay: postpones the visible busy flag so fast operations never flicker it.

use super::{Shared, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// At most one armed loading-delay timer per runner.
#[derive(Default)]
pub(super) struct LoadingTimer {
    timer: Option<JoinHandle<()>>,
    // Bumped on every disarm so a timer that already woke up cannot flip the flag late.
    generation: u64,
}

impl LoadingTimer {
    pub(super) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }
}

impl<A: Value, T: Value, E: Value> Shared<A, T, E> {
    pub(super) fn begin_loading(self: &Arc<Self>) {
        if *self.busy.borrow() {
            return;
        }

        let delay = self.config.loading_delay;
        if delay.is_zero() {
            self.set_busy(true);
            return;
        }

        let mut state = self.state.lock();
        state.loading.disarm();
        let generation = state.loading.generation;
        let shared = Arc::downgrade(self);
        state.loading.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.state.lock();
            if state.loading.generation == generation {
                state.loading.timer = None;
                shared.set_busy(true);
            }
        }));
    }

    pub(super) fn stop_loading(&self) {
        self.state.lock().loading.disarm();
        self.set_busy(false);
    }

    fn set_busy(&self, busy: bool) {
        self.busy.send_if_modified(|current| {
            if *current == busy {
                false
            } else {
                *current = busy;
                true
            }
        });
    }
}
