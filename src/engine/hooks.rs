use std::sync::Arc;

pub type BeforeRun<A> = Arc<dyn Fn(&[A]) + Send + Sync>;
pub type OnSuccess<A, T> = Arc<dyn Fn(&T, &[A]) + Send + Sync>;
pub type OnError<A, E> = Arc<dyn Fn(&E, &[A]) + Send + Sync>;
pub type OnSettle<A, T, E> = Arc<dyn Fn(&[A], Option<&T>, Option<&E>) + Send + Sync>;

/// Lifecycle observers called synchronously by each execution.
///
/// `before_run` receives the raw invocation args. The other hooks receive the
/// params currently recorded in the execution context; `on_settle` also gets the
/// last stored result and failure, which may predate this execution.
pub(crate) struct Hooks<A, T, E> {
    pub before_run: Option<BeforeRun<A>>,
    pub on_success: Option<OnSuccess<A, T>>,
    pub on_error: Option<OnError<A, E>>,
    pub on_settle: Option<OnSettle<A, T, E>>,
}

impl<A, T, E> Default for Hooks<A, T, E> {
    fn default() -> Self {
        Self {
            before_run: None,
            on_success: None,
            on_error: None,
            on_settle: None,
        }
    }
}
