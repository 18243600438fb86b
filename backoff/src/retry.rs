use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Notify, Operation, Silent};

/// The retry flips between running the [Operation] and sleeping for the next delay handed out
/// by the strategy:
/// ```text
///            (Ok) ------------------------------------> [Ok]
///           /
/// (Running)         (not retryable) ------------------> [Err]
///           \      /
///            (Err)                  (strategy exhausted) -> [Err]
///                  \               /
///                   (retryable) ---
///                                  \
///                                   (notify) -> (Sleeping) -> (Running)
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Future that resolves to the first success, the first non-retryable error, or the last error
/// once the strategy runs dry.
#[pin_project]
pub struct Retry<I, O, C, N = Silent>
where
    O: Operation,
{
    #[pin]
    state: RetryState<O>,
    strategy: I,
    operation: O,
    condition: C,
    notify: N,
    attempt: usize,
}

impl<I, O, C> Retry<I, O, C, Silent>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<S>(strategy: S, mut operation: O, condition: C) -> Self
    where
        S: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            state: RetryState::Running(operation.run()),
            strategy: strategy.into_iter(),
            operation,
            condition,
            notify: Silent,
            attempt: 1,
        }
    }

    /// Attaches a hook invoked with every retryable failure before sleeping.
    pub fn notify<N>(self, notify: N) -> Retry<I, O, C, N>
    where
        N: Notify<O::Error>,
    {
        Retry {
            state: self.state,
            strategy: self.strategy,
            operation: self.operation,
            condition: self.condition,
            notify,
            attempt: self.attempt,
        }
    }
}

impl<I, O, C, N> Future for Retry<I, O, C, N>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
    N: Notify<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.state.as_mut().project() {
                RetryStateProj::Running(op) => {
                    let err = match op.poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                        Poll::Ready(Err(err)) => err,
                    };
                    if !this.condition.can_retry(&err) {
                        return Poll::Ready(Err(err));
                    }
                    let Some(delay) = this.strategy.next() else {
                        return Poll::Ready(Err(err));
                    };
                    this.notify.notify(&err, *this.attempt, delay);
                    this.state
                        .set(RetryState::Sleeping(sleep_until(Instant::now() + delay)));
                }
                RetryStateProj::Sleeping(sleep) => {
                    if sleep.poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    *this.attempt += 1;
                    let next = this.operation.run();
                    this.state.set(RetryState::Running(next));
                }
            }
        }
    }
}
