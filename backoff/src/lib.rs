//! Retry a fallible async operation, sleeping between attempts as prescribed by a
//! [strategy] (any `Iterator<Item = Duration>`).
//!
//! ```
//! # async fn demo() {
//! use backoff::retry::Retry;
//! use backoff::strategy::exponential::Exponential;
//!
//! let result = Retry::new(
//!     Exponential::from_millis(10, 100).max_attempts(3),
//!     || async { Ok::<_, String>(1) },
//!     |_: &String| true,
//! )
//! .await;
//! assert_eq!(result, Ok(1));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

pub mod retry;
pub mod strategy;

/// An operation that can be started again for every attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<T, E, Fut, F> Operation for F
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    type Item = T;
    type Error = E;
    type Future = Fut;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether an error is worth another attempt.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// Observes a failed attempt right before the cool off. `attempt` starts at 1.
pub trait Notify<E> {
    fn notify(&mut self, error: &E, attempt: usize, delay: Duration);
}

/// No-op [Notify].
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl<E> Notify<E> for Silent {
    fn notify(&mut self, _: &E, _: usize, _: Duration) {}
}

impl<E, F> Notify<E> for F
where
    F: FnMut(&E, usize, Duration),
{
    fn notify(&mut self, error: &E, attempt: usize, delay: Duration) {
        self(error, attempt, delay)
    }
}
