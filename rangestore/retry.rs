use futures::{future::TryFuture, ready};
use pin_project::pin_project;
use rand::{thread_rng, Rng};
use std::cmp::min;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Sleep};

/// Exponential backoff between attempts of a fallible future.
#[derive(Clone, Debug)]
pub struct Backoff {
    attempt: usize,
    max_attempts: Option<usize>,
    delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Backoff {
    /// Retries until the future succeeds.
    pub fn unlimited() -> Backoff {
        Backoff {
            attempt: 0,
            max_attempts: None,
            delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }

    /// Gives up after `attempts` failed attempts.
    pub fn attempts(attempts: usize) -> Backoff {
        Backoff {
            max_attempts: Some(attempts),
            ..Backoff::unlimited()
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Backoff {
        self.delay = min(delay, self.max_delay);
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Backoff {
        self.max_delay = max_delay;
        self.delay = min(self.delay, max_delay);
        self
    }

    pub fn without_jitter(mut self) -> Backoff {
        self.jitter = false;
        self
    }

    fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let delay = self.delay;
        self.delay = min(self.delay * 2, self.max_delay);
        if self.jitter {
            Some(thread_rng().gen_range(Duration::from_millis(0)..=delay))
        } else {
            Some(delay)
        }
    }

    /// Runs the future built by `attempt` until it succeeds or the attempts
    /// run out, in which case the last error is returned.
    pub fn retry<S, F>(self, mut attempt: S) -> Retry<S, F>
    where
        S: FnMut() -> F,
        F: TryFuture,
    {
        let first = attempt();
        Retry {
            backoff: self,
            attempt,
            state: RetryState::Attempting(first),
        }
    }
}

#[pin_project(project = RetryStateProj)]
enum RetryState<F> {
    Attempting(#[pin] F),
    Sleeping(#[pin] Sleep),
}

#[pin_project]
pub struct Retry<S, F> {
    backoff: Backoff,
    attempt: S,
    #[pin]
    state: RetryState<F>,
}

impl<S, F> Future for Retry<S, F>
where
    S: FnMut() -> F,
    F: TryFuture,
    F::Error: Display,
{
    type Output = Result<F::Ok, F::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            let next = match this.state.as_mut().project() {
                RetryStateProj::Attempting(f) => match ready!(f.try_poll(cx)) {
                    Ok(v) => return Poll::Ready(Ok(v)),
                    Err(e) => match this.backoff.next_delay() {
                        Some(delay) => {
                            debug!("Attempt failed ({}), retrying in {:?}", e, delay);
                            RetryState::Sleeping(sleep(delay))
                        }
                        None => return Poll::Ready(Err(e)),
                    },
                },
                RetryStateProj::Sleeping(s) => {
                    ready!(s.poll(cx));
                    RetryState::Attempting((this.attempt)())
                }
            };
            this.state.set(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let res = Backoff::unlimited()
            .initial_delay(Duration::from_millis(1))
            .retry(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(format!("attempt {}", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(Ok(3), res);
        assert_eq!(4, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn gives_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let res: Result<(), String> = Backoff::attempts(2)
            .initial_delay(Duration::from_millis(1))
            .without_jitter()
            .retry(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("refused".to_string()) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(2, calls.load(Ordering::SeqCst));
    }
}
