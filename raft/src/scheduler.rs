use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Source of the node's election and heartbeat timers, and of the clock
/// that leader leases and client deadlines are measured on.
pub trait Scheduler: Send + Sync {
    /// Returns a handle that completes once `delay` has elapsed.
    fn schedule(&self, delay: Duration) -> TimerHandle;

    fn now(&self) -> Instant;
}

/// A pending timer. Awaiting it waits for the timer to fire; a cancelled
/// handle never fires. Dropping the handle also cancels it.
pub struct TimerHandle {
    fire: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl TimerHandle {
    pub fn new(fire: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            fire: Some(Box::pin(fire)),
        }
    }

    /// A handle that never fires.
    pub fn idle() -> Self {
        Self { fire: None }
    }

    pub fn cancel(&mut self) {
        self.fire = None;
    }

    pub fn is_active(&self) -> bool {
        self.fire.is_some()
    }
}

impl Future for TimerHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(fire) = self.fire.as_mut() else {
            return Poll::Pending;
        };
        match fire.as_mut().poll(cx) {
            Poll::Ready(()) => {
                // Fire once.
                self.fire = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Timers on the tokio clock. Under `tokio::time::pause` this is virtual
/// time as well.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration) -> TimerHandle {
        TimerHandle::new(tokio::time::sleep(delay))
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A virtual clock that only moves when [`ManualScheduler::advance`] is
/// called. Timers fire once the clock reaches their deadline.
#[derive(Clone, Debug)]
pub struct ManualScheduler {
    start: Instant,
    now: Arc<watch::Sender<Duration>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        let (now, _) = watch::channel(Duration::ZERO);
        Self {
            start: Instant::now(),
            now: Arc::new(now),
        }
    }

    /// Virtual time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.now.borrow()
    }

    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration) -> TimerHandle {
        let deadline = self.elapsed() + delay;
        let mut rx = self.now.subscribe();
        TimerHandle::new(async move {
            let fired = rx.wait_for(|now| *now >= deadline).await.is_ok();
            if !fired {
                // The clock is gone; time stands still.
                std::future::pending::<()>().await;
            }
        })
    }

    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }
}
