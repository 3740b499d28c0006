//! Time source for the stop deadline and the group monitor's polling loop.
//!
//! Production code runs on [`RealClock`] (tokio timers). Tests drive a [`FakeClock`]: time only
//! moves when [`FakeClock::advance`] is called, and [`FakeClock::block_until`] lets a test wait
//! until the code under test has armed the timers it is expected to arm.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    /// A one-shot timer completing `duration` from now.
    fn sleep(&self, duration: Duration) -> Sleep;

    /// A repeating timer. The first tick completes one `period` from now.
    ///
    /// Panics if `period` is zero.
    fn ticker(&self, period: Duration) -> Ticker;
}

pub type SharedClock = Arc<dyn Clock>;

/// Stand-in deadline for periods too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            inner: SleepInner::Real(Box::pin(tokio::time::sleep(duration))),
        }
    }

    fn ticker(&self, period: Duration) -> Ticker {
        assert!(!period.is_zero(), "ticker period must be non-zero");
        let now = tokio::time::Instant::now();
        let first = now
            .checked_add(period)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut interval = tokio::time::interval_at(first, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ticker {
            inner: TickerInner::Real(interval),
        }
    }
}

/// Future returned by [`Clock::sleep`].
#[derive(Debug)]
pub struct Sleep {
    inner: SleepInner,
}

#[derive(Debug)]
enum SleepInner {
    Real(Pin<Box<tokio::time::Sleep>>),
    Fake {
        rx: oneshot::Receiver<()>,
        _registration: Registration,
    },
    Elapsed,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.inner {
            SleepInner::Real(s) => s.as_mut().poll(cx),
            // A dropped sender can only mean the sleeper was fired; never leave the caller hanging.
            SleepInner::Fake { rx, .. } => Pin::new(rx).poll(cx).map(|_| ()),
            SleepInner::Elapsed => Poll::Ready(()),
        }
    }
}

/// Repeating timer returned by [`Clock::ticker`].
#[derive(Debug)]
pub struct Ticker {
    inner: TickerInner,
}

#[derive(Debug)]
enum TickerInner {
    Real(tokio::time::Interval),
    Fake {
        rx: mpsc::Receiver<()>,
        _registration: Registration,
    },
}

impl Ticker {
    pub async fn tick(&mut self) {
        std::future::poll_fn(|cx| self.poll_tick(cx)).await
    }

    pub fn poll_tick(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.inner {
            TickerInner::Real(interval) => interval.poll_tick(cx).map(|_| ()),
            TickerInner::Fake { rx, .. } => match rx.poll_recv(cx) {
                Poll::Ready(Some(())) => Poll::Ready(()),
                // Sender lives in the clock as long as the registration does.
                Poll::Ready(None) | Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Simulated time. Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct FakeClock {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Debug)]
struct FakeState {
    base: Instant,
    elapsed: Duration,
    next_id: u64,
    sleepers: Vec<Sleeper>,
    blockers: Vec<Blocker>,
}

#[derive(Debug)]
struct Sleeper {
    id: u64,
    wake_at: Duration,
    kind: SleeperKind,
}

#[derive(Debug)]
enum SleeperKind {
    Once(oneshot::Sender<()>),
    /// Ticks are dropped, not queued, when the receiver lags behind (capacity 1).
    Every {
        period: Duration,
        tx: mpsc::Sender<()>,
    },
}

#[derive(Debug)]
struct Blocker {
    count: usize,
    tx: oneshot::Sender<()>,
}

impl FakeState {
    fn register(&mut self, wake_at: Duration, kind: SleeperKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.sleepers.push(Sleeper { id, wake_at, kind });
        self.release_blockers();
        id
    }

    /// Earliest sleeper due at or before `target`; creation order breaks ties.
    fn next_due(&self, target: Duration) -> Option<usize> {
        self.sleepers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.wake_at <= target)
            .min_by_key(|(_, s)| (s.wake_at, s.id))
            .map(|(idx, _)| idx)
    }

    fn fire(&mut self, idx: usize) {
        self.elapsed = self.elapsed.max(self.sleepers[idx].wake_at);
        if matches!(self.sleepers[idx].kind, SleeperKind::Once(_)) {
            let sleeper = self.sleepers.remove(idx);
            if let SleeperKind::Once(tx) = sleeper.kind {
                let _ = tx.send(());
            }
            return;
        }
        let sleeper = &mut self.sleepers[idx];
        if let SleeperKind::Every { period, tx } = &sleeper.kind {
            let period = *period;
            let _ = tx.try_send(());
            sleeper.wake_at += period;
        }
    }

    fn release_blockers(&mut self) {
        let outstanding = self.sleepers.len();
        let (ready, waiting): (Vec<Blocker>, Vec<Blocker>) = mem::take(&mut self.blockers)
            .into_iter()
            .partition(|b| b.count == outstanding);
        self.blockers = waiting;
        for b in ready {
            let _ = b.tx.send(());
        }
    }
}

/// Removes its sleeper from the clock when the owning `Sleep`/`Ticker` is dropped.
#[derive(Debug)]
struct Registration {
    state: Arc<Mutex<FakeState>>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let before = st.sleepers.len();
        st.sleepers.retain(|s| s.id != self.id);
        if st.sleepers.len() != before {
            st.release_blockers();
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(base: Instant) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                base,
                elapsed: Duration::ZERO,
                next_id: 0,
                sleepers: Vec::new(),
                blockers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Simulated time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Number of armed sleepers and tickers.
    pub fn sleepers(&self) -> usize {
        self.lock().sleepers.len()
    }

    /// Move time forward by `duration`, firing every timer that comes due on the way in
    /// wake-time order. A ticker fires once for every period that elapses.
    pub fn advance(&self, duration: Duration) {
        let mut st = self.lock();
        let target = st.elapsed + duration;
        while let Some(idx) = st.next_due(target) {
            st.fire(idx);
        }
        st.elapsed = target;
        st.release_blockers();
    }

    /// Wait until exactly `count` sleepers are armed.
    pub async fn block_until(&self, count: usize) {
        let rx = {
            let mut st = self.lock();
            if st.sleepers.len() == count {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.blockers.push(Blocker { count, tx });
            rx
        };
        let _ = rx.await;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let st = self.lock();
        st.base + st.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        if duration.is_zero() {
            return Sleep {
                inner: SleepInner::Elapsed,
            };
        }
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut st = self.lock();
            let wake_at = st.elapsed + duration;
            st.register(wake_at, SleeperKind::Once(tx))
        };
        Sleep {
            inner: SleepInner::Fake {
                rx,
                _registration: Registration {
                    state: Arc::clone(&self.state),
                    id,
                },
            },
        }
    }

    fn ticker(&self, period: Duration) -> Ticker {
        assert!(!period.is_zero(), "ticker period must be non-zero");
        let (tx, rx) = mpsc::channel(1);
        let id = {
            let mut st = self.lock();
            let wake_at = st.elapsed + period;
            st.register(wake_at, SleeperKind::Every { period, tx })
        };
        Ticker {
            inner: TickerInner::Fake {
                rx,
                _registration: Registration {
                    state: Arc::clone(&self.state),
                    id,
                },
            },
        }
    }
}
