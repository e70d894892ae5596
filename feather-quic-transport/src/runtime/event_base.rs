use anyhow::{anyhow, Result};
use mio::{Events, Poll, Registry};
#[cfg(target_os = "linux")]
use mio::{Interest, Token};
#[cfg(target_os = "linux")]
use mio_timerfd::{ClockId, TimerFd};
use slab::Slab;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

#[cfg(target_os = "linux")]
const QUIC_TIMER_TOKEN: Token = Token(usize::MAX - 1);

type Callback = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle {
    key: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    key: usize,
    generation: u64,
}

struct LoopCallback {
    generation: u64,
    callback: Callback,
}

struct ScheduledTimer {
    generation: u64,
    deadline: Instant,
    callback: Callback,
}

#[derive(Default)]
struct EventBaseInner {
    generation: u64,
    callbacks: Slab<LoopCallback>,
    // Run during the current pass of `loop_once`
    current_queue: VecDeque<CallbackHandle>,
    next_queue: VecDeque<CallbackHandle>,
    running_callbacks: bool,
    timers: Slab<ScheduledTimer>,
}

impl EventBaseInner {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|(_, t)| t.deadline).min()
    }

    fn take_callback(&mut self, handle: CallbackHandle) -> Option<Callback> {
        match self.callbacks.get(handle.key) {
            Some(cb) if cb.generation == handle.generation => {
                Some(self.callbacks.remove(handle.key).callback)
            }
            // Cancelled, the slot may have been reused
            _ => None,
        }
    }

    fn take_expired_timer(&mut self, now: Instant) -> Option<Callback> {
        let key = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .min_by_key(|(_, t)| t.deadline)
            .map(|(key, _)| key)?;
        Some(self.timers.remove(key).callback)
    }
}

/// Single threaded event loop: loop callbacks, one shot timers and a mio
/// poll for whatever sockets get registered on its registry.
///
/// Callbacks are always invoked with no internal borrow held, so they may
/// schedule or cancel anything on the same event base.
pub struct QuicEventBase {
    inner: RefCell<EventBaseInner>,
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    #[cfg(target_os = "linux")]
    timer: RefCell<TimerFd>,
    timer_tick_interval: Duration,
}

impl QuicEventBase {
    pub fn new(timer_tick_interval: Duration) -> Result<Self> {
        let poll = Poll::new().map_err(|e| anyhow!("Failed to create poll due to {e}"))?;

        #[cfg(target_os = "linux")]
        let timer = {
            let mut timer = TimerFd::new(ClockId::Monotonic)?;
            poll.registry()
                .register(&mut timer, QUIC_TIMER_TOKEN, Interest::READABLE)?;
            timer
        };

        Ok(Self {
            inner: RefCell::new(EventBaseInner::default()),
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(64)),
            #[cfg(target_os = "linux")]
            timer: RefCell::new(timer),
            timer_tick_interval,
        })
    }

    pub fn try_clone_registry(&self) -> Result<Registry> {
        self.poll
            .borrow()
            .registry()
            .try_clone()
            .map_err(|e| anyhow!("Failed to clone registry due to {e}"))
    }

    pub fn timer_tick_interval(&self) -> Duration {
        self.timer_tick_interval
    }

    /// Queues `callback` for the next loop pass. With `this_iteration` set
    /// and callbacks currently running, it runs in the ongoing pass instead.
    pub fn run_in_loop(&self, callback: Box<dyn FnOnce()>, this_iteration: bool) -> CallbackHandle {
        let mut inner = self.inner.borrow_mut();
        let generation = inner.next_generation();
        let key = inner.callbacks.insert(LoopCallback {
            generation,
            callback,
        });
        let handle = CallbackHandle { key, generation };
        if this_iteration && inner.running_callbacks {
            inner.current_queue.push_back(handle);
        } else {
            inner.next_queue.push_back(handle);
        }
        handle
    }

    pub fn cancel_loop_callback(&self, handle: CallbackHandle) {
        // The queues skip handles whose slot no longer matches
        let callback = self.inner.borrow_mut().take_callback(handle);
        drop(callback);
    }

    pub fn is_loop_callback_scheduled(&self, handle: CallbackHandle) -> bool {
        self.inner
            .borrow()
            .callbacks
            .get(handle.key)
            .is_some_and(|cb| cb.generation == handle.generation)
    }

    pub fn schedule_timeout(&self, callback: Box<dyn FnOnce()>, timeout: Duration) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();
        let generation = inner.next_generation();
        let key = inner.timers.insert(ScheduledTimer {
            generation,
            deadline: Instant::now() + timeout,
            callback,
        });
        trace!("Scheduled timer {} in {:?}", key, timeout);
        TimerHandle { key, generation }
    }

    pub fn cancel_timeout(&self, handle: TimerHandle) {
        let timer = {
            let mut inner = self.inner.borrow_mut();
            let scheduled = inner
                .timers
                .get(handle.key)
                .is_some_and(|t| t.generation == handle.generation);
            scheduled.then(|| inner.timers.remove(handle.key))
        };
        drop(timer);
    }

    pub fn is_timeout_scheduled(&self, handle: TimerHandle) -> bool {
        self.inner
            .borrow()
            .timers
            .get(handle.key)
            .is_some_and(|t| t.generation == handle.generation)
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        let inner = self.inner.borrow();
        if !inner.next_queue.is_empty() {
            return Some(Duration::ZERO);
        }
        let until_timer = inner
            .earliest_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (until_timer, max_wait) {
            (Some(t), Some(w)) => Some(t.min(w)),
            (t, w) => t.or(w),
        }
    }

    /// Waits for io or the earliest timer (bounded by `max_wait`), then fires
    /// expired timers and runs one pass of loop callbacks.
    /// Returns how many callbacks and timers ran.
    pub fn loop_once(&self, max_wait: Option<Duration>) -> Result<usize> {
        let timeout = self.poll_timeout(max_wait);

        #[cfg(target_os = "linux")]
        let timeout = match timeout {
            // The timerfd keeps the sub millisecond precision epoll does not have
            Some(t) if !t.is_zero() => {
                self.timer.borrow_mut().set_timeout(&t)?;
                None
            }
            t => t,
        };

        {
            let mut events = self.events.borrow_mut();
            if let Err(e) = self.poll.borrow_mut().poll(&mut events, timeout) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    return Err(anyhow!("Failed to poll events due to {e}"));
                }
            }
            #[cfg(target_os = "linux")]
            for event in events.iter() {
                if event.token() == QUIC_TIMER_TOKEN {
                    if let Err(e) = self.timer.borrow_mut().read() {
                        warn!("Failed to read timerfd: {}", e);
                    }
                }
            }
        }

        let mut ran = 0;
        let now = Instant::now();
        loop {
            let expired = self.inner.borrow_mut().take_expired_timer(now);
            match expired {
                Some(callback) => {
                    callback();
                    ran += 1;
                }
                None => break,
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            let next = std::mem::take(&mut inner.next_queue);
            inner.current_queue.extend(next);
            inner.running_callbacks = true;
        }
        loop {
            let callback = {
                let mut inner = self.inner.borrow_mut();
                match inner.current_queue.pop_front() {
                    Some(handle) => inner.take_callback(handle),
                    None => break,
                }
            };
            if let Some(callback) = callback {
                callback();
                ran += 1;
            }
        }
        self.inner.borrow_mut().running_callbacks = false;

        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_loop_callbacks_run_once() -> Result<()> {
        let evb = QuicEventBase::new(Duration::from_millis(1))?;
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        let handle = evb.run_in_loop(Box::new(move || c.set(c.get() + 1)), false);
        assert!(evb.is_loop_callback_scheduled(handle));

        assert_eq!(evb.loop_once(Some(Duration::ZERO))?, 1);
        assert_eq!(counter.get(), 1);
        assert!(!evb.is_loop_callback_scheduled(handle));
        assert_eq!(evb.loop_once(Some(Duration::ZERO))?, 0);
        Ok(())
    }

    #[test]
    fn test_this_iteration_callback() -> Result<()> {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1))?);
        let order = Rc::new(RefCell::new(vec![]));

        let (e, o) = (evb.clone(), order.clone());
        evb.run_in_loop(
            Box::new(move || {
                o.borrow_mut().push("first");
                let o1 = o.clone();
                e.run_in_loop(Box::new(move || o1.borrow_mut().push("same pass")), true);
                let o2 = o.clone();
                e.run_in_loop(Box::new(move || o2.borrow_mut().push("next pass")), false);
            }),
            false,
        );

        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(*order.borrow(), vec!["first", "same pass"]);
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(*order.borrow(), vec!["first", "same pass", "next pass"]);
        Ok(())
    }

    #[test]
    fn test_cancelled_callback_does_not_run() -> Result<()> {
        let evb = QuicEventBase::new(Duration::from_millis(1))?;
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let handle = evb.run_in_loop(Box::new(move || f.set(true)), false);
        evb.cancel_loop_callback(handle);
        assert!(!evb.is_loop_callback_scheduled(handle));

        evb.loop_once(Some(Duration::ZERO))?;
        assert!(!fired.get());
        Ok(())
    }

    #[test]
    fn test_timer_fires_after_deadline() -> Result<()> {
        let evb = QuicEventBase::new(Duration::from_millis(1))?;
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let handle = evb.schedule_timeout(Box::new(move || f.set(true)), Duration::from_millis(5));
        assert!(evb.is_timeout_scheduled(handle));

        let start = Instant::now();
        while !fired.get() && start.elapsed() < Duration::from_secs(2) {
            evb.loop_once(Some(Duration::from_millis(20)))?;
        }
        assert!(fired.get());
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert!(!evb.is_timeout_scheduled(handle));

        let cancelled =
            evb.schedule_timeout(Box::new(|| panic!("cancelled timer fired")), Duration::ZERO);
        evb.cancel_timeout(cancelled);
        evb.loop_once(Some(Duration::ZERO))?;
        Ok(())
    }
}
