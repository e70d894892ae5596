use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{trace, warn};

use crate::runtime::{CallbackHandle, QuicEventBase, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LooperType {
    ReadLooper,
    PeekLooper,
    WriteLooper,
}

impl fmt::Display for LooperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LooperType::ReadLooper => "ReadLooper",
            LooperType::PeekLooper => "PeekLooper",
            LooperType::WriteLooper => "WriteLooper",
        };
        write!(f, "{name}")
    }
}

type LoopFunction = Box<dyn FnMut()>;
type PacingFunction = Box<dyn FnMut() -> Duration>;

struct LooperInner {
    looper_type: LooperType,
    evb: RefCell<Option<Rc<QuicEventBase>>>,
    func: RefCell<LoopFunction>,
    pacing_func: RefCell<Option<PacingFunction>>,
    pacing_timer: RefCell<Option<Rc<QuicEventBase>>>,
    running: Cell<bool>,
    in_loop_body: Cell<bool>,
    loop_callback: Cell<Option<CallbackHandle>>,
    pacing_timeout: Cell<Option<TimerHandle>>,
}

impl LooperInner {
    fn is_loop_callback_scheduled(&self) -> bool {
        match (self.loop_callback.get(), self.evb.borrow().as_ref()) {
            (Some(handle), Some(evb)) => evb.is_loop_callback_scheduled(handle),
            _ => false,
        }
    }

    fn is_pacing_scheduled(&self) -> bool {
        match (self.pacing_timeout.get(), self.pacing_timer.borrow().as_ref()) {
            (Some(handle), Some(timer)) => timer.is_timeout_scheduled(handle),
            _ => false,
        }
    }

    fn schedule_loop_callback(self: &Rc<Self>, this_iteration: bool) {
        if self.is_loop_callback_scheduled() {
            return;
        }
        let evb = self.evb.borrow().clone();
        let Some(evb) = evb else {
            warn!("{} has no event base to run on", self.looper_type);
            return;
        };
        let weak = Rc::downgrade(self);
        let handle = evb.run_in_loop(
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.loop_callback.set(None);
                    inner.common_loop_body();
                }
            }),
            this_iteration,
        );
        self.loop_callback.set(Some(handle));
    }

    /// Returns true when the next run got deferred to the pacing timer
    fn schedule_pacing_timeout(self: &Rc<Self>) -> bool {
        let timer = self.pacing_timer.borrow().clone();
        let Some(timer) = timer else {
            return false;
        };
        if self.is_pacing_scheduled() {
            return false;
        }
        let time_until_write = match self.pacing_func.borrow_mut().as_mut() {
            Some(pacing_func) => pacing_func(),
            None => return false,
        };
        if time_until_write.is_zero() {
            return false;
        }

        let weak = Rc::downgrade(self);
        let handle = timer.schedule_timeout(
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.pacing_timeout.set(None);
                    inner.common_loop_body();
                }
            }),
            time_until_write,
        );
        trace!("{} paced for {:?}", self.looper_type, time_until_write);
        self.pacing_timeout.set(Some(handle));
        true
    }

    fn common_loop_body(self: &Rc<Self>) {
        self.in_loop_body.set(true);
        (*self.func.borrow_mut())();
        self.in_loop_body.set(false);

        // The function may have stopped us
        if !self.running.get() {
            return;
        }
        if !self.schedule_pacing_timeout() {
            self.schedule_loop_callback(false);
        }
    }

    fn run(self: &Rc<Self>, this_iteration: bool) {
        self.running.set(true);
        // With pacing the loop body decides when the next run happens
        if self.pacing_timer.borrow().is_some() && self.in_loop_body.get() {
            return;
        }
        if self.is_loop_callback_scheduled() || self.is_pacing_scheduled() {
            return;
        }
        self.schedule_loop_callback(this_iteration);
    }

    fn stop(&self) {
        self.running.set(false);
        if let Some(handle) = self.loop_callback.take() {
            if let Some(evb) = self.evb.borrow().as_ref() {
                evb.cancel_loop_callback(handle);
            }
        }
        if let Some(handle) = self.pacing_timeout.take() {
            if let Some(timer) = self.pacing_timer.borrow().as_ref() {
                timer.cancel_timeout(handle);
            }
        }
    }
}

/// Runs a function on every event loop pass until stopped. With a pacing
/// function and timer the passes are spaced out by whatever delay the
/// pacing function asks for.
///
/// Stops when dropped.
pub struct FunctionLooper {
    inner: Rc<LooperInner>,
}

impl FunctionLooper {
    pub fn new(
        evb: Option<Rc<QuicEventBase>>,
        func: Box<dyn FnMut()>,
        looper_type: LooperType,
    ) -> Self {
        Self {
            inner: Rc::new(LooperInner {
                looper_type,
                evb: RefCell::new(evb),
                func: RefCell::new(func),
                pacing_func: RefCell::new(None),
                pacing_timer: RefCell::new(None),
                running: Cell::new(false),
                in_loop_body: Cell::new(false),
                loop_callback: Cell::new(None),
                pacing_timeout: Cell::new(None),
            }),
        }
    }

    pub fn looper_type(&self) -> LooperType {
        self.inner.looper_type
    }

    /// Schedules the function, in the ongoing loop pass when
    /// `this_iteration` is set. Calling it again while scheduled is a no-op.
    pub fn run(&self, this_iteration: bool) {
        self.inner.run(this_iteration);
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// A handle the looped function can use to stop or rerun its own looper
    pub fn handle(&self) -> LooperHandle {
        LooperHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn set_pacing_function(&self, pacing_func: Box<dyn FnMut() -> Duration>) {
        *self.inner.pacing_func.borrow_mut() = Some(pacing_func);
    }

    pub fn set_pacing_timer(&self, pacing_timer: Rc<QuicEventBase>) {
        *self.inner.pacing_timer.borrow_mut() = Some(pacing_timer);
    }

    pub fn has_pacing_timer(&self) -> bool {
        self.inner.pacing_timer.borrow().is_some()
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.is_pacing_scheduled()
    }

    pub fn is_loop_callback_scheduled(&self) -> bool {
        self.inner.is_loop_callback_scheduled()
    }

    pub fn attach_event_base(&self, evb: Rc<QuicEventBase>) {
        let mut attached = self.inner.evb.borrow_mut();
        assert!(
            attached.is_none(),
            "{} is already attached to an event base",
            self.inner.looper_type
        );
        *attached = Some(evb);
    }

    pub fn detach_event_base(&self) {
        self.stop();
        self.inner.evb.borrow_mut().take();
    }

    pub fn timer_tick_interval(&self) -> Option<Duration> {
        self.inner
            .pacing_timer
            .borrow()
            .as_ref()
            .map(|timer| timer.timer_tick_interval())
    }
}

impl Drop for FunctionLooper {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl fmt::Debug for FunctionLooper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionLooper")
            .field("type", &self.inner.looper_type)
            .field("running", &self.inner.running.get())
            .finish()
    }
}

/// Weak reference to a looper, does nothing once the looper is gone
#[derive(Clone)]
pub struct LooperHandle {
    inner: Weak<LooperInner>,
}

impl LooperHandle {
    pub fn run(&self, this_iteration: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.run(this_iteration);
        }
    }

    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| inner.running.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn counting_looper(evb: &Rc<QuicEventBase>) -> (FunctionLooper, Rc<Cell<u32>>) {
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        let looper = FunctionLooper::new(
            Some(evb.clone()),
            Box::new(move || c.set(c.get() + 1)),
            LooperType::WriteLooper,
        );
        (looper, counter)
    }

    #[test]
    fn test_runs_every_pass_until_stopped() -> Result<()> {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1))?);
        let (looper, counter) = counting_looper(&evb);
        assert!(!looper.is_running());

        looper.run(false);
        looper.run(false);
        assert!(looper.is_running());
        assert!(looper.is_loop_callback_scheduled());
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 1);
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 2);

        looper.stop();
        assert!(!looper.is_loop_callback_scheduled());
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 2);
        Ok(())
    }

    #[test]
    fn test_function_stops_its_own_looper() -> Result<()> {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1))?);
        let handle_slot: Rc<RefCell<Option<LooperHandle>>> = Rc::new(RefCell::new(None));
        let counter = Rc::new(Cell::new(0));
        let (slot, c) = (handle_slot.clone(), counter.clone());
        let looper = FunctionLooper::new(
            Some(evb.clone()),
            Box::new(move || {
                c.set(c.get() + 1);
                if let Some(handle) = slot.borrow().as_ref() {
                    handle.stop();
                }
            }),
            LooperType::ReadLooper,
        );
        *handle_slot.borrow_mut() = Some(looper.handle());

        looper.run(false);
        evb.loop_once(Some(Duration::ZERO))?;
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 1);
        assert!(!looper.is_running());
        assert!(!looper.is_loop_callback_scheduled());
        Ok(())
    }

    #[test]
    fn test_pacing_defers_next_run() -> Result<()> {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1))?);
        let (looper, counter) = counting_looper(&evb);
        looper.set_pacing_timer(evb.clone());
        looper.set_pacing_function(Box::new(|| Duration::from_millis(5)));
        assert_eq!(looper.timer_tick_interval(), Some(Duration::from_millis(1)));

        looper.run(false);
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 1);
        assert!(looper.is_scheduled());
        assert!(!looper.is_loop_callback_scheduled());

        // Already waiting on the pacing timer
        looper.run(false);
        assert!(!looper.is_loop_callback_scheduled());

        while counter.get() < 2 {
            evb.loop_once(Some(Duration::from_millis(50)))?;
        }
        assert!(looper.is_scheduled());
        looper.stop();
        assert!(!looper.is_scheduled());
        Ok(())
    }

    #[test]
    fn test_zero_pacing_delay_runs_next_pass() -> Result<()> {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1))?);
        let (looper, counter) = counting_looper(&evb);
        looper.set_pacing_timer(evb.clone());
        looper.set_pacing_function(Box::new(|| Duration::ZERO));

        looper.run(false);
        evb.loop_once(Some(Duration::ZERO))?;
        assert!(!looper.is_scheduled());
        assert!(looper.is_loop_callback_scheduled());
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 2);
        Ok(())
    }

    #[test]
    fn test_detach_stops() -> Result<()> {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1))?);
        let (looper, counter) = counting_looper(&evb);
        looper.run(false);
        looper.detach_event_base();
        assert!(!looper.is_running());
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 0);

        // Nothing to run on until attached again
        looper.run(false);
        assert!(!looper.is_loop_callback_scheduled());
        looper.attach_event_base(evb.clone());
        looper.run(false);
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 1);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn test_double_attach_panics() {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1)).unwrap());
        let (looper, _) = counting_looper(&evb);
        looper.attach_event_base(evb.clone());
    }

    #[test]
    fn test_drop_cancels_callback() -> Result<()> {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1))?);
        let (looper, counter) = counting_looper(&evb);
        looper.run(false);
        drop(looper);
        evb.loop_once(Some(Duration::ZERO))?;
        assert_eq!(counter.get(), 0);
        Ok(())
    }

    #[test]
    fn test_looper_type_display() {
        assert_eq!(LooperType::ReadLooper.to_string(), "ReadLooper");
        assert_eq!(LooperType::PeekLooper.to_string(), "PeekLooper");
        assert_eq!(LooperType::WriteLooper.to_string(), "WriteLooper");
    }
}
