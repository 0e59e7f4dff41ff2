//! Busy-polling worker threads.
//!
//! Each worker owns one OS thread and a [`WorkerControl`] whose signal is both
//! its state and its mailbox:
//!
//! ```text
//! Pause --prepare--> Ready --launcher--> Continue <--> Pause
//!                                           |
//!                  SelfReturn / cancel -----+--> Exited
//!                  fault (HaltDivision) ------> Faulted
//! ```
//!
//! Transitions are compare-and-swap on one atomic byte. Waiting is a polling
//! loop over [`Backoff`], never a lock.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::FaultPolicy;
use crate::error::{ReplicationError, Result};

/// Spin rounds (doubling) before a waiter starts yielding its time slice.
const SPIN_LIMIT: u32 = 6;

/// Exponential spin with a yield fallback. Spins up to `2^SPIN_LIMIT`
/// iterations per round, then yields to the scheduler on every call.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }

    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }

    #[inline]
    pub fn is_yielding(&self) -> bool {
        self.step > SPIN_LIMIT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerSignal {
    /// Launched, or paused by the launcher.
    Pause = 0,
    /// Startup done; waiting for the launcher.
    Ready = 1,
    /// Processing.
    Continue = 2,
    /// Asked to return at the next poll.
    SelfReturn = 3,
    /// Stopped after a transport fault.
    Faulted = 4,
    /// Thread has left its loop.
    Exited = 5,
}

impl WorkerSignal {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Pause),
            1 => Some(Self::Ready),
            2 => Some(Self::Continue),
            3 => Some(Self::SelfReturn),
            4 => Some(Self::Faulted),
            5 => Some(Self::Exited),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerSignal::Faulted | WorkerSignal::Exited)
    }
}

/// Cooperative cancellation flag shared between a worker and its launcher.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Signal register plus cancellation for one worker.
#[derive(Debug)]
pub struct WorkerControl {
    name: String,
    signal: AtomicU8,
    cancel: CancelToken,
    fault_policy: FaultPolicy,
}

impl WorkerControl {
    pub fn new(name: impl Into<String>, fault_policy: FaultPolicy) -> Self {
        Self {
            name: name.into(),
            signal: AtomicU8::new(WorkerSignal::Pause as u8),
            cancel: CancelToken::new(),
            fault_policy,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn signal(&self) -> WorkerSignal {
        WorkerSignal::from_u8(self.signal.load(Ordering::Acquire)).unwrap_or(WorkerSignal::Exited)
    }

    /// CAS `from -> to`. Returns false if the signal was not `from`.
    #[inline]
    pub fn transition(&self, from: WorkerSignal, to: WorkerSignal) -> bool {
        self.signal
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional store, except that terminal states stick.
    pub fn set(&self, to: WorkerSignal) {
        let mut current = self.signal.load(Ordering::Acquire);
        loop {
            match WorkerSignal::from_u8(current) {
                Some(s) if s.is_terminal() => return,
                _ => {}
            }
            match self.signal.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// True when the worker should abandon what it is doing.
    #[inline(always)]
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
            || matches!(
                self.signal(),
                WorkerSignal::SelfReturn | WorkerSignal::Faulted | WorkerSignal::Exited
            )
    }

    /// Poll until `pred` holds for the signal or the worker is cancelled.
    pub fn wait_for(&self, pred: impl Fn(WorkerSignal) -> bool) -> WorkerSignal {
        let mut backoff = Backoff::new();
        loop {
            let signal = self.signal();
            if pred(signal) || self.cancel.is_cancelled() {
                return signal;
            }
            backoff.snooze();
        }
    }

    /// Apply the fault policy to a fatal error raised by this worker.
    pub fn fault(&self, error: &ReplicationError) {
        tracing::error!(worker = %self.name, error = %error, "fatal transport fault");
        match self.fault_policy {
            FaultPolicy::Abort => std::process::abort(),
            FaultPolicy::HaltDivision => {
                self.signal.store(WorkerSignal::Faulted as u8, Ordering::Release);
            }
        }
    }
}

/// Work driven by a worker thread.
pub trait Worker: Send + 'static {
    fn name(&self) -> String;

    /// Startup before the worker reports `Ready`.
    fn prepare(&mut self, control: &WorkerControl) -> Result<()>;

    /// One pass of work. Returns whether anything was processed.
    fn poll(&mut self, control: &WorkerControl) -> Result<bool>;
}

fn run_worker<W: Worker>(mut worker: W, control: Arc<WorkerControl>, auto_continue: bool) {
    if let Err(e) = worker.prepare(&control) {
        control.fault(&e);
        return;
    }
    if !control.transition(WorkerSignal::Pause, WorkerSignal::Ready) {
        control.set(WorkerSignal::Exited);
        return;
    }
    tracing::info!(worker = control.name(), "worker ready");

    if auto_continue {
        control.transition(WorkerSignal::Ready, WorkerSignal::Continue);
    }

    let mut backoff = Backoff::new();
    loop {
        if control.should_stop() {
            break;
        }
        match control.signal() {
            WorkerSignal::Continue => {}
            _ => {
                backoff.snooze();
                continue;
            }
        }
        match worker.poll(&control) {
            Ok(true) => backoff.reset(),
            Ok(false) => backoff.snooze(),
            Err(e) => {
                control.fault(&e);
                return;
            }
        }
    }

    control.set(WorkerSignal::Exited);
    tracing::info!(worker = control.name(), "worker exited");
}

/// A launched worker.
pub struct WorkerHandle {
    control: Arc<WorkerControl>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    #[inline]
    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Graceful stop: signal `SelfReturn` and join.
    pub fn terminate(mut self) {
        self.control.set(WorkerSignal::SelfReturn);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker = self.control.name(), "worker panicked");
            }
        }
    }

    /// Cancel and detach without joining. In-flight work (a posted write,
    /// a half-staged batch) is abandoned where it stands.
    pub fn force_kill(mut self) {
        self.control.cancel_token().cancel();
        self.thread.take();
        tracing::warn!(worker = self.control.name(), "worker force-killed");
    }
}

/// Identifies a worker inside a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

/// Fixed-capacity set of worker handles.
pub struct WorkerPool {
    slots: Vec<Option<WorkerHandle>>,
    fault_policy: FaultPolicy,
}

impl WorkerPool {
    pub fn new(capacity: usize, fault_policy: FaultPolicy) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            fault_policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Spin until a handle is free, reclaiming workers that already exited.
    fn claim_slot(&mut self) -> usize {
        let mut backoff = Backoff::new();
        loop {
            for (i, slot) in self.slots.iter_mut().enumerate() {
                let free = slot.as_ref().map_or(true, WorkerHandle::is_finished);
                if free {
                    if let Some(done) = slot.take() {
                        done.terminate();
                    }
                    return i;
                }
            }
            backoff.snooze();
        }
    }

    fn spawn<W: Worker>(&mut self, worker: W, auto_continue: bool) -> Result<WorkerId> {
        let index = self.claim_slot();
        let name = worker.name();
        let control = Arc::new(WorkerControl::new(name.clone(), self.fault_policy));
        let thread_control = Arc::clone(&control);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(worker, thread_control, auto_continue))?;
        self.slots[index] = Some(WorkerHandle {
            control,
            thread: Some(thread),
        });
        Ok(WorkerId(index))
    }

    /// Spawn, wait for `Ready`, then send `Continue`.
    pub fn launch<W: Worker>(&mut self, worker: W) -> Result<WorkerId> {
        let id = self.spawn(worker, false)?;
        let control = self.control(id).ok_or(ReplicationError::Stopped)?;
        let signal = control.wait_for(|s| s == WorkerSignal::Ready || s.is_terminal());
        if signal != WorkerSignal::Ready {
            return Err(ReplicationError::WorkerFaulted {
                name: control.name().to_string(),
            });
        }
        control.transition(WorkerSignal::Ready, WorkerSignal::Continue);
        Ok(id)
    }

    /// Spawn and return at once; the worker continues on its own after
    /// startup. Use [`WorkerPool::wait_running`] to block on it.
    pub fn launch_detached<W: Worker>(&mut self, worker: W) -> Result<WorkerId> {
        self.spawn(worker, true)
    }

    /// Block until the worker is past startup.
    pub fn wait_running(&self, id: WorkerId) -> Result<()> {
        let control = self.control(id).ok_or(ReplicationError::Stopped)?;
        let signal = control.wait_for(|s| !matches!(s, WorkerSignal::Pause | WorkerSignal::Ready));
        if signal == WorkerSignal::Faulted {
            return Err(ReplicationError::WorkerFaulted {
                name: control.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn control(&self, id: WorkerId) -> Option<Arc<WorkerControl>> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|h| Arc::clone(h.control()))
    }

    pub fn pause(&self, id: WorkerId) -> bool {
        self.control(id)
            .map_or(false, |c| c.transition(WorkerSignal::Continue, WorkerSignal::Pause))
    }

    pub fn resume(&self, id: WorkerId) -> bool {
        self.control(id)
            .map_or(false, |c| c.transition(WorkerSignal::Pause, WorkerSignal::Continue))
    }

    pub fn terminate(&mut self, id: WorkerId) {
        if let Some(handle) = self.slots.get_mut(id.0).and_then(Option::take) {
            handle.terminate();
        }
    }

    pub fn force_kill(&mut self, id: WorkerId) {
        if let Some(handle) = self.slots.get_mut(id.0).and_then(Option::take) {
            handle.force_kill();
        }
    }

    /// Terminate every worker in launch order.
    pub fn terminate_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(handle) = slot.take() {
                handle.terminate();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        polls: Arc<AtomicUsize>,
        fail_prepare: bool,
    }

    impl Worker for Counter {
        fn name(&self) -> String {
            "counter".into()
        }

        fn prepare(&mut self, _control: &WorkerControl) -> Result<()> {
            if self.fail_prepare {
                return Err(ReplicationError::Stopped);
            }
            Ok(())
        }

        fn poll(&mut self, _control: &WorkerControl) -> Result<bool> {
            self.polls.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        }
    }

    fn counter(fail_prepare: bool) -> (Counter, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        (
            Counter {
                polls: Arc::clone(&polls),
                fail_prepare,
            },
            polls,
        )
    }

    #[test]
    fn test_backoff_escalates_to_yield() {
        let mut b = Backoff::new();
        for _ in 0..=SPIN_LIMIT {
            assert!(!b.is_yielding());
            b.snooze();
        }
        assert!(b.is_yielding());
        b.reset();
        assert!(!b.is_yielding());
    }

    #[test]
    fn test_signal_transitions() {
        let control = WorkerControl::new("t", FaultPolicy::HaltDivision);
        assert_eq!(control.signal(), WorkerSignal::Pause);
        assert!(!control.transition(WorkerSignal::Ready, WorkerSignal::Continue));
        assert!(control.transition(WorkerSignal::Pause, WorkerSignal::Ready));
        control.set(WorkerSignal::SelfReturn);
        assert!(control.should_stop());
    }

    #[test]
    fn test_terminal_states_stick() {
        let control = WorkerControl::new("t", FaultPolicy::HaltDivision);
        control.fault(&ReplicationError::Stopped);
        assert_eq!(control.signal(), WorkerSignal::Faulted);
        control.set(WorkerSignal::Continue);
        assert_eq!(control.signal(), WorkerSignal::Faulted);
    }

    #[test]
    fn test_launch_runs_and_terminates() {
        let mut pool = WorkerPool::new(2, FaultPolicy::HaltDivision);
        let (worker, polls) = counter(false);
        let id = pool.launch(worker).unwrap();
        while polls.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }
        let control = pool.control(id).unwrap();
        pool.terminate(id);
        assert_eq!(control.signal(), WorkerSignal::Exited);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_pause_stops_polling() {
        let mut pool = WorkerPool::new(1, FaultPolicy::HaltDivision);
        let (worker, polls) = counter(false);
        let id = pool.launch(worker).unwrap();
        assert!(pool.pause(id));
        // Let an in-flight poll finish.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let frozen = polls.load(Ordering::Relaxed);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(polls.load(Ordering::Relaxed), frozen);
        assert!(pool.resume(id));
        pool.terminate_all();
    }

    #[test]
    fn test_failed_prepare_reports_fault() {
        let mut pool = WorkerPool::new(1, FaultPolicy::HaltDivision);
        let (worker, _) = counter(true);
        assert!(matches!(pool.launch(worker), Err(ReplicationError::WorkerFaulted { .. })));
    }

    #[test]
    fn test_force_kill_cancels() {
        let mut pool = WorkerPool::new(1, FaultPolicy::HaltDivision);
        let (worker, _) = counter(false);
        let id = pool.launch(worker).unwrap();
        let control = pool.control(id).unwrap();
        pool.force_kill(id);
        assert!(control.cancel_token().is_cancelled());
        assert!(control.should_stop());
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_detached_launch_continues_itself() {
        let mut pool = WorkerPool::new(1, FaultPolicy::HaltDivision);
        let (worker, polls) = counter(false);
        let id = pool.launch_detached(worker).unwrap();
        pool.wait_running(id).unwrap();
        while polls.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }
        pool.terminate_all();
    }
}
