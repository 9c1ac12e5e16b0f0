//! Data context
//!
//! A dedicated thread owning realtime state (`S`). The control context
//! never touches that state directly: it sends closures that run to
//! completion on the data thread, either waiting for the result
//! ([`DataLoop::invoke`]) or not ([`DataLoop::invoke_async`]).
//!
//! Timers are absolute and single-shot. After every wakeup the loop asks
//! the state for its next deadline and sleeps until then or until the next
//! message arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// State driven by a [`DataLoop`]
pub trait LoopState: Send + 'static {
    /// Earliest absolute time the state wants to be woken at
    fn next_deadline(&self) -> Option<Instant>;

    /// Called once a deadline has passed
    fn on_deadline(&mut self, now: Instant);
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Invoke(Job<S>),
    Stop,
}

/// Handle to a running data thread
pub struct DataLoop<S: LoopState> {
    tx: Sender<Message<S>>,
    running: Arc<AtomicBool>,
    thread_id: ThreadId,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: LoopState> DataLoop<S> {
    /// Spawn the data thread owning `state`
    pub fn spawn(name: &str, state: S) -> Result<Self> {
        let (tx, rx) = unbounded::<Message<S>>();
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(state, rx, running_for_loop))?;

        info!("data loop {name} started");
        Ok(Self {
            tx,
            running,
            thread_id: handle.thread().id(),
            thread_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run `f` on the data thread and wait for its result
    pub fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        if thread::current().id() == self.thread_id {
            return Err(Error::DataLoop("invoke from the data thread would deadlock"));
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Box::new(move |state: &mut S| {
            let _ = reply_tx.send(f(state));
        }))?;
        reply_rx.recv().map_err(|_| Error::DataLoop("data loop stopped before replying"))
    }

    /// Queue `f` on the data thread without waiting
    pub fn invoke_async<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.send(Box::new(f))
    }

    fn send(&self, job: Job<S>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::DataLoop("data loop is not running"));
        }
        self.tx
            .send(Message::Invoke(job))
            .map_err(|_| Error::DataLoop("data loop is not running"))
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Message::Stop);
        if let Some(handle) = self.thread_handle.lock().take() {
            if thread::current().id() != self.thread_id && handle.join().is_err() {
                warn!("data loop thread panicked");
            }
        }
    }
}

impl<S: LoopState> Drop for DataLoop<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<S: LoopState>(mut state: S, rx: Receiver<Message<S>>, running: Arc<AtomicBool>) {
    loop {
        let now = Instant::now();
        if let Some(deadline) = state.next_deadline() {
            if deadline <= now {
                state.on_deadline(now);
                continue;
            }
        }

        let msg = match state.next_deadline() {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };

        match msg {
            Message::Invoke(job) => job(&mut state),
            Message::Stop => break,
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!("data loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Ticker {
        deadline: Option<Instant>,
        fired: u32,
        values: Vec<u32>,
    }

    impl LoopState for Ticker {
        fn next_deadline(&self) -> Option<Instant> {
            self.deadline
        }

        fn on_deadline(&mut self, _now: Instant) {
            self.fired += 1;
            self.deadline = None;
        }
    }

    #[test]
    fn test_invoke_returns_value() {
        let dl = DataLoop::spawn("test-data", Ticker::default()).unwrap();
        dl.invoke(|s| s.values.push(7)).unwrap();
        let values = dl.invoke(|s| s.values.clone()).unwrap();
        assert_eq!(values, vec![7]);
        dl.stop();
        assert!(!dl.is_running());
        assert!(dl.invoke(|s| s.fired).is_err());
    }

    #[test]
    fn test_deadline_fires_once() {
        let dl = DataLoop::spawn("test-timer", Ticker::default()).unwrap();
        dl.invoke(|s| s.deadline = Some(Instant::now() + Duration::from_millis(10)))
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(dl.invoke(|s| s.fired).unwrap(), 1);
    }

    #[test]
    fn test_invoke_async_runs_in_order() {
        let dl = DataLoop::spawn("test-async", Ticker::default()).unwrap();
        for i in 0..10 {
            dl.invoke_async(move |s| s.values.push(i)).unwrap();
        }
        let values = dl.invoke(|s| s.values.clone()).unwrap();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }
}
