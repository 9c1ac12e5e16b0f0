//! Owned handles for outstanding RPCs and timers
//!
//! Every RPC or timer the control context starts is a spawned task whose
//! result comes back as an [`Event::Completion`]. The owner keeps the
//! [`PendingCall`]; dropping it aborts the task, so a torn-down object
//! never sees a late completion. Completions also carry the call's token,
//! and are ignored unless it matches the handle the owner still holds.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{Completion, Event};
use crate::bus::{BusError, ObjectPath};

#[derive(Debug)]
pub(crate) struct PendingCall {
    token: u64,
    handle: JoinHandle<()>,
}

impl PendingCall {
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// True when `slot` holds the call identified by `token`; the call is
/// taken out of the slot in that case
pub(crate) fn take_matching(slot: &mut Option<PendingCall>, token: u64) -> bool {
    match slot {
        Some(call) if call.token == token => {
            *slot = None;
            true
        }
        _ => false,
    }
}

/// Spawner for control-context tasks
pub(crate) struct Tasks {
    tx: mpsc::UnboundedSender<Event>,
    next_token: u64,
}

impl Tasks {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx, next_token: 1 }
    }

    fn token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// Run `fut` and deliver its output through `wrap`
    pub fn call<T, F, W>(&mut self, fut: F, wrap: W) -> PendingCall
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        W: FnOnce(u64, T) -> Completion + Send + 'static,
    {
        let token = self.token();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let out = fut.await;
            let _ = tx.send(Event::Completion(wrap(token, out)));
        });
        PendingCall { token, handle }
    }

    /// Single-shot timer
    pub fn timer<W>(&mut self, delay: Duration, wrap: W) -> PendingCall
    where
        W: FnOnce(u64) -> Completion + Send + 'static,
    {
        self.call(tokio::time::sleep(delay), move |token, ()| wrap(token))
    }

    /// Fire-and-forget RPC; failures are only logged
    pub fn detach<F>(&self, method: &'static str, path: ObjectPath, fut: F)
    where
        F: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!("{method} on {path} failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_completion_carries_token() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = Tasks::new(tx);
        let mut slot = Some(tasks.timer(Duration::from_secs(1), |token| Completion::Test { token }));
        let token = slot.as_ref().map(PendingCall::token).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let Some(Event::Completion(Completion::Test { token: got })) = rx.recv().await else {
            panic!("expected a timer completion");
        };
        assert_eq!(got, token);
        assert!(!take_matching(&mut slot, got + 1));
        assert!(take_matching(&mut slot, got));
        assert!(slot.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = Tasks::new(tx);
        let call = tasks.timer(Duration::from_secs(1), |token| Completion::Test { token });
        drop(call);
        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err());
    }
}
