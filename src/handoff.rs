//! Single-slot rendezvous between one producer and any number of consumers.
//!
//! A `Handoff` has no buffer. A value is only ever handed to a consumer that
//! is blocked in [`Handoff::receive`] at the moment of delivery; if nobody is
//! waiting the producer gets its value back. This is the primitive behind both
//! the capture -> encoder handoff and the encoder -> consumers broadcast.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    #[error("handoff cancelled")]
    Cancelled,

    #[error("handoff closed")]
    Closed,
}

pub struct Handoff<T> {
    /// One sender per consumer currently blocked in `receive`, oldest first.
    waiters: Mutex<VecDeque<oneshot::Sender<T>>>,
    /// Signalled whenever a consumer starts waiting.
    arrived: Notify,
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
        }
    }

    /// Number of consumers currently blocked in `receive`.
    pub fn waiting(&self) -> usize {
        self.waiters.lock().iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Hand `value` to one waiting consumer without blocking.
    ///
    /// Returns the value back when no consumer is waiting.
    pub fn try_deliver(&self, value: T) -> Result<(), T> {
        let mut waiters = self.waiters.lock();
        hand_to_next(&mut waiters, value)
    }

    /// Hand `value` to the next consumer, waiting for one to show up if needed.
    pub async fn deliver(&self, mut value: T, token: &CancellationToken) -> Result<(), HandoffError> {
        loop {
            match self.try_deliver(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }

            // notify_one stores a permit when nobody is parked here yet, so an
            // arrival between try_deliver and this select is not lost.
            tokio::select! {
                _ = self.arrived.notified() => {}
                _ = token.cancelled() => return Err(HandoffError::Cancelled),
            }
        }
    }

    /// Block until a producer hands over a value or `token` fires.
    pub async fn receive(&self, token: &CancellationToken) -> Result<T, HandoffError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock();
            waiters.retain(|tx| !tx.is_closed());
            waiters.push_back(tx);
        }
        self.arrived.notify_one();

        tokio::select! {
            biased;
            value = rx => value.map_err(|_| HandoffError::Closed),
            _ = token.cancelled() => Err(HandoffError::Cancelled),
        }
    }
}

impl<T: Clone> Handoff<T> {
    /// Offer `value` to up to `limit` waiting consumers in one round.
    ///
    /// Stops at the first attempt that finds nobody waiting. The waiter queue
    /// stays locked for the whole round, so a consumer that re-registers
    /// right after being served has to wait for the next round.
    pub fn fan_out(&self, value: &T, limit: usize) -> usize {
        let mut waiters = self.waiters.lock();
        let mut served = 0;
        while served < limit {
            if hand_to_next(&mut waiters, value.clone()).is_err() {
                break;
            }
            served += 1;
        }
        served
    }
}

fn hand_to_next<T>(waiters: &mut VecDeque<oneshot::Sender<T>>, mut value: T) -> Result<(), T> {
    while let Some(tx) = waiters.pop_front() {
        // A consumer that gave up (cancelled or dropped) hands the value back.
        match tx.send(value) {
            Ok(()) => return Ok(()),
            Err(returned) => value = returned,
        }
    }
    Err(value)
}
