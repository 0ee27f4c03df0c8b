//! Fan-out of encoded frames to concurrent consumers
//!
//! Every stream client, snapshot request and the timelapse sampler reads from
//! the same [`FrameBroadcaster`]. One publish is one fan-out round: the frame
//! goes to every consumer waiting right now (up to `max_fanout`), and nobody
//! else. Late arrivals simply catch the next round.

use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::EncodedFrame;
use crate::handoff::{Handoff, HandoffError};

/// How a published frame reached its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to this many consumers that were already waiting.
    Broadcast(usize),
    /// Nobody was waiting; the publisher blocked until one consumer claimed it.
    AfterWait,
}

#[derive(Clone)]
pub struct FrameBroadcaster {
    slot: Arc<Handoff<EncodedFrame>>,
    max_fanout: usize,
}

impl FrameBroadcaster {
    pub fn new(max_fanout: usize) -> Self {
        Self {
            slot: Arc::new(Handoff::new()),
            max_fanout: max_fanout.max(1),
        }
    }

    pub fn max_fanout(&self) -> usize {
        self.max_fanout
    }

    /// Consumers currently blocked waiting for a frame.
    pub fn waiting(&self) -> usize {
        self.slot.waiting()
    }

    /// Run one fan-out round for `frame`.
    ///
    /// If no consumer was waiting at all, block until one claims the frame so
    /// no capture or encode work is spent while nobody is watching. The frame
    /// served after such a wait may be stale, which is why readers discard one
    /// frame first.
    pub async fn publish(&self, frame: EncodedFrame, token: &CancellationToken) -> Result<Delivery, HandoffError> {
        let served = self.slot.fan_out(&frame, self.max_fanout);
        if served > 0 {
            debug!(consumers = served, "Frame broadcast");
            return Ok(Delivery::Broadcast(served));
        }

        debug!("No consumers waiting, holding frame");
        self.slot.deliver(frame, token).await?;
        Ok(Delivery::AfterWait)
    }

    /// Wait for the next frame round.
    pub async fn next_frame(&self, token: &CancellationToken) -> Result<EncodedFrame, HandoffError> {
        self.slot.receive(token).await
    }

    /// Discard one frame, then return the following one.
    pub async fn snapshot(&self, token: &CancellationToken) -> Result<EncodedFrame, HandoffError> {
        self.slot.receive(token).await?;
        self.slot.receive(token).await
    }

    /// Endless stream of frames for one subscriber.
    ///
    /// Drops the first (possibly stale) frame and ends when `token` fires.
    pub fn stream(&self, token: CancellationToken) -> impl Stream<Item = EncodedFrame> + Send + 'static {
        let slot = Arc::clone(&self.slot);
        stream::unfold((slot, token, true), |(slot, token, stale)| async move {
            if stale {
                slot.receive(&token).await.ok()?;
            }
            let frame = slot.receive(&token).await.ok()?;
            Some((frame, (slot, token, false)))
        })
    }
}
