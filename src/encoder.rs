//! Encoder worker: raw frames in, one broadcast round per frame out.

use std::panic;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::{Delivery, FrameBroadcaster};
use crate::codec::{CodecError, FrameCodec};
use crate::frame::RawFrame;
use crate::handoff::Handoff;
use crate::stats::PipelineStats;

/// Log pipeline counters every this many encoded frames.
const STATS_EVERY: u64 = 100;

pub struct FrameEncoder {
    codec: Arc<dyn FrameCodec>,
    stats: Arc<PipelineStats>,
}

impl FrameEncoder {
    pub fn new(codec: Arc<dyn FrameCodec>, stats: Arc<PipelineStats>) -> Self {
        Self { codec, stats }
    }

    /// Pull raw frames and broadcast each encoded result.
    ///
    /// The next raw frame is only requested once the previous one reached at
    /// least one consumer, so with nobody watching the capture side ends up
    /// dropping frames instead of this worker encoding them.
    pub async fn run(
        self,
        raw: Arc<Handoff<RawFrame>>,
        frames: FrameBroadcaster,
        token: CancellationToken,
    ) -> Result<(), CodecError> {
        info!(max_fanout = frames.max_fanout(), "Starting frame encoder");

        loop {
            let Ok(raw_frame) = raw.receive(&token).await else {
                break;
            };

            let codec = Arc::clone(&self.codec);
            let encoded = match tokio::task::spawn_blocking(move || codec.transcode(&raw_frame)).await {
                Ok(result) => result?,
                Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
                Err(_) => break,
            };
            self.stats.record_encoded();

            let snapshot = self.stats.snapshot();
            if snapshot.frames_encoded % STATS_EVERY == 0 {
                debug!(
                    captured = snapshot.frames_captured,
                    dropped = snapshot.frames_dropped,
                    encoded = snapshot.frames_encoded,
                    served = snapshot.consumers_served,
                    "Pipeline stats"
                );
            }

            match frames.publish(encoded, &token).await {
                Ok(Delivery::Broadcast(consumers)) => self.stats.record_served(consumers),
                Ok(Delivery::AfterWait) => {
                    debug!("Frame claimed after backpressure wait");
                    self.stats.record_backpressure();
                    self.stats.record_served(1);
                }
                Err(_) => break,
            }
        }

        info!("Frame encoder stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EncodedFrame;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct Passthrough;

    impl FrameCodec for Passthrough {
        fn transcode(&self, raw: &RawFrame) -> Result<EncodedFrame, CodecError> {
            Ok(EncodedFrame::new(raw.as_bytes().to_vec()))
        }
    }

    struct Rejecting;

    impl FrameCodec for Rejecting {
        fn transcode(&self, _raw: &RawFrame) -> Result<EncodedFrame, CodecError> {
            Err(CodecError::Decode(image::ImageError::IoError(std::io::Error::other("garbage"))))
        }
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    fn spawn_encoder(
        codec: Arc<dyn FrameCodec>,
    ) -> (
        Arc<Handoff<RawFrame>>,
        FrameBroadcaster,
        Arc<PipelineStats>,
        CancellationToken,
        tokio::task::JoinHandle<Result<(), CodecError>>,
    ) {
        let raw = Arc::new(Handoff::new());
        let frames = FrameBroadcaster::new(50);
        let stats = Arc::new(PipelineStats::new());
        let token = CancellationToken::new();
        let worker = tokio::spawn(FrameEncoder::new(codec, Arc::clone(&stats)).run(
            Arc::clone(&raw),
            frames.clone(),
            token.clone(),
        ));
        (raw, frames, stats, token, worker)
    }

    #[tokio::test]
    async fn stalls_raw_side_without_consumers() {
        let (raw, frames, stats, token, worker) = spawn_encoder(Arc::new(Passthrough));

        until(|| raw.waiting() == 1).await;
        assert!(raw.try_deliver(RawFrame::copy_from_slice(b"first")).is_ok());

        // Encoded but unclaimed: the encoder must not ask for more raw frames.
        until(|| stats.snapshot().frames_encoded == 1).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(raw.waiting(), 0);
        assert!(raw.try_deliver(RawFrame::copy_from_slice(b"second")).is_err());

        let got = frames.next_frame(&token).await.unwrap();
        assert_eq!(got.bytes().as_ref(), b"first");
        until(|| raw.waiting() == 1).await;
        assert_eq!(stats.snapshot().backpressure_waits, 1);
        assert_eq!(stats.snapshot().consumers_served, 1);

        token.cancel();
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn broadcasts_to_every_waiting_consumer() {
        let (raw, frames, stats, token, worker) = spawn_encoder(Arc::new(Passthrough));

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let frames = frames.clone();
                let token = token.clone();
                tokio::spawn(async move { frames.next_frame(&token).await })
            })
            .collect();
        until(|| frames.waiting() == 3 && raw.waiting() == 1).await;
        assert!(raw.try_deliver(RawFrame::copy_from_slice(b"jpeg")).is_ok());

        let mut received = Vec::new();
        for consumer in consumers {
            received.push(consumer.await.unwrap().unwrap());
        }
        assert!(received.windows(2).all(|pair| pair[0].shares_buffer(&pair[1])));
        until(|| stats.snapshot().consumers_served == 3).await;

        token.cancel();
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn codec_failure_ends_worker() {
        let (raw, _frames, _stats, _token, worker) = spawn_encoder(Arc::new(Rejecting));

        until(|| raw.waiting() == 1).await;
        assert!(raw.try_deliver(RawFrame::copy_from_slice(b"bad")).is_ok());

        assert_matches!(worker.await.unwrap(), Err(CodecError::Decode(_)));
    }

    #[tokio::test]
    async fn cancellation_while_idle() {
        let (raw, _frames, _stats, token, worker) = spawn_encoder(Arc::new(Passthrough));
        until(|| raw.waiting() == 1).await;

        token.cancel();
        assert!(timeout(Duration::from_secs(1), worker).await.unwrap().unwrap().is_ok());
    }
}
