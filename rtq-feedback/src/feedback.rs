use crate::error::Result;
use crate::packet::parse_feedback;
use crate::rate::{CongestionEstimator, RateAdapter};
use crate::telemetry::TelemetryRecorder;
use bytes::Bytes;
use log::{debug, trace};
use std::time::Instant;
use tokio::sync::{mpsc, watch};

/// Feedback read path.
///
/// Consumes raw RTCP datagrams, records them on the feedback-in telemetry
/// stream, then passes them to the congestion estimator and lets the rate
/// adapter act on the new estimate. A packet that does not parse ends the
/// loop with an error.
pub struct FeedbackReader {
    feedback: mpsc::Receiver<Bytes>,
    telemetry: Option<TelemetryRecorder>,
    rate_control: Option<(Box<dyn CongestionEstimator>, RateAdapter)>,
}

impl FeedbackReader {
    pub fn new(feedback: mpsc::Receiver<Bytes>) -> Self {
        Self {
            feedback,
            telemetry: None,
            rate_control: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryRecorder) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_rate_control(
        mut self,
        estimator: Box<dyn CongestionEstimator>,
        adapter: RateAdapter,
    ) -> Self {
        self.rate_control = Some((estimator, adapter));
        self
    }

    /// Last bitrate applied by the rate adapter, if rate control is attached.
    pub fn target_bitrate(&self) -> Option<i64> {
        self.rate_control
            .as_ref()
            .map(|(_, adapter)| adapter.target_bitrate())
    }

    pub fn handle_feedback(&mut self, raw: &[u8], now: Instant) -> Result<()> {
        let packets = parse_feedback(raw)?;
        trace!("read {} feedback packets ({} bytes)", packets.len(), raw.len());

        // recorded even when rate control fails below
        if let Some(telemetry) = &self.telemetry {
            for packet in &packets {
                telemetry.observe_feedback_in(packet.cloned(), now);
            }
        }
        if let Some((estimator, adapter)) = &mut self.rate_control {
            estimator.on_feedback(&packets, now)?;
            adapter.update(&**estimator)?;
        }
        Ok(())
    }

    /// Reads until the channel closes or `stop` is set.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                raw = self.feedback.recv() => match raw {
                    Some(raw) => self.handle_feedback(&raw, Instant::now())?,
                    None => {
                        debug!("feedback channel closed");
                        return Ok(());
                    }
                },
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
