use crate::error::Result;
use crate::packet::FeedbackPacket;
use crate::source::MediaSource;
use log::info;
use std::sync::Arc;
use std::time::Instant;

/// Sender-side congestion controller consuming feedback.
pub trait CongestionEstimator: Send {
    fn on_feedback(&mut self, packets: &[FeedbackPacket], now: Instant) -> Result<()>;

    /// Target bitrate for `flow_id` in bit/s.
    fn target_bitrate(&self, flow_id: u32) -> Result<i64>;
}

/// Propagates target bitrate changes to the media source.
///
/// Only positive estimates that differ from the last applied one reach the
/// source, so the encoder is not reconfigured on every feedback cycle.
pub struct RateAdapter {
    flow_id: u32,
    source: Arc<dyn MediaSource>,
    target_bitrate: i64,
}

impl RateAdapter {
    pub fn new(flow_id: u32, source: Arc<dyn MediaSource>) -> Self {
        Self {
            flow_id,
            source,
            target_bitrate: 0,
        }
    }

    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    /// Last applied target in bit/s, 0 before the first change.
    pub fn target_bitrate(&self) -> i64 {
        self.target_bitrate
    }

    /// Reads the estimator's target for this flow and applies it if it changed.
    pub fn update(&mut self, estimator: &dyn CongestionEstimator) -> Result<bool> {
        let bitrate = estimator.target_bitrate(self.flow_id)?;
        Ok(self.apply(bitrate))
    }

    /// Applies `bitrate` (bit/s) to the source. Returns whether the source was reconfigured.
    pub fn apply(&mut self, bitrate: i64) -> bool {
        if bitrate <= 0 || bitrate == self.target_bitrate {
            return false;
        }
        self.target_bitrate = bitrate;
        info!("new target bitrate: {}", bitrate);
        self.source
            .set_bitrate(u32::try_from(bitrate / 1000).unwrap_or(u32::MAX));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSource {
        bitrates: Mutex<Vec<u32>>,
    }

    impl MediaSource for RecordingSource {
        fn set_bitrate(&self, kbps: u32) {
            self.bitrates.lock().unwrap().push(kbps);
        }

        fn stop(&self) {}
    }

    struct FixedEstimate(Result<i64>);

    impl CongestionEstimator for FixedEstimate {
        fn on_feedback(&mut self, _packets: &[FeedbackPacket], _now: Instant) -> Result<()> {
            Ok(())
        }

        fn target_bitrate(&self, _flow_id: u32) -> Result<i64> {
            match &self.0 {
                Ok(bitrate) => Ok(*bitrate),
                Err(err) => Err(Error::Estimator(err.to_string())),
            }
        }
    }

    #[test]
    fn test_apply_only_on_change() {
        let source = Arc::new(RecordingSource::default());
        let mut adapter = RateAdapter::new(0, source.clone());

        assert!(adapter.apply(500_000));
        assert!(!adapter.apply(500_000));
        assert!(adapter.apply(750_000));

        assert_eq!(*source.bitrates.lock().unwrap(), vec![500, 750]);
        assert_eq!(adapter.target_bitrate(), 750_000);
    }

    #[test]
    fn test_apply_ignores_non_positive() {
        let source = Arc::new(RecordingSource::default());
        let mut adapter = RateAdapter::new(0, source.clone());

        assert!(!adapter.apply(0));
        assert!(!adapter.apply(-1));
        assert!(source.bitrates.lock().unwrap().is_empty());
        assert_eq!(adapter.target_bitrate(), 0);
    }

    #[test]
    fn test_update_reads_estimator() {
        let source = Arc::new(RecordingSource::default());
        let mut adapter = RateAdapter::new(0, source.clone());

        assert!(adapter.update(&FixedEstimate(Ok(1_200_000))).unwrap());
        assert!(!adapter.update(&FixedEstimate(Ok(1_200_000))).unwrap());
        assert_eq!(*source.bitrates.lock().unwrap(), vec![1200]);

        let failing = FixedEstimate(Err(Error::Estimator("unknown flow".to_string())));
        assert!(adapter.update(&failing).is_err());
    }
}
