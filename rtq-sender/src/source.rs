use feedback::{AckingWriter, Error, MediaSource, Result, SourceWriter};
use log::{debug, info};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use util::marshal::Marshal;

const FRAME_RATE: u32 = 30;
const CLOCK_RATE: u32 = 90_000;
const PAYLOAD_TYPE: u8 = 96;
const SSRC: u32 = 0;
const PAYLOAD_SIZE: usize = 1200;

/// Video-like RTP source producing constant-size frames at the current bitrate.
pub struct SyntheticSource {
    bitrate_kbps: watch::Sender<u32>,
    stopped: watch::Sender<bool>,
}

impl SyntheticSource {
    pub fn new(bitrate_kbps: u32) -> Self {
        Self {
            bitrate_kbps: watch::Sender::new(bitrate_kbps),
            stopped: watch::Sender::new(false),
        }
    }

    /// Writes frames through `writer` until `duration` elapses, the source is
    /// stopped or a write fails.
    pub async fn produce<W: AckingWriter>(
        &self,
        writer: &SourceWriter<W>,
        duration: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut ticker = tokio::time::interval(Duration::from_secs(1) / FRAME_RATE);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stopped = self.stopped.subscribe();

        let mut sequence_number: u16 = 0;
        let mut timestamp: u32 = 0;
        let mut frames = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped.wait_for(|stopped| *stopped) => break,
            }
            if Instant::now() >= deadline {
                info!("source finished after {} frames", frames);
                break;
            }

            let packets = packets_per_frame(*self.bitrate_kbps.borrow());
            for i in 0..packets {
                let raw = rtp::packet::Packet {
                    header: rtp::header::Header {
                        version: 2,
                        marker: i + 1 == packets,
                        payload_type: PAYLOAD_TYPE,
                        sequence_number,
                        timestamp,
                        ssrc: SSRC,
                        ..Default::default()
                    },
                    payload: vec![0u8; PAYLOAD_SIZE].into(),
                }
                .marshal()
                .map_err(|err| Error::MalformedData(err.to_string()))?;
                writer.write(&raw)?;
                sequence_number = sequence_number.wrapping_add(1);
            }
            timestamp = timestamp.wrapping_add(CLOCK_RATE / FRAME_RATE);
            frames += 1;
        }
        Ok(())
    }
}

impl MediaSource for SyntheticSource {
    fn set_bitrate(&self, kbps: u32) {
        debug!("source bitrate {} kbit/s", kbps);
        self.bitrate_kbps.send_replace(kbps);
    }

    fn stop(&self) {
        self.stopped.send_replace(true);
    }
}

/// Number of full-size packets carrying one frame at `kbps`, at least one.
fn packets_per_frame(kbps: u32) -> usize {
    let frame_bytes = kbps as usize * 1000 / 8 / FRAME_RATE as usize;
    frame_bytes.div_ceil(PAYLOAD_SIZE).max(1)
}
