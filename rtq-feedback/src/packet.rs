use crate::error::{Error, Result};
use std::time::Instant;
use util::marshal::Unmarshal;

/// A parsed RTCP packet as produced by [`rtcp::packet::unmarshal`].
pub type FeedbackPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;

/// A payload paired with the instant it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedEvent<T> {
    pub payload: T,
    pub observed_at: Instant,
}

impl<T> TimestampedEvent<T> {
    pub fn new(payload: T, observed_at: Instant) -> Self {
        Self {
            payload,
            observed_at,
        }
    }
}

/// One packet believed to have been delivered.
///
/// `arrival` is an estimate derived from the send time and the transport's
/// round trip time, not a receiver-side measurement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AckedPacket {
    pub arrival: Instant,
    pub flow_id: u32,
    pub size: usize,
    pub sequence_number: u16,
}

/// Acknowledgments accumulated between two feedback cycles.
#[derive(Debug, Default)]
pub struct FeedbackBatch {
    packets: Vec<AckedPacket>,
}

impl FeedbackBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: AckedPacket) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Empties the batch, returning its packets ordered by sequence number.
    ///
    /// Wraparound is not special-cased; the reception model unwraps sequence numbers.
    pub fn take_sorted(&mut self) -> Vec<AckedPacket> {
        let mut packets = std::mem::take(&mut self.packets);
        packets.sort_by_key(|p| p.sequence_number);
        packets
    }
}

/// Parses a raw RTCP compound packet.
pub fn parse_feedback(raw: &[u8]) -> Result<Vec<FeedbackPacket>> {
    let mut buf = raw;
    rtcp::packet::unmarshal(&mut buf).map_err(|err| Error::MalformedFeedback(err.to_string()))
}

/// Parses a raw RTP packet.
pub fn parse_data(raw: &[u8]) -> Result<rtp::packet::Packet> {
    let mut buf = raw;
    rtp::packet::Packet::unmarshal(&mut buf).map_err(|err| Error::MalformedData(err.to_string()))
}
