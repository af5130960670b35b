//! Packet telemetry.
//!
//! [`TelemetryRecorder`] writes one tab separated line per observed packet
//! to one of four sinks: incoming and outgoing feedback (RTCP), incoming and
//! outgoing data (RTP).
//!
//! ```text
//! in:	RTCP	<ms>	<raw length | packet type>
//! out:	RTP	<ms>	<payload type>	<ssrc hex>	<seq>	<timestamp>	<marker>	<payload length>
//! ```
//!
//! `<ms>` is the time since the recorder was created.

mod recorder;

pub use recorder::{TelemetryRecorder, TelemetryRecorderBuilder, TelemetrySinks};

use crate::packet::FeedbackPacket;
use rtcp::header::PacketType;
use rtcp::raw_packet::RawPacket;
use std::fmt;
use std::time::Duration;

/// Direction a packet travelled relative to this endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

/// Formats one feedback line. Unparsed packets are logged by byte length.
pub fn feedback_line(direction: Direction, elapsed: Duration, packet: &FeedbackPacket) -> String {
    let detail = match packet.as_any().downcast_ref::<RawPacket>() {
        Some(raw) => raw.0.len().to_string(),
        None => packet_type_tag(packet.header().packet_type).to_string(),
    };
    format!("{}:\tRTCP\t{}\t{}\n", direction, elapsed.as_millis(), detail)
}

/// Formats one data line.
pub fn data_line(direction: Direction, elapsed: Duration, packet: &rtp::packet::Packet) -> String {
    let header = &packet.header;
    format!(
        "{}:\tRTP\t{}\t{}\t{:x}\t{}\t{}\t{}\t{}\n",
        direction,
        elapsed.as_millis(),
        header.payload_type,
        header.ssrc,
        header.sequence_number,
        header.timestamp,
        if header.marker { "1" } else { "0" },
        packet.payload.len()
    )
}

fn packet_type_tag(packet_type: PacketType) -> &'static str {
    match packet_type {
        PacketType::SenderReport => "SenderReport",
        PacketType::ReceiverReport => "ReceiverReport",
        PacketType::SourceDescription => "SourceDescription",
        PacketType::Goodbye => "Goodbye",
        PacketType::ApplicationDefined => "ApplicationDefined",
        PacketType::TransportSpecificFeedback => "TransportSpecificFeedback",
        PacketType::PayloadSpecificFeedback => "PayloadSpecificFeedback",
        PacketType::ExtendedReport => "ExtendedReport",
        _ => "Unsupported",
    }
}
