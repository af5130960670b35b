//! Feedback and telemetry pipeline for RTP senders.
//!
//! This crate sits between an RTP packet writer and an unreliable transport.
//! It observes every packet sent and every feedback packet received, infers
//! congestion control feedback from transport-level delivery notifications,
//! and keeps a per-packet log for offline analysis.
//!
//! # Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TimeBase`] | Converts instants to the Q16.16 fixed-point time of RTCP feedback |
//! | [`AckCollector`] | Batches delivery acknowledgments into [`ReceptionModel`] feedback cycles |
//! | [`CcfbReceptionModel`] | Builds RFC 8888 congestion control feedback reports |
//! | [`TelemetryRecorder`] | Writes incoming/outgoing RTP and RTCP packets to four log sinks |
//! | [`InstrumentedWriter`] | Wraps the transport write primitive and feeds the collector |
//! | [`SourceWriter`] | Parses packets from the media source and stops it on fatal write errors |
//! | [`RateAdapter`] | Applies changed congestion controller targets to the media source |
//! | [`FeedbackReader`] | Parses incoming feedback and runs telemetry and rate control on it |
//!
//! # Data flow
//!
//! ```text
//! MediaSource -> SourceWriter -> InstrumentedWriter -> transport
//!                                      |                  |
//!                                 AckHandle <---- delivery callback
//!                                      |
//!                                 AckCollector -> ReceptionModel -> report
//!                                                                     |
//! transport feedback ------------------------------------------> FeedbackReader
//!                                                                     |
//!                                          CongestionEstimator -> RateAdapter -> MediaSource
//! ```
//!
//! All processing loops run as tokio tasks and communicate through bounded
//! channels. Builders spawn their loop on the current runtime.

#![warn(rust_2018_idioms)]

pub mod ccfb;
pub mod error;
pub mod feedback;
pub mod packet;
pub mod rate;
pub mod source;
pub mod telemetry;
pub mod time;
pub mod writer;

pub use ccfb::{
    ReceptionModel,
    collector::{AckCollector, AckCollectorBuilder, AckHandle},
    reception::CcfbReceptionModel,
};
pub use error::{Error, Result};
pub use feedback::FeedbackReader;
pub use packet::{AckedPacket, FeedbackBatch, FeedbackPacket, TimestampedEvent};
pub use rate::{CongestionEstimator, RateAdapter};
pub use source::{MediaSource, SourceWriter};
pub use telemetry::{TelemetryRecorder, TelemetryRecorderBuilder, TelemetrySinks};
pub use time::TimeBase;
pub use writer::{AckingWriter, DeliveryCallback, InstrumentedWriter};
