//! Congestion control feedback from delivery acknowledgments.
//!
//! When the transport confirms delivery of individual packets, a sender can
//! infer the feedback a receiver would have produced and feed it to its own
//! congestion controller.
//!
//! - [`AckCollector`](collector::AckCollector): collects delivery acknowledgments and drives a
//!   [`ReceptionModel`] once per feedback cycle.
//! - [`CcfbReceptionModel`](reception::CcfbReceptionModel): a [`ReceptionModel`]
//!   producing RTP Control Protocol (RTCP) Feedback for Congestion Control
//!   reports as specified in <https://datatracker.ietf.org/doc/html/rfc8888>.
//!
//! # Example
//!
//! ```ignore
//! use rtq_feedback::{AckCollectorBuilder, CcfbReceptionModel, TimeBase};
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//!
//! let (report_tx, report_rx) = mpsc::channel(16);
//! let collector = AckCollectorBuilder::new()
//!     .with_interval(Duration::from_millis(10))
//!     .build(CcfbReceptionModel::default(), TimeBase::new(), report_tx);
//! ```

pub mod collector;
pub mod reception;

use bytes::Bytes;

/// Receiver-side view of a flow, fed with inferred arrivals.
///
/// Implementations are pure in-memory estimators and cannot fail.
pub trait ReceptionModel: Send {
    /// Registers the arrival of one packet at `ntp_time` (see [`crate::TimeBase`]).
    fn receive(
        &mut self,
        ntp_time: u32,
        flow_id: u32,
        size: usize,
        sequence_number: u16,
        ecn: u8,
    );

    /// Builds a feedback report as of `ntp_time`, if one is due.
    fn create_report(&mut self, ntp_time: u32, standardized: bool) -> Option<Bytes>;
}
