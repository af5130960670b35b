//! RFC 8888 reception model - records inferred arrivals and builds CCFB reports.

use super::ReceptionModel;
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use std::collections::BTreeMap;

/// RTCP version 2, shifted into the first header byte.
const RTCP_VERSION: u8 = 2 << 6;

/// Feedback message type for congestion control feedback.
const FORMAT_CCFB: u8 = 11;

/// Transport layer feedback packet type.
const PACKET_TYPE_TRANSPORT_FEEDBACK: u8 = 205;

/// Maximum number of metric blocks reported per flow.
const MAX_REPORTS_PER_FLOW: i64 = 16384;

/// Largest packet the 16-bit RTCP length field can describe, in bytes.
const MAX_PACKET_SIZE: usize = (u16::MAX as usize + 1) * 4;

/// Largest representable arrival time offset; larger offsets saturate.
const MAX_ARRIVAL_TIME_OFFSET: u32 = 0x1FFE;

const RECEIVED_BIT: u16 = 0x8000;
const ECN_SHIFT: u16 = 13;

/// Sequence number unwrapper to handle 16-bit wraparound.
struct SequenceUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SequenceUnwrapper {
    fn new() -> Self {
        Self {
            last_unwrapped: None,
        }
    }

    fn unwrap(&mut self, seq: u16) -> i64 {
        let unwrapped = match self.last_unwrapped {
            None => seq as i64,
            Some(last) => {
                let mut diff = seq as i64 - (last & 0xFFFF);
                if diff > 0x8000 {
                    diff -= 0x10000;
                } else if diff < -0x8000 {
                    diff += 0x10000;
                }
                last + diff
            }
        };
        self.last_unwrapped = Some(unwrapped);
        unwrapped
    }
}

#[derive(Debug, Copy, Clone)]
struct Arrival {
    ntp_time: u32,
    ecn: u8,
}

struct Flow {
    unwrapper: SequenceUnwrapper,
    /// Arrivals since the last report, keyed by unwrapped sequence number.
    pending: BTreeMap<i64, Arrival>,
}

impl Flow {
    fn new() -> Self {
        Self {
            unwrapper: SequenceUnwrapper::new(),
            pending: BTreeMap::new(),
        }
    }
}

/// Builds RFC 8888 congestion control feedback from recorded arrivals.
///
/// Each report covers, per flow, the range between the lowest and highest
/// sequence number received since the previous report. Sequence numbers in
/// that range without an arrival are reported as lost. Flows that do not fit
/// into one RTCP packet are left for the next report.
pub struct CcfbReceptionModel {
    sender_ssrc: u32,
    flows: BTreeMap<u32, Flow>,
    received_bytes: u64,
}

impl Default for CcfbReceptionModel {
    fn default() -> Self {
        Self::new(rand::random())
    }
}

impl CcfbReceptionModel {
    pub fn new(sender_ssrc: u32) -> Self {
        Self {
            sender_ssrc,
            flows: BTreeMap::new(),
            received_bytes: 0,
        }
    }

    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    /// Total payload bytes registered so far.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    fn has_pending(&self) -> bool {
        self.flows.values().any(|flow| !flow.pending.is_empty())
    }
}

impl ReceptionModel for CcfbReceptionModel {
    fn receive(
        &mut self,
        ntp_time: u32,
        flow_id: u32,
        size: usize,
        sequence_number: u16,
        ecn: u8,
    ) {
        let flow = self.flows.entry(flow_id).or_insert_with(Flow::new);
        let unwrapped = flow.unwrapper.unwrap(sequence_number);
        // We are only interested in the first time a packet is received.
        flow.pending.entry(unwrapped).or_insert(Arrival {
            ntp_time,
            ecn: ecn & 0x03,
        });
        self.received_bytes += size as u64;
    }

    // Only the RFC 8888 layout is produced, whatever `standardized` says.
    fn create_report(&mut self, ntp_time: u32, _standardized: bool) -> Option<Bytes> {
        if !self.has_pending() {
            return None;
        }

        let mut buf = BytesMut::new();
        // Header is written once the length is known.
        buf.put_u32(0);
        buf.put_u32(self.sender_ssrc);

        for (media_ssrc, flow) in self.flows.iter_mut() {
            let (Some(&first), Some(&end)) =
                (flow.pending.keys().next(), flow.pending.keys().next_back())
            else {
                continue;
            };
            let begin = first.max(end - MAX_REPORTS_PER_FLOW + 1);
            let num_reports = (end - begin + 1) as u16;

            // media ssrc, begin/num, padded blocks, then the report timestamp
            let block_size = 8 + 2 * (num_reports as usize + num_reports as usize % 2);
            if buf.len() + block_size + 4 > MAX_PACKET_SIZE {
                trace!("ccfb report full, flow {:x} deferred", media_ssrc);
                continue;
            }
            let pending = std::mem::take(&mut flow.pending);

            buf.put_u32(*media_ssrc);
            buf.put_u16((begin & 0xFFFF) as u16);
            buf.put_u16(num_reports);
            for seq in begin..=end {
                buf.put_u16(match pending.get(&seq) {
                    Some(arrival) => metric_block(ntp_time, arrival),
                    None => 0,
                });
            }
            if num_reports % 2 == 1 {
                buf.put_u16(0);
            }
            trace!(
                "ccfb report for flow {:x}: begin_seq={} num_reports={}",
                media_ssrc,
                begin & 0xFFFF,
                num_reports
            );
        }
        buf.put_u32(ntp_time);

        let length = u16::try_from(buf.len() / 4 - 1).ok()?;
        buf[0] = RTCP_VERSION | FORMAT_CCFB;
        buf[1] = PACKET_TYPE_TRANSPORT_FEEDBACK;
        buf[2..4].copy_from_slice(&length.to_be_bytes());

        Some(buf.freeze())
    }
}

/// Encodes one received packet: R bit, two ECN bits, 13-bit arrival time offset.
fn metric_block(report_time: u32, arrival: &Arrival) -> u16 {
    RECEIVED_BIT
        | ((arrival.ecn as u16) << ECN_SHIFT)
        | arrival_time_offset(report_time, arrival.ntp_time)
}

/// Offset of `arrival_time` before `report_time` in 1/1024 seconds.
///
/// Both times are Q16.16 seconds; arrivals after the report time map to 0.
fn arrival_time_offset(report_time: u32, arrival_time: u32) -> u16 {
    let delta = report_time.wrapping_sub(arrival_time);
    if (delta as i32) < 0 {
        return 0;
    }
    (delta >> 6).min(MAX_ARRIVAL_TIME_OFFSET) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_feedback;

    const SECOND: u32 = 1 << 16;

    fn u16_at(report: &[u8], offset: usize) -> u16 {
        u16::from_be_bytes([report[offset], report[offset + 1]])
    }

    fn u32_at(report: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes([
            report[offset],
            report[offset + 1],
            report[offset + 2],
            report[offset + 3],
        ])
    }

    #[test]
    fn test_sequence_unwrapper() {
        let mut unwrapper = SequenceUnwrapper::new();
        assert_eq!(unwrapper.unwrap(65533), 65533);
        assert_eq!(unwrapper.unwrap(0), 65536);
        assert_eq!(unwrapper.unwrap(1), 65537);
        assert_eq!(unwrapper.unwrap(65534), 65534);
        assert_eq!(unwrapper.unwrap(2), 65538);
    }

    #[test]
    fn test_arrival_time_offset() {
        assert_eq!(arrival_time_offset(SECOND, SECOND), 0);
        // half a second is 512/1024
        assert_eq!(arrival_time_offset(2 * SECOND, 2 * SECOND - SECOND / 2), 512);
        // arrival after the report time
        assert_eq!(arrival_time_offset(SECOND, 2 * SECOND), 0);
        // ten seconds saturates
        assert_eq!(
            arrival_time_offset(20 * SECOND, 10 * SECOND),
            MAX_ARRIVAL_TIME_OFFSET as u16
        );
    }

    #[test]
    fn test_no_report_without_arrivals() {
        let mut model = CcfbReceptionModel::new(1);
        assert!(model.create_report(SECOND, true).is_none());

        model.receive(SECOND, 0x11, 100, 5, 0);
        assert!(model.create_report(SECOND, true).is_some());
        // pending arrivals were consumed by the first report
        assert!(model.create_report(2 * SECOND, true).is_none());
    }

    #[test]
    fn test_report_layout() {
        let mut model = CcfbReceptionModel::new(0xAABBCCDD);
        let report_time = 10 * SECOND;
        model.receive(report_time - SECOND / 4, 0x11, 1200, 10, 0);
        model.receive(report_time - SECOND / 8, 0x11, 1200, 12, 1);
        model.receive(report_time, 0x11, 1200, 13, 0);
        assert_eq!(model.received_bytes(), 3600);

        let report = model.create_report(report_time, true).unwrap();
        // header + sender ssrc + (media ssrc, begin/num) + 4 blocks + report timestamp
        assert_eq!(report.len(), 4 + 4 + 8 + 8 + 4);
        assert_eq!(report[0], 0x80 | FORMAT_CCFB);
        assert_eq!(report[1], PACKET_TYPE_TRANSPORT_FEEDBACK);
        assert_eq!(u16_at(&report, 2) as usize, report.len() / 4 - 1);
        assert_eq!(u32_at(&report, 4), 0xAABBCCDD);
        assert_eq!(u32_at(&report, 8), 0x11);
        assert_eq!(u16_at(&report, 12), 10);
        assert_eq!(u16_at(&report, 14), 4);
        assert_eq!(u16_at(&report, 16), RECEIVED_BIT | 256);
        assert_eq!(u16_at(&report, 18), 0);
        assert_eq!(u16_at(&report, 20), RECEIVED_BIT | (1 << ECN_SHIFT) | 128);
        assert_eq!(u16_at(&report, 22), RECEIVED_BIT);
        assert_eq!(u32_at(&report, 24), report_time);
    }

    #[test]
    fn test_report_pads_odd_block_count() {
        let mut model = CcfbReceptionModel::new(1);
        model.receive(SECOND, 0x22, 100, 7, 0);
        let report = model.create_report(SECOND, true).unwrap();
        assert_eq!(report.len(), 4 + 4 + 8 + 4 + 4);
        assert_eq!(u16_at(&report, 14), 1);
        assert_eq!(u16_at(&report, 18), 0);
    }

    #[test]
    fn test_report_keeps_first_arrival() {
        let mut model = CcfbReceptionModel::new(1);
        model.receive(SECOND, 0x22, 100, 7, 0);
        model.receive(2 * SECOND, 0x22, 100, 7, 0);
        let report = model.create_report(2 * SECOND, true).unwrap();
        assert_eq!(u16_at(&report, 14), 1);
        assert_eq!(u16_at(&report, 16), RECEIVED_BIT | 1024);
    }

    #[test]
    fn test_report_across_wraparound() {
        let mut model = CcfbReceptionModel::new(1);
        model.receive(SECOND, 0x33, 100, 65000, 0);
        let _ = model.create_report(SECOND, true);

        for seq in [0u16, 1, 65534, 65535] {
            model.receive(SECOND, 0x33, 100, seq, 0);
        }
        let report = model.create_report(SECOND, true).unwrap();
        assert_eq!(u16_at(&report, 12), 65534);
        assert_eq!(u16_at(&report, 14), 4);
    }

    #[test]
    fn test_report_limits_range() {
        let mut model = CcfbReceptionModel::new(1);
        model.receive(SECOND, 0x44, 100, 0, 0);
        model.receive(SECOND, 0x44, 100, 20000, 0);
        let report = model.create_report(SECOND, true).unwrap();
        assert_eq!(u16_at(&report, 14) as i64, MAX_REPORTS_PER_FLOW);
        assert_eq!(u16_at(&report, 12) as i64, 20000 - MAX_REPORTS_PER_FLOW + 1);
    }

    #[test]
    fn test_report_covers_each_flow() {
        let mut model = CcfbReceptionModel::new(1);
        model.receive(SECOND, 0x01, 100, 1, 0);
        model.receive(SECOND, 0x02, 100, 9, 0);
        let report = model.create_report(SECOND, true).unwrap();
        assert_eq!(report.len(), 4 + 4 + 2 * (8 + 4) + 4);
        assert_eq!(u32_at(&report, 8), 0x01);
        assert_eq!(u32_at(&report, 20), 0x02);
        assert_eq!(u16_at(&report, 24), 9);
    }

    #[test]
    fn test_oversized_report_defers_flows() {
        let mut model = CcfbReceptionModel::new(1);
        for flow_id in 1..=8 {
            model.receive(SECOND, flow_id, 100, 0, 0);
            model.receive(SECOND, flow_id, 100, 16383, 0);
        }

        let report = model.create_report(SECOND, true).unwrap();
        assert!(report.len() <= MAX_PACKET_SIZE);
        assert_eq!(u16_at(&report, 2) as usize, report.len() / 4 - 1);
        // seven full-range flows fit, the eighth waits
        assert_eq!(report.len(), 4 + 4 + 7 * (8 + 2 * 16384) + 4);
        assert_eq!(parse_feedback(&report).unwrap().len(), 1);

        let report = model.create_report(2 * SECOND, true).unwrap();
        assert_eq!(report.len(), 4 + 4 + 8 + 2 * 16384 + 4);
        assert_eq!(u32_at(&report, 8), 8);
        assert_eq!(u16_at(&report, 14) as i64, MAX_REPORTS_PER_FLOW);
        assert!(model.create_report(3 * SECOND, true).is_none());
    }

    #[test]
    fn test_report_parses_as_rtcp() {
        let mut model = CcfbReceptionModel::new(1);
        for seq in 100..110 {
            model.receive(SECOND, 0x55, 1200, seq, 0);
        }
        let report = model.create_report(SECOND, true).unwrap();
        let packets = parse_feedback(&report).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            packets[0].header().packet_type,
            rtcp::header::PacketType::TransportSpecificFeedback
        );
    }
}
