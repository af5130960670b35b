//! Acknowledgment collector - batches delivery acknowledgments into feedback cycles.

use super::ReceptionModel;
use crate::packet::{AckedPacket, FeedbackBatch, parse_feedback};
use crate::telemetry::TelemetryRecorder;
use crate::time::TimeBase;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Default length of one feedback cycle.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);

/// Default number of acknowledgments queued between two cycles.
const DEFAULT_CAPACITY: usize = 1000;

/// Shortest accepted feedback cycle.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Default share of the round trip time added to the send time to estimate arrival.
const DEFAULT_RTT_FRACTION: f64 = 0.5;

/// Builder for the [`AckCollector`].
///
/// # Example
///
/// ```ignore
/// use rtq_feedback::{AckCollectorBuilder, CcfbReceptionModel, TimeBase};
/// use std::time::Duration;
///
/// let collector = AckCollectorBuilder::new()
///     .with_interval(Duration::from_millis(10))
///     .with_capacity(1000)
///     .with_rtt_fraction(0.5)
///     .build(CcfbReceptionModel::default(), TimeBase::new(), report_tx);
/// ```
pub struct AckCollectorBuilder {
    interval: Duration,
    capacity: usize,
    rtt_fraction: f64,
    telemetry: Option<TelemetryRecorder>,
}

impl Default for AckCollectorBuilder {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            capacity: DEFAULT_CAPACITY,
            rtt_fraction: DEFAULT_RTT_FRACTION,
            telemetry: None,
        }
    }
}

impl AckCollectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the length of one feedback cycle, at least one millisecond.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Set how many acknowledgments may queue up before the oldest are dropped.
    ///
    /// The queue rounds the capacity up to the next power of two.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set the share of the round trip time assumed to be spent on the forward path.
    pub fn with_rtt_fraction(mut self, rtt_fraction: f64) -> Self {
        self.rtt_fraction = rtt_fraction.clamp(0.0, 1.0);
        self
    }

    /// Record every generated report on the feedback-out stream of `telemetry`.
    pub fn with_telemetry(mut self, telemetry: TelemetryRecorder) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Spawns the feedback cycle loop on the current tokio runtime.
    ///
    /// Reports are delivered on `reports`.
    pub fn build<M>(
        self,
        model: M,
        time_base: TimeBase,
        reports: mpsc::Sender<Bytes>,
    ) -> AckCollector
    where
        M: ReceptionModel + 'static,
    {
        let (acked_tx, acked_rx) = broadcast::channel(self.capacity);
        let (stop_tx, stop_rx) = watch::channel(false);

        let cycle = FeedbackCycle {
            model,
            time_base,
            reports,
            telemetry: self.telemetry,
            batch: FeedbackBatch::new(),
        };
        tokio::spawn(cycle.run(self.interval, acked_rx, stop_rx));

        AckCollector {
            acked: acked_tx,
            stop: Arc::new(stop_tx),
            rtt_fraction: self.rtt_fraction,
        }
    }
}

/// Collects delivery acknowledgments from any number of producers.
///
/// Cloning is cheap; all clones feed the same feedback cycle loop.
#[derive(Clone)]
pub struct AckCollector {
    acked: broadcast::Sender<AckedPacket>,
    stop: Arc<watch::Sender<bool>>,
    rtt_fraction: f64,
}

impl AckCollector {
    /// Registers interest in the delivery of one outgoing packet.
    pub fn record_sent(
        &self,
        flow_id: u32,
        sequence_number: u16,
        size: usize,
        send_time: Instant,
    ) -> AckHandle {
        AckHandle {
            acked: self.acked.clone(),
            rtt_fraction: self.rtt_fraction,
            send_time,
            flow_id,
            size,
            sequence_number,
        }
    }

    /// Stops the feedback cycle loop. Queued acknowledgments are dropped.
    pub fn close(&self) {
        if !self.stop.send_replace(true) {
            debug!("ack collector close requested");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Pending delivery notification for one sent packet.
///
/// Consumed by [`AckHandle::on_delivered`], so a packet is acknowledged at most once.
pub struct AckHandle {
    acked: broadcast::Sender<AckedPacket>,
    rtt_fraction: f64,
    send_time: Instant,
    flow_id: u32,
    size: usize,
    sequence_number: u16,
}

impl AckHandle {
    /// Estimated arrival of the packet at the receiver.
    pub fn estimated_arrival(&self, rtt: Duration) -> Instant {
        self.send_time + rtt.mul_f64(self.rtt_fraction)
    }

    /// Handles the transport's delivery signal. Lost packets are dropped.
    ///
    /// Never blocks: when the queue is full the oldest acknowledgment is evicted.
    pub fn on_delivered(self, delivered: bool, rtt: Duration) {
        if !delivered {
            trace!(
                "packet {:x}/{} lost, no feedback",
                self.flow_id, self.sequence_number
            );
            return;
        }
        let packet = AckedPacket {
            arrival: self.estimated_arrival(rtt),
            flow_id: self.flow_id,
            size: self.size,
            sequence_number: self.sequence_number,
        };
        if self.acked.send(packet).is_err() {
            trace!("ack collector stopped, dropping acknowledgment");
        }
    }
}

/// State owned by the feedback cycle loop.
struct FeedbackCycle<M> {
    model: M,
    time_base: TimeBase,
    reports: mpsc::Sender<Bytes>,
    telemetry: Option<TelemetryRecorder>,
    batch: FeedbackBatch,
}

impl<M: ReceptionModel> FeedbackCycle<M> {
    async fn run(
        mut self,
        interval: Duration,
        mut acked: broadcast::Receiver<AckedPacket>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = acked.recv() => match res {
                    Ok(packet) => self.batch.push(packet),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("ack collector queue full, dropped {} oldest acknowledgments", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if let Some(report) = self.cycle() {
                        if !self.forward(report, &mut stop).await {
                            break;
                        }
                    }
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(
            "ack collector stopped, {} unreported acknowledgments dropped",
            self.batch.len()
        );
    }

    /// Hands the batch to the reception model and asks it for a report.
    fn cycle(&mut self) -> Option<Bytes> {
        if self.batch.is_empty() {
            return None;
        }
        let packets = self.batch.take_sorted();
        for packet in &packets {
            self.model.receive(
                self.time_base.to_fixed_point(packet.arrival),
                packet.flow_id,
                packet.size,
                packet.sequence_number,
                0,
            );
        }
        let last = packets.last()?;
        let report = self
            .model
            .create_report(self.time_base.to_fixed_point(last.arrival), true);
        trace!(
            "feedback cycle: {} acknowledgments, report: {}",
            packets.len(),
            report.is_some()
        );
        report
    }

    /// Delivers a report downstream. Returns false once the loop must stop.
    async fn forward(&mut self, report: Bytes, stop: &mut watch::Receiver<bool>) -> bool {
        if let Some(telemetry) = &self.telemetry {
            let now = Instant::now();
            match parse_feedback(&report) {
                Ok(packets) => {
                    for packet in packets {
                        telemetry.observe_feedback_out(packet, now);
                    }
                }
                Err(err) => warn!("generated feedback report is not valid RTCP: {}", err),
            }
        }

        tokio::select! {
            res = self.reports.send(report) => {
                if res.is_err() {
                    debug!("feedback report receiver dropped");
                    return false;
                }
                true
            }
            _ = stop.wait_for(|stopped| *stopped) => false,
        }
    }
}
