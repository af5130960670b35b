use crate::ccfb::collector::AckCollector;
use crate::error::Result;
use crate::telemetry::TelemetryRecorder;
use bytes::Bytes;
use log::{trace, warn};
use std::time::{Duration, Instant};
use util::marshal::MarshalSize;

/// Invoked by the transport, at most once, with the delivery outcome of one packet.
pub type DeliveryCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Transport write primitive with per-packet delivery notification.
pub trait AckingWriter: Send + Sync {
    /// Writes one RTP packet. `on_delivered` may fire later from any thread,
    /// or never if the transport has no delivery signal.
    fn write_rtp_notify(
        &self,
        header: &rtp::header::Header,
        payload: &[u8],
        on_delivered: DeliveryCallback,
    ) -> Result<usize>;

    /// Current round trip time estimate of the connection.
    fn rtt(&self) -> Duration;
}

/// Write path wrapper that turns delivery notifications into feedback.
///
/// Every packet is timestamped, registered with the [`AckCollector`] and,
/// when telemetry is attached, recorded on the data-out stream before it is
/// handed to the transport. Transient write errors are logged and reported as
/// success; fatal ones are returned.
pub struct InstrumentedWriter<W> {
    transport: W,
    collector: AckCollector,
    telemetry: Option<TelemetryRecorder>,
}

impl<W: AckingWriter> InstrumentedWriter<W> {
    pub fn new(transport: W, collector: AckCollector) -> Self {
        Self {
            transport,
            collector,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryRecorder) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn transport(&self) -> &W {
        &self.transport
    }

    pub fn write_rtp(&self, header: &rtp::header::Header, payload: &[u8]) -> Result<usize> {
        let n = header.marshal_size() + payload.len();
        let send_time = Instant::now();
        let rtt = self.transport.rtt();

        if let Some(telemetry) = &self.telemetry {
            telemetry.observe_data_out(
                rtp::packet::Packet {
                    header: header.clone(),
                    payload: Bytes::copy_from_slice(payload),
                },
                send_time,
            );
        }

        let ack = self
            .collector
            .record_sent(header.ssrc, header.sequence_number, n, send_time);
        let on_delivered: DeliveryCallback =
            Box::new(move |delivered| ack.on_delivered(delivered, rtt));

        match self.transport.write_rtp_notify(header, payload, on_delivered) {
            Ok(written) => {
                trace!("wrote packet {} ({} bytes)", header.sequence_number, written);
                Ok(written)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!("failed to write to transport: {}", err);
                Ok(n)
            }
        }
    }
}
