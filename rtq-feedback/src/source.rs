use crate::error::Result;
use crate::packet::parse_data;
use crate::writer::{AckingWriter, InstrumentedWriter};
use log::warn;
use std::sync::Arc;

/// Control surface of the media pipeline producing the packets.
pub trait MediaSource: Send + Sync {
    /// Reconfigures the encoder's target rate, in kbit/s.
    fn set_bitrate(&self, kbps: u32);

    /// Stops producing packets.
    fn stop(&self);
}

/// Entry point for the raw RTP packets a media source produces.
///
/// A fatal write error stops the source through the handle given at
/// construction.
pub struct SourceWriter<W> {
    writer: InstrumentedWriter<W>,
    source: Arc<dyn MediaSource>,
}

impl<W: AckingWriter> SourceWriter<W> {
    pub fn new(writer: InstrumentedWriter<W>, source: Arc<dyn MediaSource>) -> Self {
        Self { writer, source }
    }

    pub fn writer(&self) -> &InstrumentedWriter<W> {
        &self.writer
    }

    pub fn write(&self, raw: &[u8]) -> Result<usize> {
        let packet = parse_data(raw)?;
        self.writer
            .write_rtp(&packet.header, &packet.payload)
            .inspect_err(|err| {
                warn!("failed to write packet: {}, stopping source", err);
                self.source.stop();
            })
    }
}
