//! Telemetry recorder - serializes packet observations into four log sinks.

use super::{Direction, data_line, feedback_line};
use crate::packet::{FeedbackPacket, TimestampedEvent};
use log::{debug, trace, warn};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

/// Default number of events queued per stream.
const DEFAULT_CAPACITY: usize = 1024;

type FeedbackEvent = TimestampedEvent<FeedbackPacket>;
type DataEvent = TimestampedEvent<rtp::packet::Packet>;

/// The four destinations of a [`TelemetryRecorder`].
///
/// Sinks are written synchronously from the recorder's tokio task, so a sink
/// that blocks (a stalled pipe, a slow disk) also blocks that worker thread.
/// Buffer file sinks with [`std::io::BufWriter`]; queued lines are flushed on
/// close.
pub struct TelemetrySinks {
    pub feedback_in: Box<dyn Write + Send>,
    pub feedback_out: Box<dyn Write + Send>,
    pub data_in: Box<dyn Write + Send>,
    pub data_out: Box<dyn Write + Send>,
}

impl TelemetrySinks {
    pub fn new(
        feedback_in: Box<dyn Write + Send>,
        feedback_out: Box<dyn Write + Send>,
        data_in: Box<dyn Write + Send>,
        data_out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            feedback_in,
            feedback_out,
            data_in,
            data_out,
        }
    }

    /// All four streams to standard output.
    pub fn stdout() -> Self {
        Self::new(
            Box::new(io::stdout()),
            Box::new(io::stdout()),
            Box::new(io::stdout()),
            Box::new(io::stdout()),
        )
    }
}

/// Builder for the [`TelemetryRecorder`].
pub struct TelemetryRecorderBuilder {
    capacity: usize,
}

impl Default for TelemetryRecorderBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl TelemetryRecorderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many events each stream buffers before new events are dropped.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Spawns the writer loop on the current tokio runtime.
    pub fn build(self, sinks: TelemetrySinks) -> TelemetryRecorder {
        let start = Instant::now();
        let (feedback_in_tx, feedback_in_rx) = mpsc::channel(self.capacity);
        let (feedback_out_tx, feedback_out_rx) = mpsc::channel(self.capacity);
        let (data_in_tx, data_in_rx) = mpsc::channel(self.capacity);
        let (data_out_tx, data_out_rx) = mpsc::channel(self.capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let writer = SinkWriter {
            start,
            sinks,
            feedback_in: feedback_in_rx,
            feedback_out: feedback_out_rx,
            data_in: data_in_rx,
            data_out: data_out_rx,
        };
        tokio::spawn(writer.run(stop_rx, done_tx));

        TelemetryRecorder {
            inner: Arc::new(Inner {
                start,
                feedback_in: feedback_in_tx,
                feedback_out: feedback_out_tx,
                data_in: data_in_tx,
                data_out: data_out_tx,
                stop: stop_tx,
                done: done_rx,
            }),
        }
    }
}

struct Inner {
    start: Instant,
    feedback_in: mpsc::Sender<FeedbackEvent>,
    feedback_out: mpsc::Sender<FeedbackEvent>,
    data_in: mpsc::Sender<DataEvent>,
    data_out: mpsc::Sender<DataEvent>,
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// Records packet observations without blocking the caller.
///
/// Each `observe_*` call queues the event on its own bounded stream and
/// returns immediately; a full stream drops the event. A single task writes
/// the events out, in order per stream. Cloning is cheap.
#[derive(Clone)]
pub struct TelemetryRecorder {
    inner: Arc<Inner>,
}

impl TelemetryRecorder {
    /// The instant the `<ms>` column is measured from.
    pub fn start(&self) -> Instant {
        self.inner.start
    }

    pub fn observe_feedback_in(&self, packet: FeedbackPacket, at: Instant) {
        enqueue(&self.inner.feedback_in, TimestampedEvent::new(packet, at), "feedback in");
    }

    pub fn observe_feedback_out(&self, packet: FeedbackPacket, at: Instant) {
        enqueue(&self.inner.feedback_out, TimestampedEvent::new(packet, at), "feedback out");
    }

    pub fn observe_data_in(&self, packet: rtp::packet::Packet, at: Instant) {
        enqueue(&self.inner.data_in, TimestampedEvent::new(packet, at), "data in");
    }

    pub fn observe_data_out(&self, packet: rtp::packet::Packet, at: Instant) {
        enqueue(&self.inner.data_out, TimestampedEvent::new(packet, at), "data out");
    }

    /// Stops the writer loop and waits until it has written out what was queued.
    ///
    /// Safe to call any number of times, from any number of tasks; all calls
    /// return once the loop has exited.
    pub async fn close(&self) {
        let requested = self.inner.stop.send_if_modified(|stop| {
            if *stop {
                false
            } else {
                *stop = true;
                true
            }
        });
        if requested {
            debug!("telemetry recorder close requested");
        }

        let mut done = self.inner.done.clone();
        if done.wait_for(|done| *done).await.is_err() {
            warn!("telemetry writer exited without signalling completion");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.done.borrow()
    }
}

fn enqueue<T>(stream: &mpsc::Sender<T>, event: T, name: &str) {
    match stream.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("telemetry {} queue full, dropping event", name),
        Err(TrySendError::Closed(_)) => {
            trace!("telemetry recorder closed, dropping {} event", name)
        }
    }
}

/// Consumer side; owns the sinks exclusively.
struct SinkWriter {
    start: Instant,
    sinks: TelemetrySinks,
    feedback_in: mpsc::Receiver<FeedbackEvent>,
    feedback_out: mpsc::Receiver<FeedbackEvent>,
    data_in: mpsc::Receiver<DataEvent>,
    data_out: mpsc::Receiver<DataEvent>,
}

impl SinkWriter {
    async fn run(mut self, mut stop: watch::Receiver<bool>, done: watch::Sender<bool>) {
        loop {
            tokio::select! {
                Some(event) = self.feedback_in.recv() => {
                    self.write_feedback(Direction::In, event)
                }
                Some(event) = self.feedback_out.recv() => {
                    self.write_feedback(Direction::Out, event)
                }
                Some(event) = self.data_in.recv() => self.write_data(Direction::In, event),
                Some(event) = self.data_out.recv() => self.write_data(Direction::Out, event),
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain();
        for sink in [
            &mut self.sinks.feedback_in,
            &mut self.sinks.feedback_out,
            &mut self.sinks.data_in,
            &mut self.sinks.data_out,
        ] {
            if let Err(err) = sink.flush() {
                warn!("could not flush telemetry sink: {}", err);
            }
        }
        debug!("telemetry writer stopped");
        done.send_replace(true);
    }

    /// Writes out events queued before the stop request.
    fn drain(&mut self) {
        while let Ok(event) = self.feedback_in.try_recv() {
            self.write_feedback(Direction::In, event);
        }
        while let Ok(event) = self.feedback_out.try_recv() {
            self.write_feedback(Direction::Out, event);
        }
        while let Ok(event) = self.data_in.try_recv() {
            self.write_data(Direction::In, event);
        }
        while let Ok(event) = self.data_out.try_recv() {
            self.write_data(Direction::Out, event);
        }
    }

    fn write_feedback(&mut self, direction: Direction, event: FeedbackEvent) {
        let elapsed = event.observed_at.saturating_duration_since(self.start);
        let line = feedback_line(direction, elapsed, &event.payload);
        let sink = match direction {
            Direction::In => &mut self.sinks.feedback_in,
            Direction::Out => &mut self.sinks.feedback_out,
        };
        if let Err(err) = sink.write_all(line.as_bytes()) {
            warn!("could not dump RTCP packet: {}", err);
        }
    }

    fn write_data(&mut self, direction: Direction, event: DataEvent) {
        let elapsed = event.observed_at.saturating_duration_since(self.start);
        let line = data_line(direction, elapsed, &event.payload);
        let sink = match direction {
            Direction::In => &mut self.sinks.data_in,
            Direction::Out => &mut self.sinks.data_out,
        };
        if let Err(err) = sink.write_all(line.as_bytes()) {
            warn!("could not dump RTP packet: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcp::receiver_report::ReceiverReport;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    fn rtp_packet(sequence_number: u16) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                ssrc: 0x1234,
                sequence_number,
                timestamp: 3000,
                ..Default::default()
            },
            payload: vec![0u8; 10].into(),
        }
    }

    fn shared_sinks() -> ([SharedSink; 4], TelemetrySinks) {
        let sinks: [SharedSink; 4] = Default::default();
        let telemetry_sinks = TelemetrySinks::new(
            Box::new(sinks[0].clone()),
            Box::new(sinks[1].clone()),
            Box::new(sinks[2].clone()),
            Box::new(sinks[3].clone()),
        );
        (sinks, telemetry_sinks)
    }

    #[tokio::test]
    async fn test_recorder_routes_each_stream_to_its_sink() {
        let ([fb_in, fb_out, data_in, data_out], sinks) = shared_sinks();
        let recorder = TelemetryRecorderBuilder::new().build(sinks);
        let at = recorder.start() + Duration::from_millis(25);

        recorder.observe_feedback_in(Box::new(ReceiverReport::default()), at);
        recorder.observe_feedback_out(Box::new(rtcp::goodbye::Goodbye::default()), at);
        recorder.observe_data_in(rtp_packet(1), at);
        for seq in 10..13 {
            recorder.observe_data_out(rtp_packet(seq), at);
        }
        recorder.close().await;

        assert_eq!(fb_in.contents(), "in:\tRTCP\t25\tReceiverReport\n");
        assert_eq!(fb_out.contents(), "out:\tRTCP\t25\tGoodbye\n");
        assert_eq!(data_in.contents(), "in:\tRTP\t25\t96\t1234\t1\t3000\t0\t10\n");
        assert_eq!(
            data_out.contents(),
            "out:\tRTP\t25\t96\t1234\t10\t3000\t0\t10\n\
             out:\tRTP\t25\t96\t1234\t11\t3000\t0\t10\n\
             out:\tRTP\t25\t96\t1234\t12\t3000\t0\t10\n"
        );
    }

    #[tokio::test]
    async fn test_recorder_close_twice_concurrently() {
        let (_, sinks) = shared_sinks();
        let recorder = TelemetryRecorderBuilder::new().build(sinks);
        let other = recorder.clone();

        tokio::join!(recorder.close(), other.close());
        assert!(recorder.is_closed());

        // and once more after completion
        recorder.close().await;
    }

    #[tokio::test]
    async fn test_broken_sink_does_not_stop_recorder() {
        let (sinks, _) = shared_sinks();
        let recorder = TelemetryRecorderBuilder::new().build(TelemetrySinks::new(
            Box::new(BrokenSink),
            Box::new(sinks[1].clone()),
            Box::new(sinks[2].clone()),
            Box::new(sinks[3].clone()),
        ));
        let at = recorder.start();

        recorder.observe_feedback_in(Box::new(ReceiverReport::default()), at);
        recorder.observe_data_out(rtp_packet(7), at);
        recorder.close().await;

        assert_eq!(sinks[3].contents(), "out:\tRTP\t0\t96\t1234\t7\t3000\t0\t10\n");
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (sinks, telemetry_sinks) = shared_sinks();
        let recorder = TelemetryRecorderBuilder::new()
            .with_capacity(2)
            .build(telemetry_sinks);
        let at = recorder.start();

        // the writer task cannot run before the next await point
        for seq in 0..5 {
            recorder.observe_data_out(rtp_packet(seq), at);
        }
        recorder.close().await;

        assert_eq!(sinks[3].contents().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_observe_after_close_is_ignored() {
        let (sinks, telemetry_sinks) = shared_sinks();
        let recorder = TelemetryRecorderBuilder::new().build(telemetry_sinks);
        recorder.close().await;

        recorder.observe_data_in(rtp_packet(1), recorder.start());
        assert!(sinks[2].contents().is_empty());
    }
}
