//! rtq-sender streams synthetic RTP video to a UDP receiver.
//!
//! Every packet sent and every feedback packet received is logged to the
//! telemetry sinks, and RFC 8888 feedback is inferred from delivery
//! notifications. On exit the receiver gets an `eos` datagram.
//!
//! Inferred reports share the read path of received feedback, so each one is
//! logged twice: as `out:` when generated and as `in:` when read back.

mod source;
mod udp;

use anyhow::Result;
use clap::Parser;
use env_logger::Target;
use feedback::{
    AckCollectorBuilder, CcfbReceptionModel, FeedbackReader, InstrumentedWriter, MediaSource,
    SourceWriter, TelemetryRecorderBuilder, TelemetrySinks, TimeBase,
};
use log::{error, info};
use source::SyntheticSource;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use udp::UdpTransport;

const FEEDBACK_QUEUE: usize = 256;

#[derive(Parser)]
#[command(name = "rtq-sender")]
#[command(version = "0.1.0")]
#[command(about = "Sends synthetic RTP video over UDP and logs packet telemetry")]
struct Cli {
    /// Receiver address.
    #[arg(env = "RECEIVER", default_value = "127.0.0.1:4242")]
    addr: SocketAddr,
    #[arg(short, long, default_value_t = format!("INFO"))]
    log_level: String,
    #[arg(short, long, env = "LOG_FILE", default_value_t = format!(""))]
    output_log_file: String,
    /// Incoming RTCP log, stdout if unset.
    #[arg(long)]
    rtcp_in_log: Option<PathBuf>,
    /// Outgoing RTCP log, stdout if unset.
    #[arg(long)]
    rtcp_out_log: Option<PathBuf>,
    /// Incoming RTP log, stdout if unset.
    #[arg(long)]
    rtp_in_log: Option<PathBuf>,
    /// Outgoing RTP log, stdout if unset.
    #[arg(long)]
    rtp_out_log: Option<PathBuf>,
    /// Stream length in seconds.
    #[arg(short, long, default_value_t = 30)]
    duration: u64,
    /// Initial source bitrate in kbit/s.
    #[arg(short, long, default_value_t = 1000)]
    bitrate: u32,
    /// Feedback cycle length in milliseconds.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    feedback_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;

    env_logger::Builder::new()
        .target(if !cli.output_log_file.is_empty() {
            Target::Pipe(Box::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&cli.output_log_file)?,
            ))
        } else {
            Target::Stderr
        })
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%6f"),
                record.args()
            )
        })
        .filter(None, log_level)
        .init();

    run(cli).await
}

fn open_sink(path: Option<&PathBuf>) -> io::Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout()),
    })
}

async fn run(cli: Cli) -> Result<()> {
    let telemetry = TelemetryRecorderBuilder::new().build(TelemetrySinks::new(
        open_sink(cli.rtcp_in_log.as_ref())?,
        open_sink(cli.rtcp_out_log.as_ref())?,
        open_sink(cli.rtp_in_log.as_ref())?,
        open_sink(cli.rtp_out_log.as_ref())?,
    ));

    let transport = UdpTransport::connect(cli.addr).await?;
    let (stop_tx, stop_rx) = watch::channel(false);

    // received and inferred feedback share one read path
    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_QUEUE);
    transport.spawn_reader(feedback_tx.clone(), stop_rx.clone());
    let collector = AckCollectorBuilder::new()
        .with_interval(Duration::from_millis(cli.feedback_interval))
        .with_telemetry(telemetry.clone())
        .build(CcfbReceptionModel::default(), TimeBase::new(), feedback_tx);
    let reader = tokio::spawn(
        FeedbackReader::new(feedback_rx)
            .with_telemetry(telemetry.clone())
            .run(stop_rx),
    );

    let source = Arc::new(SyntheticSource::new(cli.bitrate));
    let writer = SourceWriter::new(
        InstrumentedWriter::new(transport.clone(), collector.clone())
            .with_telemetry(telemetry.clone()),
        source.clone(),
    );
    let duration = Duration::from_secs(cli.duration);
    let producer_source = Arc::clone(&source);
    let mut producer =
        tokio::spawn(async move { producer_source.produce(&writer, duration).await });

    info!("streaming to {} for {}s", cli.addr, cli.duration);
    let produced = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            source.stop();
            producer.await
        }
        res = &mut producer => res,
    };
    if let Err(err) = produced? {
        error!("source stopped: {}", err);
    }

    source.stop();
    collector.close();
    stop_tx.send_replace(true);
    if let Err(err) = reader.await? {
        error!("feedback reader stopped: {}", err);
    }
    telemetry.close().await;
    transport.close().await?;
    info!("sender exited");
    Ok(())
}
