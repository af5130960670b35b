use bytes::{Bytes, BytesMut};
use feedback::{AckingWriter, DeliveryCallback, Error, Result};
use log::{debug, trace, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use util::marshal::{Marshal, MarshalSize};

const RECEIVE_MTU: usize = 1500;

/// Datagram telling the receiver that the stream is over.
const END_OF_STREAM: &[u8] = b"eos";

/// RTP over a connected UDP socket.
///
/// UDP has no delivery signal, so delivery callbacks are dropped unfired and
/// the round trip time is unknown.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn connect(remote: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        // writes go through try_send, which needs readiness to be known
        socket.writable().await?;
        debug!("udp transport {} -> {}", socket.local_addr()?, remote);
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Forwards every datagram read from the socket to `feedback` until `stop` is set.
    pub fn spawn_reader(&self, feedback: mpsc::Sender<Bytes>, mut stop: watch::Receiver<bool>) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECEIVE_MTU];
            loop {
                tokio::select! {
                    res = socket.recv(&mut buf) => match res {
                        Ok(n) => {
                            trace!("socket read {} bytes", n);
                            if feedback.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            let err = Error::from(err);
                            if err.is_fatal() {
                                warn!("socket read error {}", err);
                                break;
                            }
                            trace!("socket read error {}", err);
                        }
                    },
                    res = stop.changed() => {
                        if res.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("udp reader stopped");
        });
    }

    /// Signals end of stream to the receiver.
    pub async fn close(&self) -> Result<()> {
        self.socket.send(END_OF_STREAM).await?;
        Ok(())
    }
}

impl AckingWriter for UdpTransport {
    fn write_rtp_notify(
        &self,
        header: &rtp::header::Header,
        payload: &[u8],
        _on_delivered: DeliveryCallback,
    ) -> Result<usize> {
        let mut buf = BytesMut::with_capacity(header.marshal_size() + payload.len());
        buf.resize(header.marshal_size(), 0);
        header
            .marshal_to(&mut buf)
            .map_err(|err| Error::MalformedData(err.to_string()))?;
        buf.extend_from_slice(payload);

        Ok(self.socket.try_send(&buf)?)
    }

    fn rtt(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_sends_one_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::connect(receiver.local_addr().unwrap())
            .await
            .unwrap();

        let header = rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: 7,
            ..Default::default()
        };
        let n = transport
            .write_rtp_notify(&header, &[1, 2, 3], Box::new(|_| {}))
            .unwrap();
        assert_eq!(n, 15);

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).await.unwrap();
        let packet = feedback::packet::parse_data(&buf[..n]).unwrap();
        assert_eq!(packet.header.sequence_number, 7);
        assert_eq!(&packet.payload[..], &[1, 2, 3]);

        transport.close().await.unwrap();
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], END_OF_STREAM);
    }

    #[tokio::test]
    async fn test_reader_forwards_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::connect(peer.local_addr().unwrap())
            .await
            .unwrap();
        let (feedback_tx, mut feedback_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        transport.spawn_reader(feedback_tx, stop_rx);

        let port = transport.socket.local_addr().unwrap().port();
        peer.send_to(b"feedback", ("127.0.0.1", port)).await.unwrap();
        assert_eq!(
            feedback_rx.recv().await.unwrap(),
            Bytes::from_static(b"feedback")
        );
    }

    #[tokio::test]
    async fn test_reader_stops_on_signal() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::connect(peer.local_addr().unwrap())
            .await
            .unwrap();
        let (feedback_tx, mut feedback_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        transport.spawn_reader(feedback_tx, stop_rx);

        stop_tx.send_replace(true);
        // the task drops its sender on exit
        let end = tokio::time::timeout(Duration::from_secs(5), feedback_rx.recv()).await;
        assert_eq!(end.unwrap(), None);
    }
}
