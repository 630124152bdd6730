//! Socket listener publishing received datagrams onto a bounded queue.

use spanroute_packets::Transport;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One datagram as received from the wire. The listener never interprets the
/// bytes; parsing belongs to the dispatcher.
#[derive(Debug)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub peer: IpAddr,
}

/// Queue depth; sized for line-rate ICMP. When full the listener blocks
/// rather than dropping records.
const QUEUE_DEPTH: usize = 50;

/// Read deadline per receive attempt, independent of the probe timeout so
/// cancellation is observed promptly.
const READ_DEADLINE: Duration = Duration::from_secs(2);

const RECV_BUFFER_LEN: usize = 1500;

/// Spawns the blocking receive loop for one socket. Each attempt publishes a
/// record; deadline expiries surface as `Err` records the consumer discards.
/// The loop stops at the next deadline after cancellation and closes the
/// queue by dropping the sender.
pub fn spawn(
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) -> mpsc::Receiver<io::Result<Datagram>> {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            if cancel.is_cancelled() {
                return;
            }

            if let Err(err) = transport.set_read_timeout(READ_DEADLINE) {
                if tx.blocking_send(Err(err)).is_err() {
                    return;
                }
                continue;
            }

            let record = transport.recv_from(&mut buf).map(|(n, peer)| Datagram {
                payload: buf[..n].to_vec(),
                peer,
            });
            if tx.blocking_send(record).is_err() {
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Transport returning a fixed script of receive outcomes.
    struct ScriptedTransport {
        script: Mutex<Vec<io::Result<(Vec<u8>, IpAddr)>>>,
    }

    impl Transport for ScriptedTransport {
        fn set_read_timeout(&self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
            let mut script = self.script.lock().unwrap();
            match script.pop() {
                Some(Ok((bytes, peer))) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok((bytes.len(), peer))
                }
                Some(Err(err)) => Err(err),
                // Script exhausted; behave like an idle socket.
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "deadline"))
                }
            }
        }

        fn set_ttl(&self, _ttl: u32) -> io::Result<()> {
            Ok(())
        }

        fn send_to(&self, _buf: &[u8], _dst: IpAddr) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_listener_publishes_datagrams_and_errors() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(vec![
                Ok((vec![1, 2, 3], peer)),
                Err(io::Error::new(io::ErrorKind::WouldBlock, "deadline")),
            ]),
        });
        let cancel = CancellationToken::new();
        let mut rx = spawn(transport, cancel.clone());

        // Script pops from the back: deadline error first, then the datagram.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.unwrap_err().kind(), io::ErrorKind::WouldBlock);

        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.payload, vec![1, 2, 3]);
        assert_eq!(second.peer, peer);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_listener_stops_on_cancellation() {
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let mut rx = spawn(transport, cancel.clone());
        cancel.cancel();

        // Drain whatever was in flight; the channel must close.
        while let Some(record) = rx.recv().await {
            assert!(record.is_err());
        }
    }
}
