//! Socket control channel client.
//!
//! Sends each encoded path as one [`OpenRequest`] frame and waits for the
//! matching [`OpenReply`]. The stream sits behind a tokio `Mutex`, so
//! concurrent callers are serialized one call at a time; no ordering is
//! promised beyond that.
//!
//! A call dropped while waiting for its reply (e.g. under a timeout) leaves
//! that reply in the stream. Replies are read through a buffer that keeps
//! partial frames, and a reply older than the one awaited is discarded, so
//! the next call picks up where the stream stands. A call dropped part way
//! through writing its request, or a reply that cannot belong to any earlier
//! call, leaves the stream unusable: the channel is poisoned and every
//! further call fails with `ChannelLost`.

use super::protocol::{split_frame, write_frame, OpenReply, OpenRequest};
use super::{ControlChannel, NoopHandle, OpenOutcome};
use crate::config::ChannelConfig;
use crate::error::{KlnkError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    /// Set while a request is being written and left set if that write never
    /// finishes, or when the reply stream is out of step.
    poisoned: bool,
}

impl Connection {
    /// Next complete frame, or `None` once the server has closed the stream.
    /// Dropping this future never loses bytes already received.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = split_frame(&mut self.read_buf)? {
                return Ok(Some(frame));
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}

#[derive(Debug)]
pub struct SocketChannel {
    conn: Mutex<Connection>,
    addr: SocketAddr,
    next_seq: AtomicU64,
}

impl SocketChannel {
    /// Connect to a control server, bounded by the configured timeout.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let lost = || KlnkError::ChannelLost {
            endpoint: addr.to_string(),
        };
        let stream = tokio::time::timeout(ChannelConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| lost())?
            .map_err(|_| lost())?;

        debug!(target: "klnk::channel", "connected to control server {}", addr);

        Ok(Self {
            conn: Mutex::new(Connection {
                stream,
                read_buf: BytesMut::with_capacity(1024),
                poisoned: false,
            }),
            addr,
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the stream has been abandoned. A poisoned channel never
    /// recovers; connect a new one.
    pub async fn is_poisoned(&self) -> bool {
        self.conn.lock().await.poisoned
    }

    fn lost(&self) -> KlnkError {
        KlnkError::ChannelLost {
            endpoint: self.addr.to_string(),
        }
    }

    fn poison(&self, conn: &mut Connection, reason: &str) -> KlnkError {
        if !conn.poisoned {
            warn!(target: "klnk::channel", "control channel {} poisoned: {}", self.addr, reason);
        }
        conn.poisoned = true;
        self.lost()
    }
}

#[async_trait]
impl ControlChannel for SocketChannel {
    async fn open(&self, path: &str) -> Result<OpenOutcome> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let request_bytes = serde_json::to_vec(&OpenRequest::new(seq, path))?;

        let mut guard = self.conn.lock().await;
        let conn = &mut *guard;
        if conn.poisoned {
            return Err(self.lost());
        }

        // Stays set if this future is dropped mid-write.
        conn.poisoned = true;
        if write_frame(&mut conn.stream, &request_bytes).await.is_err() {
            return Err(self.poison(conn, "request write failed"));
        }
        conn.poisoned = false;

        let reply = loop {
            let frame = match conn.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(self.poison(conn, "server closed the stream")),
                Err(e) => return Err(self.poison(conn, &e.to_string())),
            };
            let reply: OpenReply = match serde_json::from_slice(&frame) {
                Ok(reply) => reply,
                Err(e) => return Err(self.poison(conn, &format!("unreadable reply: {}", e))),
            };
            if reply.seq < seq {
                debug!(
                    target: "klnk::channel",
                    "dropping reply {} left by an abandoned call", reply.seq
                );
                continue;
            }
            if reply.seq != seq {
                return Err(self.poison(
                    conn,
                    &format!("reply for {} while waiting for {}", reply.seq, seq),
                ));
            }
            break reply;
        };

        if reply.version != ChannelConfig::PROTOCOL_VERSION {
            return Err(KlnkError::VersionMismatch {
                expected: ChannelConfig::PROTOCOL_VERSION,
                actual: reply.version,
            });
        }

        Ok(match reply.code {
            0 => OpenOutcome::Opened(Box::new(NoopHandle)),
            code => OpenOutcome::Failed(code),
        })
    }

    fn describe(&self) -> String {
        format!("socket {}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::server::{ControlBackend, ControlServer};
    use std::sync::Arc;

    /// Answers with the number of underscores in the path, or 0 for "ok" paths.
    struct CountingBackend;

    #[async_trait::async_trait]
    impl ControlBackend for CountingBackend {
        async fn open(&self, path: &str) -> i32 {
            if path.ends_with("/ok") {
                0
            } else {
                path.matches('_').count() as i32
            }
        }
    }

    #[tokio::test]
    async fn test_open_success_and_failure() {
        let mut handle = ControlServer::start(Arc::new(CountingBackend)).await.unwrap();
        let channel = SocketChannel::connect(handle.addr()).await.unwrap();

        match channel.open("/vhub/mnt/klnk/ok").await.unwrap() {
            OpenOutcome::Opened(h) => h.close().await.unwrap(),
            OpenOutcome::Failed(code) => panic!("unexpected code {}", code),
        }
        assert!(matches!(
            channel.open("/vhub/mnt/klnk/1_2_3_4_5_6_7_8_9").await.unwrap(),
            OpenOutcome::Failed(8)
        ));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_answers() {
        let mut handle = ControlServer::start(Arc::new(CountingBackend)).await.unwrap();
        let channel = Arc::new(SocketChannel::connect(handle.addr()).await.unwrap());

        let calls = (1..=8).map(|n| {
            let channel = channel.clone();
            async move {
                let path = format!("/p/{}", "_".repeat(n));
                match channel.open(&path).await.unwrap() {
                    OpenOutcome::Failed(code) => assert_eq!(code, n as i32),
                    OpenOutcome::Opened(_) => panic!("expected failure"),
                }
            }
        });
        futures::future::join_all(calls).await;

        handle.shutdown();
    }

    /// Like `CountingBackend`, but the first call takes a while to answer.
    struct SlowFirstBackend {
        answered: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ControlBackend for SlowFirstBackend {
        async fn open(&self, path: &str) -> i32 {
            if !self.answered.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            }
            CountingBackend.open(path).await
        }
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_break_the_next() {
        let backend = SlowFirstBackend {
            answered: std::sync::atomic::AtomicBool::new(false),
        };
        let mut handle = ControlServer::start(Arc::new(backend)).await.unwrap();
        let channel = SocketChannel::connect(handle.addr()).await.unwrap();

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            channel.open("/p/_"),
        )
        .await;
        assert!(abandoned.is_err(), "first call should time out");

        for n in 2..=4 {
            let path = format!("/p/{}", "_".repeat(n));
            match channel.open(&path).await.unwrap() {
                OpenOutcome::Failed(code) => assert_eq!(code, n as i32),
                OpenOutcome::Opened(_) => panic!("expected failure"),
            }
        }
        assert!(!channel.is_poisoned().await);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_out_of_step_reply_poisons_channel() {
        use crate::channel::protocol::read_frame;

        // A server that answers every request with a sequence number from the future.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            while let Ok(Some(frame)) = read_frame(&mut reader).await {
                let request: OpenRequest = serde_json::from_slice(&frame).unwrap();
                let reply = serde_json::to_vec(&OpenReply::new(request.seq + 5, 0)).unwrap();
                if write_frame(&mut writer, &reply).await.is_err() {
                    break;
                }
            }
        });

        let channel = SocketChannel::connect(addr).await.unwrap();
        assert!(matches!(
            channel.open("/ok").await,
            Err(KlnkError::ChannelLost { .. })
        ));
        assert!(channel.is_poisoned().await);
        assert!(matches!(
            channel.open("/ok").await,
            Err(KlnkError::ChannelLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_to_dead_server_returns_channel_lost() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        match SocketChannel::connect(addr).await {
            Err(KlnkError::ChannelLost { endpoint }) => assert_eq!(endpoint, "127.0.0.1:1"),
            other => panic!("expected ChannelLost, got {:?}", other.map(|c| c.addr())),
        }
    }

    #[tokio::test]
    async fn test_detects_server_shutdown() {
        let mut handle = ControlServer::start(Arc::new(CountingBackend)).await.unwrap();
        let channel = SocketChannel::connect(handle.addr()).await.unwrap();
        assert!(channel.open("/ok").await.is_ok());

        handle.shutdown();

        let mut detected = false;
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if channel.open("/ok").await.is_err() {
                detected = true;
                break;
            }
        }
        assert!(detected, "channel should notice the server going away");
    }
}
