// Copyright 2022 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Yamux v0 stream multiplexing: flow-controlled bidirectional streams over
//! a single byte pipe, with keepalives.

mod frame;
mod session;
mod stream;

pub use frame::{go_away, DEFAULT_WINDOW};
pub use session::Session;
pub use stream::Stream;

use peerlink_core::{
    io::BoxPipe,
    muxing::{Role, StreamMuxer},
    upgrader::MuxerUpgrade,
};
use std::{sync::Arc, time::Duration};

pub const PROTOCOL_NAME: &str = "/yamux/1.0.0";

/// The largest receive window a stream may advertise.
pub const MAX_WINDOW: u32 = 1024 * 1024;

/// Yamux session configuration; implements the muxer upgrade so it can be
/// handed straight to the connection upgrader.
#[derive(Clone, Debug)]
pub struct Config {
    /// Per-stream receive window, between [`DEFAULT_WINDOW`] and
    /// [`MAX_WINDOW`].
    pub receive_window: u32,
    /// Streams allowed concurrently per session, both directions combined.
    pub max_concurrent_streams: usize,
    /// Keepalive ping interval, `None` to disable. Two missed intervals
    /// terminate the session.
    pub keepalive_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            receive_window: DEFAULT_WINDOW,
            max_concurrent_streams: 512,
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl Config {
    pub fn with_receive_window(mut self, window: u32) -> Self {
        self.receive_window = window.clamp(DEFAULT_WINDOW, MAX_WINDOW);
        self
    }

    pub fn with_max_concurrent_streams(mut self, max: usize) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

impl MuxerUpgrade for Config {
    fn protocol_name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn upgrade(&self, pipe: BoxPipe, role: Role) -> Arc<dyn StreamMuxer> {
        Arc::new(Session::new(pipe, role, self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::muxing::MuxerError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair(config: Config) -> (Session, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Session::new(Box::new(a), Role::Initiator, config.clone()),
            Session::new(Box::new(b), Role::Responder, config),
        )
    }

    fn quiet_config() -> Config {
        Config::default().with_keepalive_interval(None)
    }

    #[tokio::test]
    async fn echo_roundtrip() {
        let (client, server) = session_pair(quiet_config());
        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
            buf
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        assert_eq!(&server_task.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn half_close_is_independent() {
        let (client, server) = session_pair(quiet_config());
        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = Vec::new();
            // Client half-closes after writing; we must still be able to
            // answer on our own direction.
            stream.read_to_end(&mut buf).await.unwrap();
            stream.write_all(b"reply").await.unwrap();
            stream.shutdown().await.unwrap();
            buf
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"request").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"reply");
        assert_eq!(server_task.await.unwrap(), b"request");
    }

    #[tokio::test]
    async fn reset_is_not_eof() {
        let (client, server) = session_pair(quiet_config());
        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = [0u8; 16];
            stream.read(&mut buf).await
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.reset();
        let err = server_task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn stream_limit_enforced() {
        let (client, _server) =
            session_pair(quiet_config().with_max_concurrent_streams(2));
        let _a = client.open_stream().await.unwrap();
        let _b = client.open_stream().await.unwrap();
        assert!(matches!(
            client.open_stream().await,
            Err(MuxerError::StreamLimitExceeded)
        ));
    }

    #[tokio::test]
    async fn transfer_larger_than_window() {
        let (client, server) = session_pair(quiet_config());
        let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| i as u8).collect();
        let expected = payload.clone();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
        let received = server_task.await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);
        // Keep the handle alive until the receiver has drained everything.
        drop(stream);
    }

    #[tokio::test]
    async fn receive_window_violation_is_fatal() {
        use crate::frame::{flags, FrameType, Header};
        let (raw, b) = tokio::io::duplex(1024 * 1024);
        let session = Session::new(Box::new(b), Role::Responder, quiet_config());
        let mut raw = raw;

        // Open stream 1, then send more data than the default window allows
        // in one frame without ever receiving an update.
        let syn = Header::new(FrameType::WindowUpdate, flags::SYN, 1, 0);
        raw.write_all(&syn.encode()).await.unwrap();
        let oversized = Header::new(FrameType::Data, 0, 1, DEFAULT_WINDOW + 1);
        raw.write_all(&oversized.encode()).await.unwrap();
        raw.write_all(&vec![0u8; DEFAULT_WINDOW as usize + 1])
            .await
            .unwrap();

        let accepted = session.accept_stream().await.unwrap();
        let mut stream = accepted;
        let mut buf = vec![0u8; 16];
        // The violation tears the session down; the stream ends in reset.
        let err = loop {
            match stream.read(&mut buf).await {
                Ok(0) => panic!("expected reset, got eof"),
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn keepalive_timeout_kills_session() {
        let config = Config::default()
            .with_keepalive_interval(Some(Duration::from_millis(30)));
        let (_raw, b) = tokio::io::duplex(64 * 1024);
        let session = Session::new(Box::new(b), Role::Responder, config);
        // Nobody answers the pings on the raw end.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(session.is_closed());
        assert!(matches!(
            session.open_stream().await,
            Err(MuxerError::KeepaliveTimeout)
        ));
    }

    #[tokio::test]
    async fn close_refuses_new_streams_remotely() {
        let (client, server) = session_pair(quiet_config());
        client.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            server.open_stream().await,
            Err(MuxerError::Closed)
        ));
    }
}
