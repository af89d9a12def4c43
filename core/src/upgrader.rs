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

//! Turning a raw byte pipe into a secured, multiplexed connection.
//!
//! The upgrade runs in two negotiated phases: multistream-select picks a
//! security protocol and the handshake runs over the raw pipe; then
//! multistream-select runs again over the secured pipe to pick a muxer.
//! As an optimization the initiator may pipeline the muxer proposal
//! behind the final handshake bytes (`V1Lazy`); responders accept both
//! forms because the listener side of the negotiation is oblivious to
//! when proposals were flushed.

use crate::{
    io::BoxPipe,
    muxing::{MuxerError, Role, StreamMuxer},
};
use async_trait::async_trait;
use peerlink_identity::PeerId;
use peerlink_multistream_select::{self as multistream, NegotiationError, Version};
use std::{sync::Arc, time::Duration};

/// A security protocol that can be negotiated during upgrade.
#[async_trait]
pub trait SecurityUpgrade: Send + Sync {
    /// The multistream protocol name, e.g. `/noise`.
    fn protocol_name(&self) -> &'static str;

    /// Run the handshake as the initiator. `expected` is the peer id the
    /// dialer believes it is connecting to, if any; implementations fail
    /// with [`UpgradeError::PeerIdMismatch`] when the authenticated identity
    /// differs.
    async fn secure_outbound(
        &self,
        pipe: BoxPipe,
        expected: Option<PeerId>,
    ) -> Result<(PeerId, BoxPipe), UpgradeError>;

    /// Run the handshake as the responder.
    async fn secure_inbound(&self, pipe: BoxPipe) -> Result<(PeerId, BoxPipe), UpgradeError>;
}

/// A stream multiplexer that can be negotiated during upgrade.
pub trait MuxerUpgrade: Send + Sync {
    /// The multistream protocol name, e.g. `/yamux/1.0.0`.
    fn protocol_name(&self) -> &'static str;

    /// Start a muxing session over the secured pipe.
    fn upgrade(&self, pipe: BoxPipe, role: Role) -> Arc<dyn StreamMuxer>;
}

/// Metadata about how a connection came to be, recorded on success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub transport: &'static str,
    pub security: String,
    pub muxer: String,
    pub used_early_mux_negotiation: bool,
}

/// The outcome of a successful upgrade.
pub struct Upgraded {
    pub peer: PeerId,
    pub muxer: Arc<dyn StreamMuxer>,
    pub info: ConnectionInfo,
}

/// Negotiates security and muxing over fresh pipes.
#[derive(Clone)]
pub struct Upgrader {
    security: Arc<[Arc<dyn SecurityUpgrade>]>,
    muxers: Arc<[Arc<dyn MuxerUpgrade>]>,
    /// Deadline for the whole upgrade, handshake included.
    pub handshake_timeout: Duration,
    /// Whether outbound upgrades pipeline the muxer proposal.
    pub early_mux_negotiation: bool,
}

impl Upgrader {
    pub fn new(
        security: Vec<Arc<dyn SecurityUpgrade>>,
        muxers: Vec<Arc<dyn MuxerUpgrade>>,
    ) -> Self {
        assert!(!security.is_empty(), "at least one security protocol");
        assert!(!muxers.is_empty(), "at least one muxer");
        Upgrader {
            security: security.into(),
            muxers: muxers.into(),
            handshake_timeout: Duration::from_secs(60),
            early_mux_negotiation: true,
        }
    }

    /// Upgrade a pipe we dialed.
    pub async fn upgrade_outbound(
        &self,
        pipe: BoxPipe,
        transport: &'static str,
        expected_peer: Option<PeerId>,
    ) -> Result<Upgraded, UpgradeError> {
        tokio::time::timeout(
            self.handshake_timeout,
            self.upgrade_outbound_inner(pipe, transport, expected_peer),
        )
        .await
        .map_err(|_| UpgradeError::HandshakeTimeout)?
    }

    async fn upgrade_outbound_inner(
        &self,
        mut pipe: BoxPipe,
        transport: &'static str,
        expected_peer: Option<PeerId>,
    ) -> Result<Upgraded, UpgradeError> {
        let security_names: Vec<&str> =
            self.security.iter().map(|s| s.protocol_name()).collect();
        let security_name = multistream::dialer_select(&mut pipe, security_names, Version::V1)
            .await?;
        let security = self
            .security
            .iter()
            .find(|s| s.protocol_name() == security_name)
            .expect("negotiated protocol comes from our own set")
            .clone();

        let (peer, mut secured) = security.secure_outbound(pipe, expected_peer).await?;

        let version = if self.early_mux_negotiation {
            Version::V1Lazy
        } else {
            Version::V1
        };
        let muxer_name = match version {
            // The lazy flavour proposes only one protocol; propose our
            // preferred muxer and fall back to nothing.
            Version::V1Lazy => {
                multistream::dialer_select(
                    &mut secured,
                    [self.muxers[0].protocol_name()],
                    Version::V1Lazy,
                )
                .await?
            }
            Version::V1 => {
                let muxer_names: Vec<&str> =
                    self.muxers.iter().map(|m| m.protocol_name()).collect();
                multistream::dialer_select(&mut secured, muxer_names, Version::V1).await?
            }
        };
        let muxer_upgrade = self
            .muxers
            .iter()
            .find(|m| m.protocol_name() == muxer_name)
            .expect("negotiated protocol comes from our own set");

        let muxer = muxer_upgrade.upgrade(secured, Role::Initiator);
        log::debug!("outbound upgrade complete: peer={peer} security={security_name} muxer={muxer_name}");
        Ok(Upgraded {
            peer,
            muxer,
            info: ConnectionInfo {
                transport,
                security: security_name,
                muxer: muxer_name,
                used_early_mux_negotiation: version == Version::V1Lazy,
            },
        })
    }

    /// Upgrade a pipe accepted from a listener.
    pub async fn upgrade_inbound(
        &self,
        pipe: BoxPipe,
        transport: &'static str,
    ) -> Result<Upgraded, UpgradeError> {
        tokio::time::timeout(
            self.handshake_timeout,
            self.upgrade_inbound_inner(pipe, transport),
        )
        .await
        .map_err(|_| UpgradeError::HandshakeTimeout)?
    }

    async fn upgrade_inbound_inner(
        &self,
        mut pipe: BoxPipe,
        transport: &'static str,
    ) -> Result<Upgraded, UpgradeError> {
        let security_names: Vec<&str> =
            self.security.iter().map(|s| s.protocol_name()).collect();
        let security_name = multistream::listener_select(&mut pipe, &security_names).await?;
        let security = self
            .security
            .iter()
            .find(|s| s.protocol_name() == security_name)
            .expect("negotiated protocol comes from our own set")
            .clone();

        let (peer, mut secured) = security.secure_inbound(pipe).await?;

        let muxer_names: Vec<&str> = self.muxers.iter().map(|m| m.protocol_name()).collect();
        let muxer_name = multistream::listener_select(&mut secured, &muxer_names).await?;
        let muxer_upgrade = self
            .muxers
            .iter()
            .find(|m| m.protocol_name() == muxer_name)
            .expect("negotiated protocol comes from our own set");

        let muxer = muxer_upgrade.upgrade(secured, Role::Responder);
        log::debug!("inbound upgrade complete: peer={peer} security={security_name} muxer={muxer_name}");
        Ok(Upgraded {
            peer,
            muxer,
            info: ConnectionInfo {
                transport,
                security: security_name,
                muxer: muxer_name,
                used_early_mux_negotiation: false,
            },
        })
    }
}

/// Errors occurring while upgrading a raw pipe.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("protocol negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    /// The handshake (or the negotiation around it) missed its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// The authenticated remote identity is not the peer we meant to reach.
    #[error("authenticated peer {actual} does not match expected peer {expected}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    /// The security handshake failed.
    #[error("security handshake failed: {0}")]
    Security(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("muxer error: {0}")]
    Muxer(#[from] MuxerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
