//! UDP bridge to the PLC modem adapter.
//!
//! Each datagram is an 18-byte header followed by an LBP frame:
//!
//!   byte 0      kind: 1 send request, 2 indication, 3 confirmation
//!   byte 1      handle (requests and confirmations)
//!   byte 2      status (confirmations, 0 = success)
//!   byte 3      link quality (indications)
//!   byte 4      flags: bit 0 discover route, bit 1 qos, bit 2 security
//!   byte 5      max hops (requests)
//!   byte 6      address mode: 0 short, 1 extended
//!   byte 7      reserved
//!   bytes 8-9   short address, big-endian
//!   bytes 10-17 extended address
//!   bytes 18..  LBP frame (empty for confirmations)
//!
//! Requests flow engine → `UdpLink` → bridge task → modem. Indications and
//! confirmations flow modem → bridge task → `ServiceHandle`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use static_assertions::assert_eq_size;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use lbs_core::lbp::MAX_FRAME_LEN;
use lbs_core::{DeviceIdentity, LinkAddress, ShortAddress};
use lbs_services::{Confirmation, Indication, LinkLayer, SendRequest, SendStatus};

use crate::service::ServiceHandle;

// ── Datagram header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct BridgeHeader {
    pub kind: u8,
    pub handle: u8,
    pub status: u8,
    pub link_quality: u8,
    pub flags: u8,
    pub max_hops: u8,
    pub address_mode: u8,
    pub reserved: u8,
    pub short_address: [u8; 2],
    pub extended: [u8; 8],
}

assert_eq_size!(BridgeHeader, [u8; 18]);

pub const BRIDGE_HEADER_LEN: usize = 18;

pub const KIND_REQUEST: u8 = 1;
pub const KIND_INDICATION: u8 = 2;
pub const KIND_CONFIRMATION: u8 = 3;

const FLAG_DISCOVER_ROUTE: u8 = 0x01;
const FLAG_QOS: u8 = 0x02;
const FLAG_SECURITY: u8 = 0x04;

const MODE_SHORT: u8 = 0;
const MODE_EXTENDED: u8 = 1;

/// Status reported to the engine when a request never left this host.
const STATUS_LOCAL_FAILURE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown datagram kind {0}")]
    UnknownKind(u8),
    #[error("unknown address mode {0}")]
    AddressMode(u8),
}

/// What the modem can send us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Indication(Indication),
    Confirmation(Confirmation),
}

fn header_for(kind: u8, address: Option<LinkAddress>) -> BridgeHeader {
    let mut h = BridgeHeader::new_zeroed();
    h.kind = kind;
    match address {
        Some(LinkAddress::Short(s)) => {
            h.address_mode = MODE_SHORT;
            h.short_address = s.to_be_bytes();
        }
        Some(LinkAddress::Extended(id)) => {
            h.address_mode = MODE_EXTENDED;
            h.extended = id.0;
        }
        None => {}
    }
    h
}

fn address_of(h: &BridgeHeader) -> Result<LinkAddress, BridgeError> {
    match h.address_mode {
        MODE_SHORT => Ok(LinkAddress::Short(ShortAddress(u16::from_be_bytes(
            h.short_address,
        )))),
        MODE_EXTENDED => Ok(LinkAddress::Extended(DeviceIdentity(h.extended))),
        other => Err(BridgeError::AddressMode(other)),
    }
}

fn with_payload(header: BridgeHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BRIDGE_HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_request(request: &SendRequest) -> Vec<u8> {
    let mut h = header_for(KIND_REQUEST, Some(request.destination));
    h.handle = request.handle;
    h.max_hops = request.max_hops;
    if request.discover_route {
        h.flags |= FLAG_DISCOVER_ROUTE;
    }
    if request.qos {
        h.flags |= FLAG_QOS;
    }
    if request.security_enabled {
        h.flags |= FLAG_SECURITY;
    }
    with_payload(h, &request.payload)
}

pub fn encode_indication(indication: &Indication) -> Vec<u8> {
    let mut h = header_for(KIND_INDICATION, Some(indication.source));
    h.link_quality = indication.link_quality;
    if indication.security_enabled {
        h.flags |= FLAG_SECURITY;
    }
    with_payload(h, &indication.payload)
}

pub fn encode_confirmation(confirmation: &Confirmation) -> Vec<u8> {
    let mut h = header_for(KIND_CONFIRMATION, None);
    h.handle = confirmation.handle;
    h.status = confirmation.status.code();
    h.as_bytes().to_vec()
}

fn split(buf: &[u8]) -> Result<(BridgeHeader, &[u8]), BridgeError> {
    let h = BridgeHeader::read_from_prefix(buf).ok_or(BridgeError::TooShort(buf.len()))?;
    Ok((h, &buf[BRIDGE_HEADER_LEN..]))
}

/// Decode a datagram from the modem.
pub fn decode_inbound(buf: &[u8]) -> Result<Inbound, BridgeError> {
    let (h, payload) = split(buf)?;
    match h.kind {
        KIND_INDICATION => Ok(Inbound::Indication(Indication {
            source: address_of(&h)?,
            security_enabled: h.flags & FLAG_SECURITY != 0,
            link_quality: h.link_quality,
            payload: Bytes::copy_from_slice(payload),
        })),
        KIND_CONFIRMATION => Ok(Inbound::Confirmation(Confirmation {
            handle: h.handle,
            status: SendStatus::from(h.status),
        })),
        other => Err(BridgeError::UnknownKind(other)),
    }
}

/// Decode a send request. The modem side of the bridge uses this.
pub fn decode_request(buf: &[u8]) -> Result<SendRequest, BridgeError> {
    let (h, payload) = split(buf)?;
    if h.kind != KIND_REQUEST {
        return Err(BridgeError::UnknownKind(h.kind));
    }
    Ok(SendRequest {
        destination: address_of(&h)?,
        payload: Bytes::copy_from_slice(payload),
        handle: h.handle,
        max_hops: h.max_hops,
        discover_route: h.flags & FLAG_DISCOVER_ROUTE != 0,
        qos: h.flags & FLAG_QOS != 0,
        security_enabled: h.flags & FLAG_SECURITY != 0,
    })
}

// ── Link layer ────────────────────────────────────────────────────────────────

/// `LinkLayer` that queues requests for the bridge task.
pub struct UdpLink {
    tx: mpsc::UnboundedSender<SendRequest>,
    max_hops: u8,
}

impl UdpLink {
    pub fn new(max_hops: u8) -> (Self, mpsc::UnboundedReceiver<SendRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, max_hops }, rx)
    }
}

impl LinkLayer for UdpLink {
    fn send(&self, request: SendRequest) {
        if self.tx.send(request).is_err() {
            tracing::warn!("modem bridge gone, request dropped");
        }
    }

    fn max_hops(&self) -> u8 {
        self.max_hops
    }
}

// ── Bridge task ───────────────────────────────────────────────────────────────

pub struct ModemBridge {
    socket: Arc<UdpSocket>,
    modem: SocketAddr,
    service: ServiceHandle,
    requests: mpsc::UnboundedReceiver<SendRequest>,
    shutdown: broadcast::Receiver<()>,
}

impl ModemBridge {
    pub fn new(
        socket: Arc<UdpSocket>,
        modem: SocketAddr,
        service: ServiceHandle,
        requests: mpsc::UnboundedReceiver<SendRequest>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            modem,
            service,
            requests,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; BRIDGE_HEADER_LEN + MAX_FRAME_LEN];
        tracing::info!(
            local = %self.socket.local_addr()?,
            modem = %self.modem,
            "modem bridge starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("modem bridge shutting down");
                    return Ok(());
                }

                request = self.requests.recv() => {
                    let Some(request) = request else {
                        tracing::info!("engine link closed");
                        return Ok(());
                    };
                    self.forward_request(request).await?;
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    if from != self.modem {
                        tracing::trace!(%from, "datagram from unknown sender ignored");
                        continue;
                    }
                    self.forward_inbound(&buf[..len]).await?;
                }
            }
        }
    }

    async fn forward_request(&self, request: SendRequest) -> anyhow::Result<()> {
        let datagram = encode_request(&request);
        match self.socket.send_to(&datagram, self.modem).await {
            Ok(n) => tracing::trace!(handle = request.handle, bytes = n, "request sent to modem"),
            Err(e) => {
                tracing::warn!(handle = request.handle, error = %e, "modem send failed");
                self.service
                    .confirmation(Confirmation {
                        handle: request.handle,
                        status: SendStatus::from(STATUS_LOCAL_FAILURE),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn forward_inbound(&self, datagram: &[u8]) -> anyhow::Result<()> {
        match decode_inbound(datagram) {
            Ok(Inbound::Indication(ind)) => {
                tracing::trace!(source = %ind.source, len = ind.payload.len(), "indication");
                self.service.indication(ind).await?;
            }
            Ok(Inbound::Confirmation(conf)) => {
                tracing::trace!(handle = conf.handle, status = ?conf.status, "confirmation");
                self.service.confirmation(conf).await?;
            }
            Err(e) => tracing::debug!(error = %e, len = datagram.len(), "malformed bridge datagram dropped"),
        }
        Ok(())
    }
}
