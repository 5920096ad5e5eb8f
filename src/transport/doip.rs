//! Diagnostics over IP (ISO 13400) channel
//!
//! Implements the subset of DoIP a tester needs: the routing activation
//! handshake, length-prefixed diagnostic messages with logical
//! addressing, diagnostic ACK/NACK handling and alive check replies.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::channel::{ChannelError, ChannelResult, DiagChannel};
use crate::target::{DoIpTarget, EcuTarget};

/// DoIP protocol version used on the wire (ISO 13400-2:2012)
pub const PROTOCOL_VERSION: u8 = 0x02;

/// DoIP header length in bytes
pub const HEADER_LEN: usize = 8;

/// Payload type codes
pub mod payload_type {
    /// Generic negative acknowledge
    pub const GENERIC_NACK: u16 = 0x0000;
    /// Routing activation request
    pub const ROUTING_ACTIVATION_REQ: u16 = 0x0005;
    /// Routing activation response
    pub const ROUTING_ACTIVATION_RESP: u16 = 0x0006;
    /// Alive check request
    pub const ALIVE_CHECK_REQ: u16 = 0x0007;
    /// Alive check response
    pub const ALIVE_CHECK_RESP: u16 = 0x0008;
    /// Diagnostic message
    pub const DIAG_MESSAGE: u16 = 0x8001;
    /// Diagnostic message positive acknowledge
    pub const DIAG_MESSAGE_ACK: u16 = 0x8002;
    /// Diagnostic message negative acknowledge
    pub const DIAG_MESSAGE_NACK: u16 = 0x8003;
}

/// Routing activation response code for success
pub const ACTIVATION_SUCCESS: u8 = 0x10;

/// Builds one DoIP frame (header + payload)
pub fn build_frame(ptype: u16, payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(HEADER_LEN + payload.len());
    f.push(PROTOCOL_VERSION);
    f.push(!PROTOCOL_VERSION);
    f.extend_from_slice(&ptype.to_be_bytes());
    f.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    f.extend_from_slice(payload);
    f
}

/// Parses a DoIP header, returning (payload type, payload length)
pub fn parse_header(hdr: &[u8; HEADER_LEN]) -> ChannelResult<(u16, usize)> {
    if hdr[0] != PROTOCOL_VERSION || hdr[1] != !PROTOCOL_VERSION {
        return Err(ChannelError::InvalidFrame(format!(
            "bad DoIP protocol version bytes {:02X} {:02X}",
            hdr[0], hdr[1]
        )));
    }
    let ptype = u16::from_be_bytes([hdr[2], hdr[3]]);
    let len = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]) as usize;
    Ok((ptype, len))
}

/// DoIP tester channel over TCP
pub struct DoIpChannel {
    target: DoIpTarget,
    mtu: usize,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl std::fmt::Debug for DoIpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoIpChannel")
            .field("target", &self.target)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl DoIpChannel {
    /// Creates an unopened channel for the given gateway
    pub fn new(target: DoIpTarget, cfg: &EcuTarget) -> Self {
        Self {
            target,
            mtu: cfg.mtu,
            connect_timeout: cfg.connect_timeout,
            stream: None,
        }
    }

    fn stream(&mut self) -> ChannelResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(ChannelError::InterfaceNotOpen)
    }

    fn read_frame(&mut self, deadline: Instant) -> ChannelResult<(u16, Vec<u8>)> {
        let stream = self.stream()?;
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(ChannelError::ReadTimeout)?;
        stream.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;

        let mut hdr = [0u8; HEADER_LEN];
        stream.read_exact(&mut hdr)?;
        let (ptype, len) = parse_header(&hdr)?;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload)?;
        Ok((ptype, payload))
    }

    /// Performs routing activation. Diagnostic traffic is only legal
    /// after the gateway confirmed the activation.
    fn routing_activation(&mut self) -> ChannelResult<()> {
        let mut req = Vec::with_capacity(7);
        req.extend_from_slice(&self.target.src_addr.to_be_bytes());
        req.push(self.target.activation_type);
        req.extend_from_slice(&[0u8; 4]); // reserved
        let frame = build_frame(payload_type::ROUTING_ACTIVATION_REQ, &req);
        self.stream()?.write_all(&frame)?;

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let (ptype, payload) = self.read_frame(deadline)?;
            match ptype {
                payload_type::ROUTING_ACTIVATION_RESP => {
                    if payload.len() < 5 {
                        return Err(ChannelError::InvalidFrame(
                            "short routing activation response".into(),
                        ));
                    }
                    let code = payload[4];
                    if code == ACTIVATION_SUCCESS {
                        log::debug!("DoIP routing activation succeeded");
                        return Ok(());
                    }
                    return Err(ChannelError::HandshakeFailed(format!(
                        "routing activation refused, code 0x{code:02X}"
                    )));
                }
                payload_type::GENERIC_NACK => {
                    return Err(ChannelError::HandshakeFailed(format!(
                        "generic NACK 0x{:02X} during activation",
                        payload.first().copied().unwrap_or(0)
                    )));
                }
                other => {
                    log::debug!("ignoring DoIP payload type 0x{other:04X} during activation");
                }
            }
        }
    }
}

impl DiagChannel for DoIpChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = (self.target.host.as_str(), self.target.port);
        let resolved = std::net::ToSocketAddrs::to_socket_addrs(&addr)?
            .next()
            .ok_or(ChannelError::InterfaceNotOpen)?;
        let stream = TcpStream::connect_timeout(&resolved, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        if let Err(e) = self.routing_activation() {
            self.stream = None;
            return Err(e);
        }
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.stream = None;
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> ChannelResult<()> {
        let mut diag = Vec::with_capacity(4 + payload.len());
        diag.extend_from_slice(&self.target.src_addr.to_be_bytes());
        diag.extend_from_slice(&self.target.dst_addr.to_be_bytes());
        diag.extend_from_slice(payload);
        let frame = build_frame(payload_type::DIAG_MESSAGE, &diag);
        self.stream()?.write_all(&frame)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let (ptype, payload) = self.read_frame(deadline)?;
            match ptype {
                payload_type::DIAG_MESSAGE => {
                    if payload.len() < 4 {
                        return Err(ChannelError::InvalidFrame(
                            "diagnostic message shorter than its addressing".into(),
                        ));
                    }
                    let target = u16::from_be_bytes([payload[2], payload[3]]);
                    if target != self.target.src_addr {
                        log::debug!("dropping diagnostic message for 0x{target:04X}");
                        continue;
                    }
                    return Ok(payload[4..].to_vec());
                }
                payload_type::DIAG_MESSAGE_ACK => continue,
                payload_type::DIAG_MESSAGE_NACK => {
                    return Err(ChannelError::InvalidFrame(format!(
                        "diagnostic message NACK 0x{:02X}",
                        payload.get(4).copied().unwrap_or(0)
                    )));
                }
                payload_type::ALIVE_CHECK_REQ => {
                    let resp = build_frame(
                        payload_type::ALIVE_CHECK_RESP,
                        &self.target.src_addr.to_be_bytes(),
                    );
                    self.stream()?.write_all(&resp)?;
                }
                other => {
                    log::debug!("ignoring DoIP payload type 0x{other:04X}");
                }
            }
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for DoIpChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let f = build_frame(payload_type::DIAG_MESSAGE, &[0x0E, 0x80, 0x10, 0x01, 0x10, 0x03]);
        assert_eq!(&f[..2], &[0x02, 0xFD]);
        assert_eq!(u16::from_be_bytes([f[2], f[3]]), 0x8001);
        assert_eq!(u32::from_be_bytes([f[4], f[5], f[6], f[7]]), 6);
        let mut hdr = [0u8; HEADER_LEN];
        hdr.copy_from_slice(&f[..HEADER_LEN]);
        assert_eq!(parse_header(&hdr).unwrap(), (0x8001, 6));
    }

    #[test]
    fn header_rejects_wrong_version() {
        let hdr = [0x03, 0xFC, 0x80, 0x01, 0, 0, 0, 0];
        assert!(parse_header(&hdr).is_err());
    }
}
