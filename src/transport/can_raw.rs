//! Raw CAN channel for unsegmented single-frame exchanges
//!
//! Carries at most 7 payload bytes behind a single-frame PCI byte. Used
//! for link-layer-only interactions such as arbitration id discovery,
//! never for full diagnostic sessions.

use std::time::{Duration, Instant};

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};

use crate::channel::{ChannelError, ChannelResult, DiagChannel};
use crate::target::{CanRawTarget, EcuTarget, CAN_RAW_MTU};

fn id_to_raw(id: Id) -> u32 {
    match id {
        Id::Standard(s) => s.as_raw() as u32,
        Id::Extended(e) => e.as_raw(),
    }
}

/// Single-frame CAN channel
pub struct CanRawChannel {
    target: CanRawTarget,
    mtu: usize,
    socket: Option<CanSocket>,
}

impl std::fmt::Debug for CanRawChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanRawChannel")
            .field("target", &self.target)
            .field("open", &self.socket.is_some())
            .finish()
    }
}

impl CanRawChannel {
    /// Creates an unopened channel on the given CAN interface
    pub fn new(target: CanRawTarget, cfg: &EcuTarget) -> Self {
        Self {
            target,
            mtu: cfg.mtu.min(CAN_RAW_MTU),
            socket: None,
        }
    }

    fn tx_id(&self) -> ChannelResult<Id> {
        if self.target.ext_can_id {
            ExtendedId::new(self.target.src_addr)
                .map(Id::Extended)
                .ok_or_else(|| ChannelError::InvalidFrame("tx id exceeds 29 bits".into()))
        } else {
            StandardId::new(self.target.src_addr as u16)
                .map(Id::Standard)
                .ok_or_else(|| ChannelError::InvalidFrame("tx id exceeds 11 bits".into()))
        }
    }
}

impl DiagChannel for CanRawChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = CanSocket::open(&self.target.interface)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.socket = None;
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> ChannelResult<()> {
        if payload.len() > CAN_RAW_MTU {
            return Err(ChannelError::UnsupportedRequest);
        }
        let tx_id = self.tx_id()?;
        // Single frame PCI: upper nibble 0, lower nibble = length
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(payload.len() as u8);
        data.extend_from_slice(payload);
        let frame = CanFrame::new(tx_id, &data)
            .ok_or_else(|| ChannelError::InvalidFrame("payload does not fit a CAN frame".into()))?;
        let socket = self.socket.as_mut().ok_or(ChannelError::InterfaceNotOpen)?;
        socket.write_frame(&frame)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        let want = self.target.dst_addr;
        let socket = self.socket.as_mut().ok_or(ChannelError::InterfaceNotOpen)?;
        socket.set_read_timeout(timeout.max(Duration::from_millis(1)))?;
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                return Err(ChannelError::ReadTimeout);
            }
            let frame = socket.read_frame()?;
            if id_to_raw(frame.id()) != want {
                continue;
            }
            let data = frame.data();
            // Strip the single frame PCI byte
            let Some((&pci, rest)) = data.split_first() else {
                continue;
            };
            let len = (pci & 0x0F) as usize;
            if pci & 0xF0 != 0 || len > rest.len() {
                return Err(ChannelError::InvalidFrame(format!(
                    "unexpected PCI byte 0x{pci:02X} on raw CAN frame"
                )));
            }
            return Ok(rest[..len].to_vec());
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for CanRawChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
