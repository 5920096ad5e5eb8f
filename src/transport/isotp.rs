//! ISO-TP (ISO 15765-2) channel backed by kernel SocketCAN sockets
//!
//! Segmentation, flow control and padding are handled by the kernel's
//! `can-isotp` module; this channel configures it from the target
//! parameters and moves whole PDUs.

use std::time::{Duration, Instant};

use socketcan_isotp::{
    ExtendedId, FlowControlOptions, Id, IsoTpBehaviour, IsoTpOptions, IsoTpSocket,
    LinkLayerOptions, StandardId,
};

use crate::channel::{ChannelError, ChannelResult, DiagChannel};
use crate::target::{EcuTarget, IsoTpTarget};

impl From<socketcan_isotp::Error> for ChannelError {
    fn from(e: socketcan_isotp::Error) -> Self {
        ChannelError::InvalidFrame(format!("socketcan-isotp: {e}"))
    }
}

/// Kernel ISO-TP channel
pub struct IsoTpChannel {
    target: IsoTpTarget,
    mtu: usize,
    socket: Option<IsoTpSocket>,
}

impl std::fmt::Debug for IsoTpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpChannel")
            .field("target", &self.target)
            .field("open", &self.socket.is_some())
            .finish()
    }
}

impl IsoTpChannel {
    /// Creates an unopened channel on the given CAN interface
    pub fn new(target: IsoTpTarget, cfg: &EcuTarget) -> Self {
        Self {
            target,
            mtu: cfg.mtu,
            socket: None,
        }
    }

    fn socket(&mut self) -> ChannelResult<&mut IsoTpSocket> {
        self.socket.as_mut().ok_or(ChannelError::InterfaceNotOpen)
    }
}

impl DiagChannel for IsoTpChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let mut flags = IsoTpBehaviour::empty();
        if self.target.tx_padding.is_some() {
            flags |= IsoTpBehaviour::CAN_ISOTP_TX_PADDING;
        }
        if self.target.rx_padding.is_some() {
            flags |= IsoTpBehaviour::CAN_ISOTP_RX_PADDING;
        }
        if self.target.ext_address.is_some() {
            flags |= IsoTpBehaviour::CAN_ISOTP_EXTEND_ADDR | IsoTpBehaviour::CAN_ISOTP_RX_EXT_ADDR;
        }
        let (ext_tx, ext_rx) = self.target.ext_address.unwrap_or((0, 0));

        let opts = IsoTpOptions::new(
            flags,
            Duration::from_millis(0),
            ext_tx,
            self.target.tx_padding.unwrap_or(0xCC),
            self.target.rx_padding.unwrap_or(0xCC),
            ext_rx,
        )
        .unwrap();
        let fc_opts = FlowControlOptions::new(self.target.block_size, self.target.st_min, 0);
        let link_opts = if self.target.is_fd {
            // CAN-FD: 72 byte MTU, 64 byte tx data length
            LinkLayerOptions::new(72, 64, 0)
        } else {
            LinkLayerOptions::default()
        };

        let (tx_id, rx_id): (Id, Id) = if self.target.ext_can_id {
            (
                ExtendedId::new(self.target.src_addr)
                    .ok_or_else(|| ChannelError::InvalidFrame("tx id exceeds 29 bits".into()))?
                    .into(),
                ExtendedId::new(self.target.dst_addr)
                    .ok_or_else(|| ChannelError::InvalidFrame("rx id exceeds 29 bits".into()))?
                    .into(),
            )
        } else {
            (
                StandardId::new(self.target.src_addr as u16)
                    .ok_or_else(|| ChannelError::InvalidFrame("tx id exceeds 11 bits".into()))?
                    .into(),
                StandardId::new(self.target.dst_addr as u16)
                    .ok_or_else(|| ChannelError::InvalidFrame("rx id exceeds 11 bits".into()))?
                    .into(),
            )
        };

        let socket = IsoTpSocket::open_with_opts(
            &self.target.interface,
            rx_id,
            tx_id,
            Some(opts),
            Some(fc_opts),
            Some(link_opts),
        )?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.socket = None; // Dropping the socket closes it
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> ChannelResult<()> {
        self.socket()?.write(payload)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        let start = Instant::now();
        let socket = self.socket()?;
        while start.elapsed() <= timeout {
            if let Ok(data) = socket.read() {
                return Ok(data.to_vec());
            }
            std::thread::sleep(Duration::from_micros(500));
        }
        Err(ChannelError::ReadTimeout)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for IsoTpChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
