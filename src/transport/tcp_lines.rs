//! Newline delimited hex framing over TCP
//!
//! Each PDU is hex-encoded and terminated with `\n`. The framing is
//! trivially inspectable with netcat, which makes it the transport of
//! choice for the virtual ECU and for automated tests.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::channel::{ChannelError, ChannelResult, DiagChannel};
use crate::target::{EcuTarget, TcpLinesTarget};

/// TCP channel carrying one hex encoded PDU per line
pub struct TcpLinesChannel {
    target: TcpLinesTarget,
    mtu: usize,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    reader: Option<BufReader<TcpStream>>,
}

impl std::fmt::Debug for TcpLinesChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLinesChannel")
            .field("target", &self.target)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl TcpLinesChannel {
    /// Creates an unopened channel for the given endpoint
    pub fn new(target: TcpLinesTarget, cfg: &EcuTarget) -> Self {
        Self {
            target,
            mtu: cfg.mtu,
            connect_timeout: cfg.connect_timeout,
            stream: None,
            reader: None,
        }
    }
}

impl DiagChannel for TcpLinesChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = (self.target.host.as_str(), self.target.port);
        let mut last_err = ChannelError::InterfaceNotOpen;
        for resolved in std::net::ToSocketAddrs::to_socket_addrs(&addr)? {
            match TcpStream::connect_timeout(&resolved, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.reader = Some(BufReader::new(stream.try_clone()?));
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_err = e.into(),
            }
        }
        Err(last_err)
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.reader = None;
        self.stream = None; // Dropping the stream closes the socket
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> ChannelResult<()> {
        let stream = self.stream.as_mut().ok_or(ChannelError::InterfaceNotOpen)?;
        let mut line = hex::encode(payload);
        line.push('\n');
        stream.write_all(line.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        let stream = self.stream.as_ref().ok_or(ChannelError::InterfaceNotOpen)?;
        let reader = self.reader.as_mut().ok_or(ChannelError::InterfaceNotOpen)?;
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(ChannelError::Disconnected);
        }
        let trimmed = line.trim();
        hex::decode(trimmed)
            .map_err(|e| ChannelError::InvalidFrame(format!("bad hex line '{trimmed}': {e}")))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for TcpLinesChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
