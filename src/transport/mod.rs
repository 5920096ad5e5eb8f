//! Concrete [DiagChannel](crate::channel::DiagChannel) implementations
//!
//! Supported links:
//! * [tcp_lines] - newline delimited hex frames, used to reach the
//!   virtual ECU and in automated tests
//! * [doip] - Diagnostics over IP with routing activation
//! * [isotp] - kernel ISO-TP sockets (Linux, `socketcan` feature)
//! * [can_raw] - unsegmented single CAN frames (Linux, `socketcan` feature)
//! * [mock] - scriptable in-memory channel for unit testing

use crate::channel::DiagChannel;
use crate::target::{EcuTarget, TransportAddress};
use crate::{DiagError, DiagServerResult};

pub mod doip;
pub mod mock;
pub mod tcp_lines;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod can_raw;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod isotp;

/// Opens a channel to the given target.
///
/// The returned channel is already open; it is closed again when dropped.
/// Fails with [DiagError::Channel] on refusal or link-down.
pub fn connect(target: &EcuTarget) -> DiagServerResult<Box<dyn DiagChannel>> {
    log::debug!("connecting to {target}");
    let mut channel: Box<dyn DiagChannel> = match &target.address {
        TransportAddress::TcpLines(t) => {
            Box::new(tcp_lines::TcpLinesChannel::new(t.clone(), target))
        }
        TransportAddress::DoIp(t) => Box::new(doip::DoIpChannel::new(t.clone(), target)),
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportAddress::IsoTp(t) => Box::new(isotp::IsoTpChannel::new(t.clone(), target)),
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportAddress::CanRaw(t) => Box::new(can_raw::CanRawChannel::new(t.clone(), target)),
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportAddress::IsoTp(_) | TransportAddress::CanRaw(_) => {
            return Err(DiagError::InvalidTarget(format!(
                "transport '{}' requires the socketcan feature on Linux",
                target.scheme()
            )))
        }
    };
    channel.open()?;
    Ok(channel)
}
