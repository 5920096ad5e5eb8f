//! ECU target addressing
//!
//! A target is described by a URI of the form
//! `scheme://host[:port]?key=value&...`, for example:
//!
//! * `isotp://can0?src_addr=0x7E0&dst_addr=0x7E8&is_fd=false`
//! * `doip://192.168.1.10:13400?src_addr=0x0E80&dst_addr=0x1001`
//! * `tcp-lines://127.0.0.1:20162`
//! * `can-raw://vcan0?src_addr=0x701&dst_addr=0x700`
//!
//! Parsing validates everything up front; the resulting [EcuTarget] is
//! the single configuration object handed to the transport layer.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::{DiagError, DiagServerResult};

/// Default MTU for ISO-TP (single 12-bit length field)
pub const ISOTP_MTU: usize = 4095;
/// Default MTU for TCP based transports
pub const TCP_MTU: usize = 0xFFFF;
/// MTU of an unsegmented classic CAN frame (SID + 7 payload bytes)
pub const CAN_RAW_MTU: usize = 7;

/// ISO-TP link parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoTpTarget {
    /// CAN interface name, e.g. `can0`
    pub interface: String,
    /// Tester arbitration id (requests are sent with this id)
    pub src_addr: u32,
    /// ECU arbitration id (responses arrive with this id)
    pub dst_addr: u32,
    /// Padding byte appended to short transmit frames, if any
    pub tx_padding: Option<u8>,
    /// Expected padding byte on received frames, if any
    pub rx_padding: Option<u8>,
    /// Use CAN-FD framing on the link layer
    pub is_fd: bool,
    /// Use 29-bit arbitration ids
    pub ext_can_id: bool,
    /// Extended ISO-TP address pair (tx, rx), if in use
    pub ext_address: Option<(u8, u8)>,
    /// Minimum separation time between consecutive frames
    pub st_min: u8,
    /// Flow control block size
    pub block_size: u8,
}

/// DoIP gateway parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoIpTarget {
    /// Gateway host
    pub host: String,
    /// Gateway TCP port
    pub port: u16,
    /// Tester logical address
    pub src_addr: u16,
    /// ECU logical address
    pub dst_addr: u16,
    /// Routing activation type byte (0x00 = default)
    pub activation_type: u8,
}

/// tcp-lines endpoint (newline delimited hex frames)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpLinesTarget {
    /// Peer host
    pub host: String,
    /// Peer TCP port
    pub port: u16,
}

/// Raw CAN link parameters for single-frame exchanges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanRawTarget {
    /// CAN interface name
    pub interface: String,
    /// Arbitration id requests are sent with
    pub src_addr: u32,
    /// Arbitration id answers are expected on
    pub dst_addr: u32,
    /// Use 29-bit arbitration ids
    pub ext_can_id: bool,
}

/// Transport variant plus its addressing parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    /// ISO 15765-2 over a SocketCAN interface
    IsoTp(IsoTpTarget),
    /// Diagnostics over IP
    DoIp(DoIpTarget),
    /// Newline delimited hex frames over TCP
    TcpLines(TcpLinesTarget),
    /// Unsegmented single CAN frames
    CanRaw(CanRawTarget),
}

/// A fully validated ECU target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuTarget {
    /// Transport variant and addressing
    pub address: TransportAddress,
    /// Maximum PDU size negotiated for this link
    pub mtu: usize,
    /// Pause inserted between consecutive requests
    pub request_gap: Duration,
    /// TCP connect timeout for the IP based transports
    pub connect_timeout: Duration,
}

impl EcuTarget {
    /// Scheme string of the selected transport
    pub fn scheme(&self) -> &'static str {
        match self.address {
            TransportAddress::IsoTp(_) => "isotp",
            TransportAddress::DoIp(_) => "doip",
            TransportAddress::TcpLines(_) => "tcp-lines",
            TransportAddress::CanRaw(_) => "can-raw",
        }
    }
}

impl std::fmt::Display for EcuTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.address {
            TransportAddress::IsoTp(t) => write!(
                f,
                "isotp://{}?src_addr=0x{:X}&dst_addr=0x{:X}",
                t.interface, t.src_addr, t.dst_addr
            ),
            TransportAddress::DoIp(t) => write!(f, "doip://{}:{}", t.host, t.port),
            TransportAddress::TcpLines(t) => write!(f, "tcp-lines://{}:{}", t.host, t.port),
            TransportAddress::CanRaw(t) => write!(
                f,
                "can-raw://{}?src_addr=0x{:X}&dst_addr=0x{:X}",
                t.interface, t.src_addr, t.dst_addr
            ),
        }
    }
}

fn invalid<T>(msg: impl Into<String>) -> DiagServerResult<T> {
    Err(DiagError::InvalidTarget(msg.into()))
}

/// Parses an integer that may carry a `0x` prefix
fn parse_num(key: &str, value: &str) -> DiagServerResult<u32> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    match parsed {
        Ok(v) => Ok(v),
        Err(_) => invalid(format!("parameter '{key}' is not a number: '{value}'")),
    }
}

fn parse_bool(key: &str, value: &str) -> DiagServerResult<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => invalid(format!("parameter '{key}' is not a boolean: '{value}'")),
    }
}

struct Params(HashMap<String, String>);

impl Params {
    fn num(&self, key: &str) -> DiagServerResult<Option<u32>> {
        self.0.get(key).map(|v| parse_num(key, v)).transpose()
    }

    fn require_num(&self, key: &str) -> DiagServerResult<u32> {
        match self.num(key)? {
            Some(v) => Ok(v),
            None => invalid(format!("missing required parameter '{key}'")),
        }
    }

    fn byte(&self, key: &str) -> DiagServerResult<Option<u8>> {
        match self.num(key)? {
            Some(v) if v <= 0xFF => Ok(Some(v as u8)),
            Some(v) => invalid(format!("parameter '{key}'=0x{v:X} does not fit a byte")),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str) -> DiagServerResult<bool> {
        match self.0.get(key) {
            Some(v) => parse_bool(key, v),
            None => Ok(false),
        }
    }
}

impl FromStr for EcuTarget {
    type Err = DiagError;

    fn from_str(s: &str) -> DiagServerResult<Self> {
        let url = match Url::parse(s) {
            Ok(u) => u,
            Err(e) => return invalid(format!("{e}")),
        };
        let params = Params(
            url.query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        );
        let host = url.host_str().unwrap_or_default().to_string();
        if host.is_empty() {
            return invalid("target URI has no host/interface part");
        }

        let mut mtu = params.num("mtu")?.map(|v| v as usize);
        let request_gap = Duration::from_millis(params.num("request_gap_ms")?.unwrap_or(0).into());
        let connect_timeout =
            Duration::from_millis(params.num("connect_timeout_ms")?.unwrap_or(2000).into());

        let address = match url.scheme() {
            "isotp" => {
                let ext_address = match (params.byte("ext_address")?, params.byte("rx_ext_address")?)
                {
                    (Some(tx), rx) => Some((tx, rx.unwrap_or(0))),
                    (None, Some(_)) => {
                        return invalid("rx_ext_address given without ext_address")
                    }
                    (None, None) => None,
                };
                TransportAddress::IsoTp(IsoTpTarget {
                    interface: host,
                    src_addr: params.require_num("src_addr")?,
                    dst_addr: params.require_num("dst_addr")?,
                    tx_padding: params.byte("tx_padding")?,
                    rx_padding: params.byte("rx_padding")?,
                    is_fd: params.flag("is_fd")?,
                    ext_can_id: params.flag("ext_can_id")?,
                    ext_address,
                    st_min: params.byte("st_min")?.unwrap_or(10),
                    block_size: params.byte("block_size")?.unwrap_or(0),
                })
            }
            "doip" => {
                let src = params.num("src_addr")?.unwrap_or(0x0E00);
                let dst = params.num("dst_addr")?.unwrap_or(0x1001);
                if src > 0xFFFF || dst > 0xFFFF {
                    return invalid("DoIP logical addresses must fit 16 bits");
                }
                TransportAddress::DoIp(DoIpTarget {
                    host,
                    port: url.port().unwrap_or(13400),
                    src_addr: src as u16,
                    dst_addr: dst as u16,
                    activation_type: params.byte("activation_type")?.unwrap_or(0x00),
                })
            }
            "tcp-lines" => {
                let port = match url.port() {
                    Some(p) => p,
                    None => return invalid("tcp-lines target requires an explicit port"),
                };
                TransportAddress::TcpLines(TcpLinesTarget { host, port })
            }
            "can-raw" => TransportAddress::CanRaw(CanRawTarget {
                interface: host,
                src_addr: params.require_num("src_addr")?,
                dst_addr: params.require_num("dst_addr")?,
                ext_can_id: params.flag("ext_can_id")?,
            }),
            other => return invalid(format!("unknown transport scheme '{other}'")),
        };

        let default_mtu = match address {
            TransportAddress::IsoTp(_) => ISOTP_MTU,
            TransportAddress::DoIp(_) | TransportAddress::TcpLines(_) => TCP_MTU,
            TransportAddress::CanRaw(_) => CAN_RAW_MTU,
        };
        let mtu = *mtu.get_or_insert(default_mtu);
        if mtu == 0 {
            return invalid("mtu must be non-zero");
        }

        Ok(EcuTarget {
            address,
            mtu,
            request_gap,
            connect_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_isotp_target() {
        let t: EcuTarget = "isotp://can0?src_addr=0x7E0&dst_addr=0x7E8&is_fd=true&tx_padding=0xAA"
            .parse()
            .unwrap();
        assert_eq!(t.mtu, ISOTP_MTU);
        match t.address {
            TransportAddress::IsoTp(i) => {
                assert_eq!(i.interface, "can0");
                assert_eq!(i.src_addr, 0x7E0);
                assert_eq!(i.dst_addr, 0x7E8);
                assert_eq!(i.tx_padding, Some(0xAA));
                assert!(i.is_fd);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_tcp_lines_target() {
        let t: EcuTarget = "tcp-lines://127.0.0.1:20162".parse().unwrap();
        assert_eq!(t.scheme(), "tcp-lines");
        match t.address {
            TransportAddress::TcpLines(l) => {
                assert_eq!(l.host, "127.0.0.1");
                assert_eq!(l.port, 20162);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn doip_defaults() {
        let t: EcuTarget = "doip://192.168.1.10".parse().unwrap();
        match t.address {
            TransportAddress::DoIp(d) => {
                assert_eq!(d.port, 13400);
                assert_eq!(d.activation_type, 0x00);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_targets() {
        assert!("isotp://can0".parse::<EcuTarget>().is_err()); // missing addresses
        assert!("tcp-lines://127.0.0.1".parse::<EcuTarget>().is_err()); // missing port
        assert!("gopher://x:1".parse::<EcuTarget>().is_err()); // unknown scheme
        assert!("isotp://can0?src_addr=zzz&dst_addr=1".parse::<EcuTarget>().is_err());
    }
}
