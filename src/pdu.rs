//! Encoding and decoding of UDS protocol data units
//!
//! A request is `[SID] [sub-function?] [payload...]`, a positive response
//! echoes `SID + 0x40`, a negative response is `0x7F [SID] [NRC]`.
//! Parsing is pure and side-effect free; everything stateful lives in
//! [crate::client].

use automotive_diag::uds::{UdsError, UdsErrorByte};

use crate::{DiagError, DiagServerResult};

/// Service id prefix of every negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
/// Offset added to the request SID in a positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// One UDS request PDU. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsRequest {
    /// Service id
    pub service: u8,
    /// Optional sub-function byte, sent directly after the SID
    pub sub_function: Option<u8>,
    /// Remaining request parameter bytes
    pub payload: Vec<u8>,
}

impl UdsRequest {
    /// Creates a new request PDU
    pub fn new<S: Into<u8>>(service: S, sub_function: Option<u8>, payload: &[u8]) -> Self {
        Self {
            service: service.into(),
            sub_function,
            payload: payload.to_vec(),
        }
    }

    /// Produces the minimal wire frame for this request
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(2 + self.payload.len());
        b.push(self.service);
        if let Some(sf) = self.sub_function {
            b.push(sf);
        }
        b.extend_from_slice(&self.payload);
        b
    }

    /// Encodes the request, validating it against the transport MTU
    pub fn encode(&self, mtu: usize) -> DiagServerResult<Vec<u8>> {
        let bytes = self.to_bytes();
        if bytes.len() > mtu {
            return Err(DiagError::EncodingError {
                len: bytes.len(),
                mtu,
            });
        }
        Ok(bytes)
    }

    /// SID a positive response to this request will carry
    pub fn expected_response_sid(&self) -> u8 {
        self.service.wrapping_add(POSITIVE_RESPONSE_OFFSET)
    }
}

/// A parsed UDS response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// Positive response. `data` excludes the response SID, so a plain
    /// acknowledge carries an empty `data`.
    Positive {
        /// Echoed service id (with the 0x40 offset already removed)
        service: u8,
        /// Response parameter bytes
        data: Vec<u8>,
    },
    /// Negative response
    Negative {
        /// Echoed service id the ECU refused
        service: u8,
        /// Negative response code
        nrc: u8,
    },
    /// Bytes that do not decode as a UDS response. A fault, possibly a
    /// device bug; recorded rather than retried.
    Malformed(Vec<u8>),
}

impl UdsResponse {
    /// Decodes raw response bytes.
    ///
    /// At least one byte (the service echo) is required. `0x7F` marks a
    /// negative response carrying the echoed SID and an NRC; a byte with
    /// the 0x40 response bit set marks a positive response. Everything
    /// else is [UdsResponse::Malformed].
    pub fn decode(bytes: &[u8]) -> Self {
        match bytes.first() {
            None => UdsResponse::Malformed(Vec::new()),
            Some(&NEGATIVE_RESPONSE_SID) => {
                if bytes.len() < 3 {
                    UdsResponse::Malformed(bytes.to_vec())
                } else {
                    UdsResponse::Negative {
                        service: bytes[1],
                        nrc: bytes[2],
                    }
                }
            }
            Some(&sid) if sid & POSITIVE_RESPONSE_OFFSET != 0 => UdsResponse::Positive {
                service: sid - POSITIVE_RESPONSE_OFFSET,
                data: bytes[1..].to_vec(),
            },
            Some(_) => UdsResponse::Malformed(bytes.to_vec()),
        }
    }

    /// True for a positive response
    pub fn is_positive(&self) -> bool {
        matches!(self, UdsResponse::Positive { .. })
    }

    /// NRC of a negative response, if any
    pub fn nrc(&self) -> Option<u8> {
        match self {
            UdsResponse::Negative { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }

    /// Service id echoed in the response, if it decoded at all
    pub fn service(&self) -> Option<u8> {
        match self {
            UdsResponse::Positive { service, .. } | UdsResponse::Negative { service, .. } => {
                Some(*service)
            }
            UdsResponse::Malformed(_) => None,
        }
    }
}

/// Looks up the ISO 14229 definition of an NRC byte
pub fn nrc_description(nrc: u8) -> String {
    format!("{:?}", UdsErrorByte::from(nrc))
}

/// True if the NRC means the real response is still pending and the
/// client should keep polling the channel
pub fn is_response_pending(nrc: u8) -> bool {
    matches!(
        UdsErrorByte::from(nrc),
        crate::Standard(UdsError::RequestCorrectlyReceivedResponsePending)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = UdsRequest::new(0x22u8, None, &[0xF1, 0x90]);
        let wire = req.encode(4095).unwrap();
        assert_eq!(wire, vec![0x22, 0xF1, 0x90]);
        assert_eq!(req.expected_response_sid(), 0x62);

        // Well-formed positive response to that request
        let resp = UdsResponse::decode(&[0x62, 0xF1, 0x90, 0xAA]);
        match resp {
            UdsResponse::Positive { service, data } => {
                assert_eq!(service, 0x22);
                assert_eq!(data, vec![0xF1, 0x90, 0xAA]);
            }
            _ => panic!("expected positive response, got {resp:?}"),
        }
    }

    #[test]
    fn sub_function_is_placed_after_sid() {
        let req = UdsRequest::new(0x10u8, Some(0x03), &[]);
        assert_eq!(req.to_bytes(), vec![0x10, 0x03]);
    }

    #[test]
    fn zero_length_positive_payload_roundtrips() {
        let resp = UdsResponse::decode(&[0x7E]);
        assert_eq!(
            resp,
            UdsResponse::Positive {
                service: 0x3E,
                data: vec![]
            }
        );
    }

    #[test]
    fn negative_response_carries_echo_and_nrc() {
        let resp = UdsResponse::decode(&[0x7F, 0x27, 0x35]);
        assert_eq!(
            resp,
            UdsResponse::Negative {
                service: 0x27,
                nrc: 0x35
            }
        );
        assert_eq!(resp.nrc(), Some(0x35));
    }

    #[test]
    fn malformed_frames() {
        assert!(matches!(UdsResponse::decode(&[]), UdsResponse::Malformed(_)));
        // Truncated negative response
        assert!(matches!(
            UdsResponse::decode(&[0x7F, 0x10]),
            UdsResponse::Malformed(_)
        ));
        // 0x22 has no response bit set, cannot be a response SID
        assert!(matches!(
            UdsResponse::decode(&[0x22, 0x01]),
            UdsResponse::Malformed(_)
        ));
    }

    #[test]
    fn encode_rejects_oversized_frames() {
        let req = UdsRequest::new(0x2Eu8, None, &[0u8; 64]);
        match req.encode(8) {
            Err(DiagError::EncodingError { len, mtu }) => {
                assert_eq!(len, 65);
                assert_eq!(mtu, 8);
            }
            other => panic!("expected EncodingError, got {other:?}"),
        }
    }
}
