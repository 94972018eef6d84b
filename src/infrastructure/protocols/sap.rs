//! Session Announcement Protocol header (RFC 2974)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | V=1 |A|R|T|E|C|   auth len    |         msg id hash           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! :                originating source (32 or 128 bits)            :
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    optional authentication data               |
//! :                              ....                             :
//! |                      optional payload type                    |
//! +                                         +-+- - - - - - - - - -+
//! |                                         |0|                   |
//! + - - - - - - - - - - - - - - - - - - - - +-+                   |
//! :                            payload                            :
//! ```

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Payload type assumed when the optional field is absent
pub const DEFAULT_PAYLOAD_TYPE: &str = "application/sdp";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SapError {
    #[error("SAP packet too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Payload type is not terminated")]
    UnterminatedPayloadType,

    #[error("Payload type is not valid UTF-8")]
    InvalidPayloadType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SapMessageType {
    Announcement,
    Deletion,
}

/// Decoded SAP header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SapHeader {
    pub version: u8,
    /// `true` when the originating source is IPv6
    pub ipv6: bool,
    pub message_type: SapMessageType,
    pub encrypted: bool,
    pub compressed: bool,
    /// Authentication data length in 32-bit words
    pub authentication_length: u8,
    pub message_id_hash: String,
    pub originating_source: IpAddr,
    pub payload_type: String,
}

impl SapHeader {
    /// Decode a SAP packet, returning the header and the payload behind it
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), SapError> {
        let fixed = take(data, 0, 4)?;

        let flags = fixed[0];
        let version = flags >> 5;
        let ipv6 = (flags >> 4) & 0x01 == 1;
        // bit 3 is reserved
        let message_type = if (flags >> 2) & 0x01 == 1 {
            SapMessageType::Deletion
        } else {
            SapMessageType::Announcement
        };
        let encrypted = (flags >> 1) & 0x01 == 1;
        let compressed = flags & 0x01 == 1;
        let authentication_length = fixed[1];
        let message_id_hash = hex::encode(&fixed[2..4]);

        let mut offset = 4;
        let originating_source = if ipv6 {
            let octets: [u8; 16] = take(data, offset, 16)?
                .try_into()
                .map_err(|_| SapError::Truncated {
                    needed: offset + 16,
                    available: data.len(),
                })?;
            offset += 16;
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            let src = take(data, offset, 4)?;
            offset += 4;
            IpAddr::V4(Ipv4Addr::new(src[0], src[1], src[2], src[3]))
        };

        // Authentication data is skipped, not verified
        let auth_len = usize::from(authentication_length) * 4;
        take(data, offset, auth_len)?;
        offset += auth_len;

        let rest = &data[offset..];
        let (payload_type, payload) = if rest.starts_with(b"v=0") {
            (DEFAULT_PAYLOAD_TYPE.to_string(), rest)
        } else {
            let end = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(SapError::UnterminatedPayloadType)?;
            let payload_type = std::str::from_utf8(&rest[..end])
                .map_err(|_| SapError::InvalidPayloadType)?
                .to_string();
            (payload_type, &rest[end + 1..])
        };

        Ok((
            Self {
                version,
                ipv6,
                message_type,
                encrypted,
                compressed,
                authentication_length,
                message_id_hash,
                originating_source,
                payload_type,
            },
            payload,
        ))
    }
}

fn take(data: &[u8], offset: usize, len: usize) -> Result<&[u8], SapError> {
    data.get(offset..offset + len).ok_or(SapError::Truncated {
        needed: offset + len,
        available: data.len(),
    })
}
