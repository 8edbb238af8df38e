//! A NAT-PMP request encoding and decoding.

use super::{Opcode, Version};

/// A NAT-PMP Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Ask the gateway for its external address.
    ExternalAddress,
    /// Ask the gateway for a UDP mapping.
    ///
    /// A `lifetime_seconds` of zero asks the gateway to delete the mapping.
    Mapping {
        /// Local port the mapping forwards to.
        local_port: u16,
        /// External port suggested to the gateway.
        external_port: u16,
        /// Requested lifetime of the mapping.
        lifetime_seconds: u32,
    },
}

impl Request {
    /// Size of an encoded [`Request::ExternalAddress`].
    pub const EXTERNAL_ADDRESS_SIZE: usize = 1 + // version
        1; // opcode

    /// Size of an encoded [`Request::Mapping`].
    pub const MAPPING_SIZE: usize = 1 + // version
        1 + // opcode
        2 + // reserved
        2 + // local port
        2 + // external port
        4; // lifetime

    /// Creates a request for a mapping where the local and external port are the same.
    pub fn symmetric_mapping(port: u16, lifetime_seconds: u32) -> Self {
        Request::Mapping {
            local_port: port,
            external_port: port,
            lifetime_seconds,
        }
    }

    /// [`Opcode`] of this request.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::ExternalAddress => Opcode::DetermineExternalAddress,
            Request::Mapping { .. } => Opcode::MapUdp,
        }
    }

    /// Encode this request to be sent to a server.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![
                Version::NatPmp.into(),
                Opcode::DetermineExternalAddress.into(),
            ],
            Request::Mapping {
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = Vec::with_capacity(Self::MAPPING_SIZE);
                buf.push(Version::NatPmp.into());
                buf.push(Opcode::MapUdp.into());
                // reserved
                buf.push(0);
                buf.push(0);
                buf.extend_from_slice(&local_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }

    /// Decode a request, as a server would.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (&version, rest) = buf.split_first()?;
        Version::try_from(version).ok()?;
        let (&opcode, rest) = rest.split_first()?;
        match Opcode::try_from(opcode).ok()? {
            Opcode::DetermineExternalAddress => Some(Request::ExternalAddress),
            Opcode::MapUdp => {
                if rest.len() < Self::MAPPING_SIZE - 2 {
                    return None;
                }
                let local_port = u16::from_be_bytes([rest[2], rest[3]]);
                let external_port = u16::from_be_bytes([rest[4], rest[5]]);
                let lifetime_seconds = u32::from_be_bytes([rest[6], rest[7], rest[8], rest[9]]);
                Some(Request::Mapping {
                    local_port,
                    external_port,
                    lifetime_seconds,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_external_address() {
        assert_eq!(Request::ExternalAddress.encode(), vec![0, 0]);
    }

    #[test]
    fn test_encode_mapping_layout() {
        let encoded = Request::symmetric_mapping(51000, 604800).encode();
        assert_eq!(encoded.len(), Request::MAPPING_SIZE);
        assert_eq!(
            encoded,
            vec![0, 1, 0, 0, 0xc7, 0x38, 0xc7, 0x38, 0x00, 0x09, 0x3a, 0x80]
        );
    }

    #[test]
    fn test_encode_delete_mapping() {
        let encoded = Request::symmetric_mapping(7000, 0).encode();
        assert_eq!(&encoded[8..], &[0, 0, 0, 0]);
        assert_eq!(
            Request::decode(&encoded),
            Some(Request::Mapping {
                local_port: 7000,
                external_port: 7000,
                lifetime_seconds: 0
            })
        );
    }
}
