//! A NAT-PMP response encoding and decoding.

use std::net::Ipv4Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{Opcode, Request, Version};

/// A NAT-PMP successful Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Response to a [`Opcode::DetermineExternalAddress`] request.
    PublicAddress {
        /// Epoch time of the server.
        epoch_time: u32,
        /// External address of the gateway.
        public_ip: Ipv4Addr,
    },
    /// Response to a [`Opcode::MapUdp`] request.
    PortMap {
        /// Epoch time of the server.
        epoch_time: u32,
        /// Local port for which the mapping was created.
        private_port: u16,
        /// External port registered for this mapping.
        external_port: u16,
        /// Lifetime in seconds that can be assumed by this mapping.
        lifetime_seconds: u32,
    },
}

/// Result code obtained in a NAT-PMP response.
///
/// See [RFC 6886 Result Codes](https://datatracker.ietf.org/doc/html/rfc6886#section-3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    /// A successful response.
    Success = 0,
    /// The sent version is not supported by the NAT-PMP server.
    UnsupportedVersion = 1,
    /// Functionality is suported but not allowerd: e.g. box supports mapping, but user has turned
    /// feature off.
    NotAuthorizedOrRefused = 2,
    /// Netfork failures, e.g. NAT device itself has not obtained a DHCP lease.
    NetworkFailure = 3,
    /// NAT-PMP server cannot create any more mappings at this time.
    OutOfResources = 4,
    /// Opcode is not supported by the server.
    UnsupportedOpcode = 5,
}

/// Errors that can occur when decoding a [`Response`] from a server.
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// Response is too short, has an unknown version or is not a response at all.
    #[display("Response is malformed")]
    Malformed,
    /// The response answers a different request.
    #[display("Response opcode {received:#04x} does not answer a {expected:?} request")]
    OpcodeMismatch {
        /// Opcode of the request that was sent.
        expected: Opcode,
        /// Opcode byte received, including the [`Response::RESPONSE_INDICATOR`].
        received: u8,
    },
    /// The server understood the request and refused it.
    #[display("Server refused the request with result code {_0} ({})", describe_result_code(*_0))]
    ResultCode(u16),
}

impl Error {
    /// Whether a datagram producing this error should be ignored while waiting for the actual
    /// response.
    pub fn is_stray(&self) -> bool {
        matches!(self, Error::Malformed | Error::OpcodeMismatch { .. })
    }
}

fn describe_result_code(code: u16) -> &'static str {
    match ResultCode::try_from(code) {
        Ok(ResultCode::Success) => "success",
        Ok(ResultCode::UnsupportedVersion) => "unsupported version",
        Ok(ResultCode::NotAuthorizedOrRefused) => "not authorized or refused",
        Ok(ResultCode::NetworkFailure) => "network failure",
        Ok(ResultCode::OutOfResources) => "out of resources",
        Ok(ResultCode::UnsupportedOpcode) => "unsupported opcode",
        Err(_) => "unknown",
    }
}

impl Response {
    /// Size of the header common to all responses.
    pub const HEADER_SIZE: usize = 1 + // version
        1 + // opcode
        2; // result code

    /// Size of an encoded [`Response::PublicAddress`].
    pub const PUBLIC_ADDRESS_SIZE: usize = Self::HEADER_SIZE +
        4 + // epoch time
        4; // public ip

    /// Size of an encoded [`Response::PortMap`].
    pub const PORT_MAP_SIZE: usize = Self::HEADER_SIZE +
        4 + // epoch time
        2 + // private port
        2 + // public port
        4; // lifetime

    /// Indicator ORd into the [`Opcode`] to indicate a response packet.
    pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;

    /// Decode a response to a request with the `expected` [`Opcode`].
    ///
    /// Bytes past the layout of the response are ignored.
    pub fn decode(buf: &[u8], expected: Opcode) -> Result<Self, Error> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(Error::Malformed);
        }
        Version::try_from(buf[0]).map_err(|_| Error::Malformed)?;

        let received = buf[1];
        if received & Self::RESPONSE_INDICATOR != Self::RESPONSE_INDICATOR {
            return Err(Error::Malformed);
        }
        if received != Self::RESPONSE_INDICATOR | u8::from(expected) {
            return Err(Error::OpcodeMismatch { expected, received });
        }

        let result_code = u16::from_be_bytes([buf[2], buf[3]]);
        if result_code != u16::from(ResultCode::Success) {
            return Err(Error::ResultCode(result_code));
        }

        let response = match expected {
            Opcode::DetermineExternalAddress => {
                if buf.len() < Self::PUBLIC_ADDRESS_SIZE {
                    return Err(Error::Malformed);
                }
                Response::PublicAddress {
                    epoch_time: read_u32(&buf[4..8]),
                    public_ip: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
                }
            }
            Opcode::MapUdp => {
                if buf.len() < Self::PORT_MAP_SIZE {
                    return Err(Error::Malformed);
                }
                Response::PortMap {
                    epoch_time: read_u32(&buf[4..8]),
                    private_port: u16::from_be_bytes([buf[8], buf[9]]),
                    external_port: u16::from_be_bytes([buf[10], buf[11]]),
                    lifetime_seconds: read_u32(&buf[12..16]),
                }
            }
        };

        Ok(response)
    }

    /// [`Opcode`] of the request this response answers.
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::PublicAddress { .. } => Opcode::DetermineExternalAddress,
            Response::PortMap { .. } => Opcode::MapUdp,
        }
    }

    /// Whether this response can be the answer to `request`.
    ///
    /// A mapping answer must be for the requested internal port, and grant a lifetime only if one
    /// was requested. Anything else answers an earlier exchange on the same socket.
    pub fn answers(&self, request: &Request) -> bool {
        match (self, request) {
            (Response::PublicAddress { .. }, Request::ExternalAddress) => true,
            (
                Response::PortMap {
                    private_port,
                    lifetime_seconds: granted,
                    ..
                },
                Request::Mapping {
                    local_port,
                    lifetime_seconds: requested,
                    ..
                },
            ) => private_port == local_port && (*granted == 0) == (*requested == 0),
            _ => false,
        }
    }

    /// Encode this response, as a server would.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Self::encode_header(self.opcode(), ResultCode::Success.into());
        match self {
            Response::PublicAddress {
                epoch_time,
                public_ip,
            } => {
                buf.extend_from_slice(&epoch_time.to_be_bytes());
                buf.extend_from_slice(&public_ip.octets());
            }
            Response::PortMap {
                epoch_time,
                private_port,
                external_port,
                lifetime_seconds,
            } => {
                buf.extend_from_slice(&epoch_time.to_be_bytes());
                buf.extend_from_slice(&private_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
            }
        }
        buf
    }

    /// Encode an error response for the given [`Opcode`].
    ///
    /// Like conforming servers, the rest of the layout is sent zeroed.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn encode_error(opcode: Opcode, result_code: u16) -> Vec<u8> {
        let mut buf = Self::encode_header(opcode, result_code);
        let size = match opcode {
            Opcode::DetermineExternalAddress => Self::PUBLIC_ADDRESS_SIZE,
            Opcode::MapUdp => Self::PORT_MAP_SIZE,
        };
        buf.resize(size, 0);
        buf
    }

    #[cfg(any(test, feature = "test-utils"))]
    fn encode_header(opcode: Opcode, result_code: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::PORT_MAP_SIZE);
        buf.push(Version::NatPmp.into());
        buf.push(Self::RESPONSE_INDICATOR | u8::from(opcode));
        buf.extend_from_slice(&result_code.to_be_bytes());
        buf
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        match opcode {
            Opcode::DetermineExternalAddress => {
                let octects: [u8; 4] = rng.gen();
                Response::PublicAddress {
                    epoch_time: rng.gen(),
                    public_ip: octects.into(),
                }
            }
            Opcode::MapUdp => Response::PortMap {
                epoch_time: rng.gen(),
                private_port: rng.gen(),
                external_port: rng.gen(),
                lifetime_seconds: rng.gen(),
            },
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_pmp::protocol::Request;

    use rand::SeedableRng;

    #[test]
    fn test_decode_external_addr_response() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let response = Response::random(Opcode::DetermineExternalAddress, &mut gen);
        let encoded = response.encode();
        assert_eq!(
            Ok(response),
            Response::decode(&encoded, Opcode::DetermineExternalAddress)
        );
    }

    #[test]
    fn test_encode_decode_map_response() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let response = Response::random(Opcode::MapUdp, &mut rng);
        let encoded = response.encode();
        assert_eq!(Ok(response), Response::decode(&encoded, Opcode::MapUdp));
    }

    #[test]
    fn test_request_answered_by_hand_built_map_response() {
        let request = Request::symmetric_mapping(51000, 604800);
        let encoded = request.encode();
        assert_eq!(encoded[1], u8::from(Opcode::MapUdp));

        let bytes = [
            0, 0x81, 0, 0, // header
            0, 0, 0x10, 0, // epoch
            0xc7, 0x38, // private port
            0xc7, 0x38, // external port
            0x00, 0x09, 0x3a, 0x80, // lifetime
        ];
        let response = Response::decode(&bytes, request.opcode()).unwrap();
        assert_eq!(response.opcode(), request.opcode());
        assert_eq!(
            response,
            Response::PortMap {
                epoch_time: 4096,
                private_port: 51000,
                external_port: 51000,
                lifetime_seconds: 604800,
            }
        );
    }

    #[test]
    fn test_request_answered_by_hand_built_public_address_response() {
        let request = Request::ExternalAddress;
        let bytes = [0, 0x80, 0, 0, 0, 0, 0, 7, 203, 0, 113, 9];
        let response = Response::decode(&bytes, request.opcode()).unwrap();
        assert_eq!(
            response,
            Response::PublicAddress {
                epoch_time: 7,
                public_ip: Ipv4Addr::new(203, 0, 113, 9),
            }
        );
    }

    #[test]
    fn test_decode_short_header_is_malformed() {
        assert_eq!(
            Response::decode(&[0, 0x81, 0], Opcode::MapUdp),
            Err(Error::Malformed)
        );
        assert_eq!(Response::decode(&[], Opcode::MapUdp), Err(Error::Malformed));
    }

    #[test]
    fn test_decode_truncated_payload_is_malformed() {
        let encoded = Response::PortMap {
            epoch_time: 1,
            private_port: 2,
            external_port: 2,
            lifetime_seconds: 3,
        }
        .encode();
        assert_eq!(
            Response::decode(&encoded[..12], Opcode::MapUdp),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn test_decode_request_echo_is_malformed() {
        // a request reflected back has the response bit unset
        let echoed = Request::symmetric_mapping(4000, 60).encode();
        assert_eq!(
            Response::decode(&echoed, Opcode::MapUdp),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn test_decode_unknown_version_is_malformed() {
        let mut encoded = Response::PublicAddress {
            epoch_time: 0,
            public_ip: Ipv4Addr::LOCALHOST,
        }
        .encode();
        encoded[0] = 2;
        assert_eq!(
            Response::decode(&encoded, Opcode::DetermineExternalAddress),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn test_decode_opcode_mismatch() {
        let encoded = Response::PublicAddress {
            epoch_time: 0,
            public_ip: Ipv4Addr::LOCALHOST,
        }
        .encode();
        let err = Response::decode(&encoded, Opcode::MapUdp).unwrap_err();
        assert_eq!(
            err,
            Error::OpcodeMismatch {
                expected: Opcode::MapUdp,
                received: 0x80
            }
        );
        assert!(err.is_stray());
    }

    #[test]
    fn test_decode_result_code() {
        let encoded = Response::encode_error(Opcode::MapUdp, ResultCode::OutOfResources.into());
        let err = Response::decode(&encoded, Opcode::MapUdp).unwrap_err();
        assert_eq!(err, Error::ResultCode(4));
        assert!(!err.is_stray());
        assert!(err.to_string().contains("out of resources"));

        // reported even when a non-conforming server truncates the error response
        assert_eq!(
            Response::decode(&encoded[..4], Opcode::MapUdp),
            Err(Error::ResultCode(4))
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let response = Response::PublicAddress {
            epoch_time: 9,
            public_ip: Ipv4Addr::new(198, 51, 100, 1),
        };
        let mut encoded = response.encode();
        encoded.extend_from_slice(&[0xff; 8]);
        assert_eq!(
            Response::decode(&encoded, Opcode::DetermineExternalAddress),
            Ok(response)
        );
    }

    #[test]
    fn test_answers_matching_request() {
        let public = Response::PublicAddress {
            epoch_time: 1,
            public_ip: Ipv4Addr::new(198, 51, 100, 1),
        };
        assert!(public.answers(&Request::ExternalAddress));
        assert!(!public.answers(&Request::symmetric_mapping(4000, 60)));

        let mapped = Response::PortMap {
            epoch_time: 1,
            private_port: 4000,
            external_port: 4000,
            lifetime_seconds: 60,
        };
        assert!(mapped.answers(&Request::symmetric_mapping(4000, 3600)));
        assert!(!mapped.answers(&Request::symmetric_mapping(4001, 3600)));
        assert!(!mapped.answers(&Request::symmetric_mapping(4000, 0)));
        assert!(!mapped.answers(&Request::ExternalAddress));

        // the ack of a deletion is not the answer to a new mapping of the same port
        let deleted = Response::PortMap {
            epoch_time: 1,
            private_port: 4000,
            external_port: 0,
            lifetime_seconds: 0,
        };
        assert!(deleted.answers(&Request::symmetric_mapping(4000, 0)));
        assert!(!deleted.answers(&Request::symmetric_mapping(4000, 604800)));
    }
}
