//! Peer-to-peer agent protocol.
//!
//! Frames carry an 8-byte little-endian length prefix. Requests are
//! `[opcode][body]`; responses echo the opcode: `[opcode][status][body]`.
//!
//! | Opcode | Request body | Response |
//! |---|---|---|
//! | `0x01` CAST | `mailbox:u64, message:bytes64` | `0x03` OK / `0x04` NOT_FOUND |
//! | `0x02` CONN | `is_return:u8, port:u16, name:str16, host:str16` | `0x01` OK |
//! | `0x03` QUERY_ALL | `requester:str16` | `0x05` + `count:u16, {port, name, host}*` / `0x06` |

use bytes::Bytes;

use beam_core::error::{BeamError, Result};
use beam_core::identity::NodeIdentity;
use beam_core::wire::{LengthPrefix, Packer, Unpacker, WireError};

use crate::mailbox::RoutineId;

/// Agent frames use the full 64-bit length prefix.
pub const PREFIX: LengthPrefix = LengthPrefix::U64;

/// `is_return` byte of a reciprocal CONN handshake.
pub const CONN_IS_RETURN: u8 = 0x07;
/// `is_return` byte of a first-hand CONN handshake.
pub const CONN_IS_NOT_RETURN: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Cast = 0x01,
    Conn = 0x02,
    QueryAll = 0x03,
}

impl TryFrom<u8> for Opcode {
    type Error = BeamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Cast),
            0x02 => Ok(Self::Conn),
            0x03 => Ok(Self::QueryAll),
            other => Err(BeamError::UnknownOpcode(other)),
        }
    }
}

/// Status byte of an agent response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentStatus {
    ConnOk = 0x01,
    /// Reserved. A reconnecting peer is always accepted.
    ConnNodeExist = 0x02,
    CastOk = 0x03,
    CastRoutineNotFound = 0x04,
    QueryAllOk = 0x05,
    QueryAllErr = 0x06,
}

impl TryFrom<u8> for AgentStatus {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x01 => Ok(Self::ConnOk),
            0x02 => Ok(Self::ConnNodeExist),
            0x03 => Ok(Self::CastOk),
            0x04 => Ok(Self::CastRoutineNotFound),
            0x05 => Ok(Self::QueryAllOk),
            0x06 => Ok(Self::QueryAllErr),
            other => Err(other),
        }
    }
}

/// A decoded agent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Cast {
        mailbox: RoutineId,
        message: Bytes,
    },
    Conn {
        is_return: bool,
        identity: NodeIdentity,
    },
    QueryAll {
        requester: String,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Cast { .. } => Opcode::Cast,
            Self::Conn { .. } => Opcode::Conn,
            Self::QueryAll { .. } => Opcode::QueryAll,
        }
    }

    pub fn encode(&self) -> std::result::Result<Bytes, WireError> {
        let mut p = Packer::new();
        p.put_u8(self.opcode() as u8);
        match self {
            Self::Cast { mailbox, message } => {
                p.put_u64(*mailbox).put_bytes64(message);
            }
            Self::Conn {
                is_return,
                identity,
            } => {
                p.put_u8(if *is_return {
                    CONN_IS_RETURN
                } else {
                    CONN_IS_NOT_RETURN
                })
                .put_u16(identity.port)
                .put_str16(&identity.name)?
                .put_str16(&identity.host)?;
            }
            Self::QueryAll { requester } => {
                p.put_str16(requester)?;
            }
        }
        Ok(p.finish())
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut u = Unpacker::new(payload);
        let request = match Opcode::try_from(u.get_u8()?)? {
            Opcode::Cast => Self::Cast {
                mailbox: u.get_u64()?,
                message: u.get_bytes64()?,
            },
            Opcode::Conn => {
                let is_return = u.get_u8()? == CONN_IS_RETURN;
                let port = u.get_u16()?;
                let name = u.get_str16()?;
                let host = u.get_str16()?;
                Self::Conn {
                    is_return,
                    identity: NodeIdentity::new(name, host, port),
                }
            }
            Opcode::QueryAll => Self::QueryAll {
                requester: u.get_str16()?,
            },
        };
        Ok(request)
    }
}

/// `[opcode][status]`
pub fn encode_status(opcode: Opcode, status: AgentStatus) -> Bytes {
    let mut p = Packer::new();
    p.put_u8(opcode as u8).put_u8(status as u8);
    p.finish()
}

/// QUERY_ALL success response listing `peers`.
pub fn encode_peer_list(peers: &[NodeIdentity]) -> std::result::Result<Bytes, WireError> {
    let count = u16::try_from(peers.len()).map_err(|_| WireError::FieldTooLong {
        len: peers.len(),
        max: u16::MAX as usize,
    })?;
    let mut p = Packer::new();
    p.put_u8(Opcode::QueryAll as u8)
        .put_u8(AgentStatus::QueryAllOk as u8)
        .put_u16(count);
    for peer in peers {
        p.put_u16(peer.port)
            .put_str16(&peer.name)?
            .put_str16(&peer.host)?;
    }
    Ok(p.finish())
}

/// Read the peers of a QUERY_ALL success body.
pub fn decode_peer_list(body: &mut Unpacker) -> Result<Vec<NodeIdentity>> {
    let count = body.get_u16()?;
    let mut peers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let port = body.get_u16()?;
        let name = body.get_str16()?;
        let host = body.get_str16()?;
        peers.push(NodeIdentity::new(name, host, port));
    }
    Ok(peers)
}

/// Check the echoed opcode and read the status byte. The returned unpacker
/// is positioned at the body.
pub fn decode_status(expected: Opcode, payload: Bytes) -> Result<(AgentStatus, Unpacker)> {
    let mut u = Unpacker::new(payload);
    let got = u.get_u8()?;
    if got != expected as u8 {
        return Err(BeamError::UnexpectedReply {
            expected: expected as u8,
            got,
        });
    }
    let status = AgentStatus::try_from(u.get_u8()?).map_err(|got| BeamError::UnexpectedReply {
        expected: expected as u8,
        got,
    })?;
    Ok((status, u))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_layout() {
        let req = Request::Conn {
            is_return: true,
            identity: NodeIdentity::new("a", "h", 0x0102),
        };
        let bytes = req.encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[0x02, 0x07, 0x02, 0x01, 0x01, 0x00, b'a', 0x01, 0x00, b'h']
        );
        assert_eq!(Request::decode(bytes).unwrap(), req);
    }

    #[test]
    fn test_cast_layout() {
        let req = Request::Cast {
            mailbox: 7,
            message: Bytes::from_static(b"hi"),
        };
        let bytes = req.encode().unwrap();
        assert_eq!(bytes.len(), 1 + 8 + 8 + 2);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 7);
        assert_eq!(bytes[9], 2);
        assert_eq!(&bytes[17..], b"hi");
    }

    #[test]
    fn test_cast_message_shorter_than_declared() {
        let mut p = Packer::new();
        p.put_u8(0x01).put_u64(1).put_u64(10);
        p.put_u8(b'x');
        let err = Request::decode(p.finish()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_peer_list() {
        let peers = vec![
            NodeIdentity::new("a", "127.0.0.1", 26130),
            NodeIdentity::new("b", "127.0.0.1", 26131),
        ];
        let reply = encode_peer_list(&peers).unwrap();
        let (status, mut body) = decode_status(Opcode::QueryAll, reply).unwrap();
        assert_eq!(status, AgentStatus::QueryAllOk);
        assert_eq!(decode_peer_list(&mut body).unwrap(), peers);
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            Request::decode(Bytes::from_static(&[0x42])),
            Err(BeamError::UnknownOpcode(0x42))
        ));
    }
}
