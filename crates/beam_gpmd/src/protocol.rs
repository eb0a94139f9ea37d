//! GPMD wire protocol.
//!
//! Every frame carries a 2-byte little-endian length prefix. Requests are
//! `[opcode][body]`; responses are `[opcode][status][body]`.
//!
//! | Opcode | Request body | Response body |
//! |---|---|---|
//! | `0x01` REGISTER | `port:u16, name:str16, host:str16` | `status` |
//! | `0x02` UNREGISTER | `name:str16` | `status` |
//! | `0x03` QUERY | `name:str16` | `status`, then `port:u16, name:str16` if OK |

use bytes::Bytes;

use beam_core::error::{BeamError, Result};
use beam_core::identity::NodeIdentity;
use beam_core::wire::{LengthPrefix, Packer, Unpacker, WireError};

/// Registry frames use a 16-bit length prefix.
pub const PREFIX: LengthPrefix = LengthPrefix::U16;

/// Largest payload a registry frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Register = 0x01,
    Unregister = 0x02,
    Query = 0x03,
}

impl TryFrom<u8> for Opcode {
    type Error = BeamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Register),
            0x02 => Ok(Self::Unregister),
            0x03 => Ok(Self::Query),
            other => Err(BeamError::UnknownOpcode(other)),
        }
    }
}

/// Status byte of a registry response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistryStatus {
    Ok = 0x00,
    NodeExist = 0x01,
    NodeNotExist = 0x02,
}

impl TryFrom<u8> for RegistryStatus {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::NodeExist),
            0x02 => Ok(Self::NodeNotExist),
            other => Err(other),
        }
    }
}

/// Body of a successful QUERY response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryReply {
    pub port: u16,
    pub name: String,
}

/// A decoded registry request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register(NodeIdentity),
    Unregister { name: String },
    Query { name: String },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Register(_) => Opcode::Register,
            Self::Unregister { .. } => Opcode::Unregister,
            Self::Query { .. } => Opcode::Query,
        }
    }

    pub fn encode(&self) -> std::result::Result<Bytes, WireError> {
        let mut p = Packer::new();
        p.put_u8(self.opcode() as u8);
        match self {
            Self::Register(identity) => {
                p.put_u16(identity.port)
                    .put_str16(&identity.name)?
                    .put_str16(&identity.host)?;
            }
            Self::Unregister { name } | Self::Query { name } => {
                p.put_str16(name)?;
            }
        }
        Ok(p.finish())
    }

    /// Decode a request payload. Unknown opcodes and short bodies are errors.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut u = Unpacker::new(payload);
        let opcode = Opcode::try_from(u.get_u8()?)?;
        let request = match opcode {
            Opcode::Register => {
                let port = u.get_u16()?;
                let name = u.get_str16()?;
                let host = u.get_str16()?;
                Self::Register(NodeIdentity::new(name, host, port))
            }
            Opcode::Unregister => Self::Unregister {
                name: u.get_str16()?,
            },
            Opcode::Query => Self::Query {
                name: u.get_str16()?,
            },
        };
        Ok(request)
    }
}

/// `[opcode][status]`
pub fn encode_status(opcode: Opcode, status: RegistryStatus) -> Bytes {
    let mut p = Packer::new();
    p.put_u8(opcode as u8).put_u8(status as u8);
    p.finish()
}

/// QUERY response: OK with the entry, or NODE_NOT_EXIST with no body.
pub fn encode_query_reply(
    reply: Option<&QueryReply>,
) -> std::result::Result<Bytes, WireError> {
    let Some(reply) = reply else {
        return Ok(encode_status(Opcode::Query, RegistryStatus::NodeNotExist));
    };
    let mut p = Packer::new();
    p.put_u8(Opcode::Query as u8)
        .put_u8(RegistryStatus::Ok as u8)
        .put_u16(reply.port)
        .put_str16(&reply.name)?;
    Ok(p.finish())
}

/// Check the echoed opcode of a response and read its status byte. The
/// returned unpacker is positioned at the response body.
pub fn decode_status(expected: Opcode, payload: Bytes) -> Result<(RegistryStatus, Unpacker)> {
    let mut u = Unpacker::new(payload);
    let got = u.get_u8()?;
    if got != expected as u8 {
        return Err(BeamError::UnexpectedReply {
            expected: expected as u8,
            got,
        });
    }
    let raw = u.get_u8()?;
    let status = RegistryStatus::try_from(raw).map_err(|status| BeamError::UnexpectedReply {
        expected: expected as u8,
        got: status,
    })?;
    Ok((status, u))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_layout() {
        let req = Request::Register(NodeIdentity::new("ab", "h", 26130));
        let bytes = req.encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[0x01, 0x12, 0x66, 0x02, 0x00, b'a', b'b', 0x01, 0x00, b'h']
        );
        assert_eq!(Request::decode(bytes).unwrap(), req);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let err = Request::decode(Bytes::from_static(&[0x7f, 0x00, 0x00])).unwrap_err();
        assert!(matches!(err, BeamError::UnknownOpcode(0x7f)));
    }

    #[test]
    fn test_truncated_request_rejected() {
        // REGISTER with a name length of 5 but only 2 bytes of name.
        let err = Request::decode(Bytes::from_static(&[0x01, 0x00, 0x01, 0x05, 0x00, b'a', b'b']))
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_query_reply_shapes() {
        let missing = encode_query_reply(None).unwrap();
        assert_eq!(&missing[..], &[0x03, 0x02]);

        let found = encode_query_reply(Some(&QueryReply {
            port: 26130,
            name: "agent_name".into(),
        }))
        .unwrap();
        let (status, mut body) = decode_status(Opcode::Query, found).unwrap();
        assert_eq!(status, RegistryStatus::Ok);
        assert_eq!(body.get_u16().unwrap(), 26130);
        assert_eq!(body.get_str16().unwrap(), "agent_name");
        assert!(body.is_empty());
    }

    #[test]
    fn test_decode_status_checks_echo() {
        let reply = encode_status(Opcode::Register, RegistryStatus::Ok);
        let err = decode_status(Opcode::Unregister, reply).unwrap_err();
        assert!(matches!(
            err,
            BeamError::UnexpectedReply {
                expected: 0x02,
                got: 0x01
            }
        ));
    }
}
