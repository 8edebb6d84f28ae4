use std::io::Cursor;

use md5::{Digest, Md5};
use serde::Serialize;
use thiserror::Error;

use crate::keygate::codec::{self, CodecError, Packet};

pub const HANDSHAKE_PACKET_ID: u8 = 0x00;
pub const LOGIN_START_PACKET_ID: u8 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: u8 = 0x00;

pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;

/// Forge appends mod metadata after a NUL; BungeeCord-style "real IP"
/// plugins append it after "///". Only the first segment is the hostname.
const FORGE_SEPARATOR: char = '\0';
const REAL_IP_SEPARATOR: &str = "///";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacketId(u8),
    #[error("signed login payloads are not supported")]
    SignedLoginData,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// First packet of every connection: picks status or login mode and names
/// the virtual host the client dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub raw_address: String,
    /// `raw_address` with forge/real-ip suffixes stripped.
    pub address: String,
    pub port: u16,
    pub next_state: i32,
}

impl Handshake {
    /// Trailing unread bytes in the payload are tolerated; some launchers
    /// pad the handshake.
    pub fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        if packet.id != HANDSHAKE_PACKET_ID {
            return Err(ProtocolError::UnexpectedPacketId(packet.id));
        }

        let mut r = Cursor::new(packet.payload.as_slice());
        let protocol_version = codec::read_varint(&mut r)?;
        let raw_address = codec::read_string(&mut r, codec::MAX_NAME_BYTES)?;
        let port = codec::read_u16_be(&mut r)?;
        let next_state = codec::read_varint(&mut r)?;

        let address = first_address_segment(&raw_address).to_string();

        Ok(Self {
            protocol_version,
            raw_address,
            address,
            port,
            next_state,
        })
    }

    /// Re-encodes with the raw address, so forge/real-ip metadata survives
    /// the trip to the backend.
    pub fn to_packet(&self) -> Packet {
        let mut payload = Vec::with_capacity(self.raw_address.len() + 8);
        codec::put_varint(&mut payload, self.protocol_version);
        codec::put_string(&mut payload, &self.raw_address);
        codec::put_u16_be(&mut payload, self.port);
        codec::put_varint(&mut payload, self.next_state);
        Packet {
            id: HANDSHAKE_PACKET_ID,
            payload,
        }
    }
}

fn first_address_segment(raw: &str) -> &str {
    let s = raw.split(FORGE_SEPARATOR).next().unwrap_or(raw);
    s.split(REAL_IP_SEPARATOR).next().unwrap_or(s)
}

/// The shape of login-start depends on the protocol version announced in
/// the handshake. Four layouts cover every version the proxy accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// 1.18.2 and older: just the name.
    Legacy,
    /// 1.19 - 1.19.2: name, signature-data flag, optional id.
    V759,
    /// 1.19.3 - 1.20.1: name, optional id.
    V761,
    /// 1.20.2 and newer: name, id always present.
    V764,
}

impl Dialect {
    pub fn for_protocol(version: i32) -> Self {
        match version {
            v if v <= 758 => Dialect::Legacy,
            759..=760 => Dialect::V759,
            761..=763 => Dialect::V761,
            _ => Dialect::V764,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStart {
    Legacy {
        name: String,
    },
    V759 {
        name: String,
        has_id: bool,
        id: [u8; 16],
    },
    V761 {
        name: String,
        has_id: bool,
        id: [u8; 16],
    },
    V764 {
        name: String,
        id: [u8; 16],
    },
}

impl LoginStart {
    pub fn decode(packet: &Packet, protocol_version: i32) -> Result<Self, ProtocolError> {
        if packet.id != LOGIN_START_PACKET_ID {
            return Err(ProtocolError::UnexpectedPacketId(packet.id));
        }

        let mut r = Cursor::new(packet.payload.as_slice());
        let name = codec::read_string(&mut r, codec::MAX_NAME_BYTES)?;

        match Dialect::for_protocol(protocol_version) {
            Dialect::Legacy => Ok(LoginStart::Legacy { name }),
            Dialect::V759 => {
                if codec::read_u8(&mut r)? != 0 {
                    return Err(ProtocolError::SignedLoginData);
                }
                let has_id = codec::read_u8(&mut r)? != 0;
                let id = if has_id {
                    codec::read_id128(&mut r)?
                } else {
                    [0u8; 16]
                };
                Ok(LoginStart::V759 { name, has_id, id })
            }
            Dialect::V761 => {
                let has_id = codec::read_u8(&mut r)? != 0;
                let id = if has_id {
                    codec::read_id128(&mut r)?
                } else {
                    [0u8; 16]
                };
                Ok(LoginStart::V761 { name, has_id, id })
            }
            Dialect::V764 => {
                let id = codec::read_id128(&mut r)?;
                Ok(LoginStart::V764 { name, id })
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LoginStart::Legacy { name }
            | LoginStart::V759 { name, .. }
            | LoginStart::V761 { name, .. }
            | LoginStart::V764 { name, .. } => name,
        }
    }

    /// Replaces the identity with the canonical name. Dialects that carry
    /// an id get the deterministic offline id for that name; the id flag
    /// is forced on so the backend never guesses.
    pub fn rewrite(&mut self, canonical: &str) {
        let new_id = offline_player_id(canonical);
        match self {
            LoginStart::Legacy { name } => *name = canonical.to_string(),
            LoginStart::V759 { name, has_id, id } | LoginStart::V761 { name, has_id, id } => {
                *name = canonical.to_string();
                *has_id = true;
                *id = new_id;
            }
            LoginStart::V764 { name, id } => {
                *name = canonical.to_string();
                *id = new_id;
            }
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut payload = Vec::with_capacity(40);
        match self {
            LoginStart::Legacy { name } => {
                codec::put_string(&mut payload, name);
            }
            LoginStart::V759 { name, has_id, id } => {
                codec::put_string(&mut payload, name);
                codec::put_u8(&mut payload, 0);
                codec::put_u8(&mut payload, u8::from(*has_id));
                if *has_id {
                    codec::put_id128(&mut payload, id);
                }
            }
            LoginStart::V761 { name, has_id, id } => {
                codec::put_string(&mut payload, name);
                codec::put_u8(&mut payload, u8::from(*has_id));
                if *has_id {
                    codec::put_id128(&mut payload, id);
                }
            }
            LoginStart::V764 { name, id } => {
                codec::put_string(&mut payload, name);
                codec::put_id128(&mut payload, id);
            }
        }
        Packet {
            id: LOGIN_START_PACKET_ID,
            payload,
        }
    }
}

/// The id an offline-mode server derives for a player name, per Java's
/// `UUID.nameUUIDFromBytes`: MD5 of `"OfflinePlayer:" + name` with the
/// version nibble set to 3 and the IETF variant bits set.
pub fn offline_player_id(name: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(b"OfflinePlayer:");
    hasher.update(name.as_bytes());
    let mut id: [u8; 16] = hasher.finalize().into();
    id[6] = (id[6] & 0x0f) | 0x30;
    id[8] = (id[8] & 0x3f) | 0x80;
    id
}

#[derive(Debug, Serialize)]
struct StatusResponse<'a> {
    version: StatusVersion<'a>,
    description: StatusDescription<'a>,
    favicon: &'a str,
}

#[derive(Debug, Serialize)]
struct StatusVersion<'a> {
    name: &'a str,
    protocol: i32,
}

#[derive(Debug, Serialize)]
struct StatusDescription<'a> {
    text: &'a str,
}

/// Status reply sent when the backend cannot be reached: a generic server
/// name, the client's own protocol version, and an "Offline" banner.
pub fn offline_status_packet(protocol_version: i32) -> Result<Packet, serde_json::Error> {
    let body = StatusResponse {
        version: StatusVersion {
            name: "Some server",
            protocol: protocol_version,
        },
        description: StatusDescription { text: "Offline" },
        favicon: "",
    };
    let json = serde_json::to_string(&body)?;

    let mut payload = Vec::with_capacity(json.len() + 4);
    codec::put_string(&mut payload, &json);
    Ok(Packet {
        id: STATUS_RESPONSE_PACKET_ID,
        payload,
    })
}
