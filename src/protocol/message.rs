//! The control message wire format.
//!
//! One byte tag, then variant-specific fields in declared order, integers
//! little-endian. `decode(encode(m)) == m` for every variant.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    endpoint::Endpoint,
    error::{Result, SessionError},
    protocol::payload::{Fingerprint, Payload},
};

const ENDPOINT_WIRE_LEN: usize = 6; // 4-byte IPv4 + 2-byte port

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    None = 0,
    Frame = 1,
    Ping = 2,
    Join = 3,
    Deny = 4,
    Info = 5,
    Wait = 6,
    Delay = 7,
    Ready = 8,
}

impl TryFrom<u8> for Tag {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Tag::None,
            1 => Tag::Frame,
            2 => Tag::Ping,
            3 => Tag::Join,
            4 => Tag::Deny,
            5 => Tag::Info,
            6 => Tag::Wait,
            7 => Tag::Delay,
            8 => Tag::Ready,
            other => return Err(SessionError::MalformedMessage(format!("unknown tag {other}"))),
        })
    }
}

/// A control message exchanged between peers, generic over the host's
/// frame payload and state fingerprint types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage<P: Payload, F: Fingerprint> {
    /// Keepalive/ack.
    None,
    /// Input for a future frame.
    Frame { frame_id: i64, payload: P },
    /// RTT probe.
    Ping,
    /// Join request.
    Join { state: F, host_ep: Endpoint },
    /// Join rejected.
    Deny { state: F },
    /// Roster assignment.
    Info {
        rand_seed: u32,
        side: u8,
        eps: Vec<Endpoint>,
        state: F,
    },
    /// Reserved; unused on the wire by the core.
    Wait { peers_needed: u8, peers_count: u8 },
    /// Negotiated input delay, in frames.
    Delay { delay: u8 },
    /// Peer has accepted delay and is armed.
    Ready,
}

fn encode_endpoint(ep: Endpoint, buf: &mut BytesMut) {
    buf.put_slice(&ep.addr.octets());
    buf.put_u16_le(ep.port);
}

fn decode_endpoint(buf: &mut Bytes) -> Result<Endpoint> {
    if buf.remaining() < ENDPOINT_WIRE_LEN {
        return Err(SessionError::MalformedMessage(
            "truncated endpoint".to_string(),
        ));
    }
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u16_le();
    Ok(Endpoint::new(octets.into(), port))
}

impl<P: Payload, F: Fingerprint> ControlMessage<P, F> {
    /// Serializes this message into `buf`, appending to whatever is
    /// already there.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ControlMessage::None => buf.put_u8(Tag::None as u8),
            ControlMessage::Frame { frame_id, payload } => {
                buf.put_u8(Tag::Frame as u8);
                buf.put_i64_le(*frame_id);
                payload.encode(buf);
            }
            ControlMessage::Ping => buf.put_u8(Tag::Ping as u8),
            ControlMessage::Join { state, host_ep } => {
                buf.put_u8(Tag::Join as u8);
                state.encode(buf);
                encode_endpoint(*host_ep, buf);
            }
            ControlMessage::Deny { state } => {
                buf.put_u8(Tag::Deny as u8);
                state.encode(buf);
            }
            ControlMessage::Info {
                rand_seed,
                side,
                eps,
                state,
            } => {
                buf.put_u8(Tag::Info as u8);
                buf.put_u32_le(*rand_seed);
                buf.put_u8(*side);
                buf.put_u64_le(eps.len() as u64);
                for ep in eps {
                    encode_endpoint(*ep, buf);
                }
                state.encode(buf);
            }
            ControlMessage::Wait {
                peers_needed,
                peers_count,
            } => {
                buf.put_u8(Tag::Wait as u8);
                buf.put_u8(*peers_needed);
                buf.put_u8(*peers_count);
            }
            ControlMessage::Delay { delay } => {
                buf.put_u8(Tag::Delay as u8);
                buf.put_u8(*delay);
            }
            ControlMessage::Ready => buf.put_u8(Tag::Ready as u8),
        }
    }

    /// Parses a message out of `bytes`. Returns `MalformedMessage` on an
    /// unknown tag or a truncated payload; never panics on attacker input.
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.is_empty() {
            return Err(SessionError::MalformedMessage("empty datagram".into()));
        }
        let tag = Tag::try_from(bytes.get_u8())?;
        Ok(match tag {
            Tag::None => ControlMessage::None,
            Tag::Frame => {
                if bytes.remaining() < 8 {
                    return Err(SessionError::MalformedMessage("truncated frame_id".into()));
                }
                let frame_id = bytes.get_i64_le();
                let payload = P::decode(&mut bytes)?;
                ControlMessage::Frame { frame_id, payload }
            }
            Tag::Ping => ControlMessage::Ping,
            Tag::Join => {
                let state = F::decode(&mut bytes)?;
                let host_ep = decode_endpoint(&mut bytes)?;
                ControlMessage::Join { state, host_ep }
            }
            Tag::Deny => {
                let state = F::decode(&mut bytes)?;
                ControlMessage::Deny { state }
            }
            Tag::Info => {
                if bytes.remaining() < 4 + 1 + 8 {
                    return Err(SessionError::MalformedMessage("truncated info header".into()));
                }
                let rand_seed = bytes.get_u32_le();
                let side = bytes.get_u8();
                let count = bytes.get_u64_le();
                if bytes.remaining() < (count as usize).saturating_mul(ENDPOINT_WIRE_LEN) {
                    return Err(SessionError::MalformedMessage(
                        "roster count exceeds remaining datagram length".into(),
                    ));
                }
                let mut eps = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    eps.push(decode_endpoint(&mut bytes)?);
                }
                let state = F::decode(&mut bytes)?;
                ControlMessage::Info {
                    rand_seed,
                    side,
                    eps,
                    state,
                }
            }
            Tag::Wait => {
                if bytes.remaining() < 2 {
                    return Err(SessionError::MalformedMessage("truncated wait".into()));
                }
                let peers_needed = bytes.get_u8();
                let peers_count = bytes.get_u8();
                ControlMessage::Wait {
                    peers_needed,
                    peers_count,
                }
            }
            Tag::Delay => {
                if bytes.remaining() < 1 {
                    return Err(SessionError::MalformedMessage("truncated delay".into()));
                }
                ControlMessage::Delay {
                    delay: bytes.get_u8(),
                }
            }
            Tag::Ready => ControlMessage::Ready,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::protocol::payload::ControllerInput;

    type Msg = ControlMessage<ControllerInput, [u8; 1]>;

    fn roundtrip(msg: Msg) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let decoded = Msg::decode(buf.freeze()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_every_variant() {
        let ep = |p: u16| Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), p);

        roundtrip(Msg::None);
        roundtrip(Msg::Ping);
        roundtrip(Msg::Ready);
        roundtrip(Msg::Frame {
            frame_id: -1,
            payload: ControllerInput::default(),
        });
        roundtrip(Msg::Join {
            state: [7],
            host_ep: ep(7000),
        });
        roundtrip(Msg::Deny { state: [9] });
        roundtrip(Msg::Wait {
            peers_needed: 4,
            peers_count: 2,
        });
        roundtrip(Msg::Delay { delay: 3 });
    }

    #[test]
    fn round_trips_rosters_from_one_to_eight_endpoints() {
        for n in 1..=8u16 {
            let eps: Vec<Endpoint> = (0..n)
                .map(|i| Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 7000 + i))
                .collect();
            roundtrip(Msg::Info {
                rand_seed: 0xDEAD_BEEF,
                side: (n - 1) as u8,
                eps,
                state: [1],
            });
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let bytes = Bytes::from_static(&[0xEE]);
        assert!(Msg::decode(bytes).is_err());
    }

    #[test]
    fn decode_rejects_empty_datagram() {
        assert!(Msg::decode(Bytes::new()).is_err());
    }

    #[test]
    fn decode_rejects_info_with_count_exceeding_remaining_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u8(Tag::Info as u8);
        buf.put_u32_le(0xDEAD_BEEF);
        buf.put_u8(0);
        buf.put_u64_le(u64::MAX); // claims far more endpoints than the datagram holds
        assert!(Msg::decode(buf.freeze()).is_err());
    }
}
