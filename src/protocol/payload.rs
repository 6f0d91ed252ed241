//! The host-supplied types the wire protocol treats as opaque bytes:
//! the per-frame input record and the state-fingerprint used to gate
//! joins.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SessionError};

/// A host-defined, fixed-width input record. The core treats it as opaque,
/// serializable bytes and never inspects its contents.
pub trait Payload: Clone + Default + fmt::Debug + Send + Sync + 'static {
    /// Size in bytes on the wire. Fixed per type, so `Frame` messages need
    /// no length prefix.
    const WIRE_LEN: usize;

    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self>;
}

/// A host-defined, fixed-width configuration fingerprint, compared by a
/// host-supplied predicate. The core never interprets its contents.
pub trait Fingerprint: Clone + fmt::Debug + Eq + Send + Sync + 'static {
    const WIRE_LEN: usize;

    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self>;
}

fn decode_fixed<const N: usize>(buf: &mut Bytes) -> Result<[u8; N]> {
    if buf.remaining() < N {
        return Err(SessionError::MalformedMessage(format!(
            "expected {N} bytes, got {}",
            buf.remaining()
        )));
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

impl<const N: usize> Payload for [u8; N] {
    const WIRE_LEN: usize = N;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        decode_fixed::<N>(buf)
    }
}

impl<const N: usize> Fingerprint for [u8; N] {
    const WIRE_LEN: usize = N;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        decode_fixed::<N>(buf)
    }
}

/// The 6-byte controller record the original PCSX2 netplay core exchanges,
/// kept here as a ready-to-use `Payload` impl and as the reference for the
/// neutral default input substituted before the input delay has ramped up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerInput(pub [u8; 6]);

impl Default for ControllerInput {
    fn default() -> Self {
        // High bytes neutral-high, low bytes neutral-center: the original's
        // `defaultInput`.
        Self([0xFF, 0xFF, 0x7F, 0x7F, 0x7F, 0x7F])
    }
}

impl Payload for ControllerInput {
    const WIRE_LEN: usize = 6;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        <[u8; 6] as Payload>::decode(buf).map(ControllerInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_input_default_is_neutral() {
        assert_eq!(
            ControllerInput::default().0,
            [0xFF, 0xFF, 0x7F, 0x7F, 0x7F, 0x7F]
        );
    }

    #[test]
    fn fixed_array_round_trips() {
        let mut buf = BytesMut::new();
        let value = [1u8, 2, 3, 4];
        Payload::encode(&value, &mut buf);
        let mut frozen = buf.freeze();
        let decoded: [u8; 4] = Payload::decode(&mut frozen).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let mut frozen = Bytes::from_static(&[1, 2]);
        let decoded = <[u8; 4] as Payload>::decode(&mut frozen);
        assert!(decoded.is_err());
    }
}
