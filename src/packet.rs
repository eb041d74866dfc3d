//! Datagram framing.
//!
//! Every datagram starts with a 1-byte packet type. Data-bearing packets carry
//! a sequence number plus piggy-backed acknowledgement state; control packets
//! are the type byte and at most a few fixed fields. The packet-type set is
//! closed, and dispatch is a match over it.

use crate::{
  codec::{self, Decode, Encode},
  seq::Seq,
  Protocol,
};
use bytes::BufMut;

/// Wire discriminator, first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
  ConnectRequest = 1,
  ConnectAccepted = 2,
  ConnectRejected = 3,
  Unreliable = 4,
  Reliable = 5,
  Fragment = 6,
  Ack = 7,
  Disconnect = 8,
  KeepAlive = 9,
}

impl TryFrom<u8> for PacketType {
  type Error = codec::Error;

  fn try_from(value: u8) -> codec::Result<Self> {
    match value {
      1 => Ok(PacketType::ConnectRequest),
      2 => Ok(PacketType::ConnectAccepted),
      3 => Ok(PacketType::ConnectRejected),
      4 => Ok(PacketType::Unreliable),
      5 => Ok(PacketType::Reliable),
      6 => Ok(PacketType::Fragment),
      7 => Ok(PacketType::Ack),
      8 => Ok(PacketType::Disconnect),
      9 => Ok(PacketType::KeepAlive),
      _ => Err(codec::Error::InvalidKind("packet type")),
    }
  }
}

/// Why a connect request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
  /// The connection table is full.
  Capacity = 1,
  /// The application's `on_before_connect` declined.
  Policy = 2,
  /// The protocol token did not match.
  BadProtocol = 3,
}

impl TryFrom<u8> for RejectReason {
  type Error = codec::Error;

  fn try_from(value: u8) -> codec::Result<Self> {
    match value {
      1 => Ok(RejectReason::Capacity),
      2 => Ok(RejectReason::Policy),
      3 => Ok(RejectReason::BadProtocol),
      _ => Err(codec::Error::InvalidKind("reject reason")),
    }
  }
}

/// Piggy-backed acknowledgement state.
///
/// Bit `i` of `mask` set means `sequence - i` was received. A populated mask
/// always has bit 0 set (it describes `sequence` itself), so an all-zero mask
/// unambiguously means "no acknowledgement info".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckField {
  pub sequence: Seq,
  pub mask: u64,
}

impl AckField {
  pub const NONE: AckField = AckField { sequence: 0, mask: 0 };

  pub fn is_empty(&self) -> bool {
    self.mask == 0
  }
}

impl Encode for AckField {
  fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
    self.sequence.encode(buf);
    self.mask.encode(buf);
  }
}

impl Decode for AckField {
  fn decode<B: bytes::Buf>(buf: &mut B) -> codec::Result<Self> {
    let sequence = Seq::decode(buf)?;
    let mask = u64::decode(buf)?;
    Ok(Self { sequence, mask })
  }
}

/// Header shared by `Unreliable`, `Reliable` and `Fragment` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
  pub sequence: Seq,
  pub ack: AckField,
}

impl Encode for DataHeader {
  fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
    self.sequence.encode(buf);
    self.ack.encode(buf);
  }
}

impl Decode for DataHeader {
  fn decode<B: bytes::Buf>(buf: &mut B) -> codec::Result<Self> {
    let sequence = Seq::decode(buf)?;
    let ack = AckField::decode(buf)?;
    Ok(Self { sequence, ack })
  }
}

/// Extra fields carried by `Fragment` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
  /// Identifies the message this chunk belongs to.
  pub message_id: u16,
  pub index: u8,
  pub count: u8,
}

impl Encode for FragmentInfo {
  fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
    self.message_id.encode(buf);
    self.index.encode(buf);
    self.count.encode(buf);
  }
}

impl Decode for FragmentInfo {
  fn decode<B: bytes::Buf>(buf: &mut B) -> codec::Result<Self> {
    let message_id = u16::decode(buf)?;
    let index = u8::decode(buf)?;
    let count = u8::decode(buf)?;
    if count == 0 || index >= count {
      return Err(codec::Error::InvalidKind("fragment index"));
    }
    Ok(Self { message_id, index, count })
  }
}

/// type + sequence + ack sequence + ack mask
pub const DATA_HEADER_LEN: usize = 1 + 2 + 2 + 8;
/// data header + message id + index + count
pub const FRAGMENT_HEADER_LEN: usize = DATA_HEADER_LEN + 2 + 1 + 1;
/// type + ack sequence + ack mask
pub const ACK_PACKET_LEN: usize = 1 + 2 + 8;
/// type + protocol token
pub const CONNECT_REQUEST_LEN: usize = 1 + 8;

// Headers must leave room for at least one payload byte at the smallest
// allowed packet size (see `Config::validate`).
static_assertions::const_assert!(FRAGMENT_HEADER_LEN < crate::config::MIN_PACKET_SIZE);
static_assertions::const_assert!(CONNECT_REQUEST_LEN < crate::config::MIN_PACKET_SIZE);
static_assertions::const_assert!(ACK_PACKET_LEN < crate::config::MIN_PACKET_SIZE);

/// A decoded datagram, borrowing its payload from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
  ConnectRequest { protocol: Protocol },
  ConnectAccepted,
  ConnectRejected { reason: RejectReason },
  Data { reliable: bool, header: DataHeader, payload: &'a [u8] },
  Fragment { header: DataHeader, info: FragmentInfo, payload: &'a [u8] },
  Ack(AckField),
  Disconnect,
  KeepAlive,
}

/// Decode a whole datagram. Fails closed: truncated or unknown input yields an
/// error for the caller to count and drop, never a panic.
pub fn parse(datagram: &[u8]) -> codec::Result<Inbound<'_>> {
  let mut buf = datagram;
  let ty = PacketType::try_from(u8::decode(&mut buf)?)?;
  match ty {
    PacketType::ConnectRequest => {
      let protocol = Protocol(u64::decode(&mut buf)?);
      Ok(Inbound::ConnectRequest { protocol })
    }
    PacketType::ConnectAccepted => Ok(Inbound::ConnectAccepted),
    PacketType::ConnectRejected => {
      let reason = RejectReason::try_from(u8::decode(&mut buf)?)?;
      Ok(Inbound::ConnectRejected { reason })
    }
    PacketType::Unreliable | PacketType::Reliable => {
      let header = DataHeader::decode(&mut buf)?;
      Ok(Inbound::Data { reliable: ty == PacketType::Reliable, header, payload: buf })
    }
    PacketType::Fragment => {
      let header = DataHeader::decode(&mut buf)?;
      let info = FragmentInfo::decode(&mut buf)?;
      Ok(Inbound::Fragment { header, info, payload: buf })
    }
    PacketType::Ack => Ok(Inbound::Ack(AckField::decode(&mut buf)?)),
    PacketType::Disconnect => Ok(Inbound::Disconnect),
    PacketType::KeepAlive => Ok(Inbound::KeepAlive),
  }
}

pub fn write_connect_request<B: BufMut>(buf: &mut B, protocol: Protocol) {
  (PacketType::ConnectRequest as u8).encode(buf);
  protocol.0.encode(buf);
}

pub fn write_connect_accepted<B: BufMut>(buf: &mut B) {
  (PacketType::ConnectAccepted as u8).encode(buf);
}

pub fn write_connect_rejected<B: BufMut>(buf: &mut B, reason: RejectReason) {
  (PacketType::ConnectRejected as u8).encode(buf);
  (reason as u8).encode(buf);
}

pub fn write_data<B: BufMut>(buf: &mut B, reliable: bool, header: DataHeader, payload: &[u8]) {
  let ty = if reliable { PacketType::Reliable } else { PacketType::Unreliable };
  (ty as u8).encode(buf);
  header.encode(buf);
  buf.put(payload);
}

pub fn write_fragment<B: BufMut>(
  buf: &mut B,
  header: DataHeader,
  info: FragmentInfo,
  payload: &[u8],
) {
  (PacketType::Fragment as u8).encode(buf);
  header.encode(buf);
  info.encode(buf);
  buf.put(payload);
}

pub fn write_ack<B: BufMut>(buf: &mut B, ack: AckField) {
  (PacketType::Ack as u8).encode(buf);
  ack.encode(buf);
}

pub fn write_disconnect<B: BufMut>(buf: &mut B) {
  (PacketType::Disconnect as u8).encode(buf);
}

pub fn write_keep_alive<B: BufMut>(buf: &mut B) {
  (PacketType::KeepAlive as u8).encode(buf);
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn data_round_trip() {
    let header = DataHeader {
      sequence: 17,
      ack: AckField { sequence: 12, mask: 0b1011 },
    };
    let mut buf = Vec::new();
    write_data(&mut buf, true, header, b"hello");
    assert_eq!(buf.len(), DATA_HEADER_LEN + 5);
    assert_eq!(
      parse(&buf).unwrap(),
      Inbound::Data { reliable: true, header, payload: b"hello" }
    );

    let mut buf = Vec::new();
    write_data(&mut buf, false, header, b"");
    assert_eq!(
      parse(&buf).unwrap(),
      Inbound::Data { reliable: false, header, payload: b"" }
    );
  }

  #[test]
  fn fragment_round_trip() {
    let header = DataHeader { sequence: 3, ack: AckField::NONE };
    let info = FragmentInfo { message_id: 9, index: 1, count: 4 };
    let mut buf = Vec::new();
    write_fragment(&mut buf, header, info, &[0xAB; 32]);
    assert_eq!(buf.len(), FRAGMENT_HEADER_LEN + 32);
    match parse(&buf).unwrap() {
      Inbound::Fragment { header: h, info: i, payload } => {
        assert_eq!(h, header);
        assert_eq!(i, info);
        assert_eq!(payload, &[0xAB; 32]);
      }
      other => panic!("decoded {other:?}"),
    }
  }

  #[test]
  fn control_packets_round_trip() {
    let mut buf = Vec::new();
    write_connect_request(&mut buf, Protocol(0xFEED));
    assert_eq!(buf.len(), CONNECT_REQUEST_LEN);
    assert_eq!(parse(&buf).unwrap(), Inbound::ConnectRequest { protocol: Protocol(0xFEED) });

    let mut buf = Vec::new();
    write_connect_rejected(&mut buf, RejectReason::Capacity);
    assert_eq!(
      parse(&buf).unwrap(),
      Inbound::ConnectRejected { reason: RejectReason::Capacity }
    );

    let mut buf = Vec::new();
    let ack = AckField { sequence: 2, mask: 0b11 };
    write_ack(&mut buf, ack);
    assert_eq!(buf.len(), ACK_PACKET_LEN);
    assert_eq!(parse(&buf).unwrap(), Inbound::Ack(ack));

    for (write, expect) in [
      (write_connect_accepted as fn(&mut Vec<u8>), Inbound::ConnectAccepted),
      (write_disconnect, Inbound::Disconnect),
      (write_keep_alive, Inbound::KeepAlive),
    ] {
      let mut buf = Vec::new();
      write(&mut buf);
      assert_eq!(buf.len(), 1);
      assert_eq!(parse(&buf).unwrap(), expect);
    }
  }

  #[test]
  fn malformed_input_is_rejected_not_panicked() {
    // empty
    assert!(parse(&[]).is_err());
    // unknown type
    assert!(parse(&[0xFF, 0, 0]).is_err());
    // truncated data header
    assert!(parse(&[PacketType::Reliable as u8, 0, 1, 0]).is_err());
    // fragment with index >= count
    let header = DataHeader { sequence: 0, ack: AckField::NONE };
    let mut buf = Vec::new();
    write_fragment(&mut buf, header, FragmentInfo { message_id: 0, index: 0, count: 1 }, b"x");
    buf[DATA_HEADER_LEN + 2] = 5; // index
    buf[DATA_HEADER_LEN + 3] = 2; // count
    assert!(parse(&buf).is_err());
  }
}
