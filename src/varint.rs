//! Variable-length integer packing for payload framing.
//!
//! The transport's own headers are fixed-width; these primitives are for the
//! message layer above, which typically frames many small length and id
//! fields per payload. Two bits of the first byte encode the width, so values
//! are capped at `2^62 - 1`. Signed values go through zig-zag mapping first
//! so small negative numbers stay small on the wire.

use {
  crate::codec::{self, Decode, Encode},
  std::mem::size_of,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarInt(u64);

impl VarInt {
  pub const MAX: VarInt = VarInt((1 << 62) - 1);

  /// Creates a `VarInt` from a `u8`. This can never fail.
  pub const fn u8(value: u8) -> Self {
    Self(value as u64)
  }

  /// Creates a `VarInt` from a `u16`. This can never fail.
  pub const fn u16(value: u16) -> Self {
    Self(value as u64)
  }

  /// Creates a `VarInt` from a `u32`. This can never fail.
  pub const fn u32(value: u32) -> Self {
    Self(value as u64)
  }

  /// Creates a `VarInt` from a `u64`. Fails if `value > (1 << 62) - 1`.
  pub const fn u64(value: u64) -> Option<Self> {
    if value > Self::MAX.0 {
      None
    } else {
      Some(VarInt(value))
    }
  }

  /// Creates a `VarInt` from an `i64` via zig-zag mapping, so values close
  /// to zero encode in few bytes regardless of sign. Fails for magnitudes
  /// that zig-zag past the 62-bit cap.
  pub const fn zigzag(value: i64) -> Option<Self> {
    Self::u64(((value << 1) ^ (value >> 63)) as u64)
  }

  pub const fn value(self) -> u64 {
    self.0
  }

  /// Inverse of [`VarInt::zigzag`].
  pub const fn into_signed(self) -> i64 {
    ((self.0 >> 1) as i64) ^ -((self.0 & 1) as i64)
  }
}

impl Encode for VarInt {
  fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
    let v = self.0;
    if v < 2u64.pow(6) {
      (v as u8).encode(buf);
    } else if v < 2u64.pow(14) {
      (0b01 << 14 | v as u16).encode(buf);
    } else if v < 2u64.pow(30) {
      (0b10 << 30 | v as u32).encode(buf);
    } else {
      (0b11 << 62 | v).encode(buf);
    }
  }
}

impl Decode for VarInt {
  fn decode<B: bytes::Buf>(buf: &mut B) -> codec::Result<Self> {
    if buf.remaining() < 1 {
      return Err(codec::Error::UnexpectedEof);
    }

    let mut data = [buf.get_u8(), 0, 0, 0, 0, 0, 0, 0];
    // the width tag sits in the first byte because encoding is big-endian
    let tag = data[0] >> 6;
    data[0] &= 0b0011_1111;

    let width = match tag {
      0b00 => return Ok(VarInt(data[0] as u64)),
      0b01 => size_of::<u16>(),
      0b10 => size_of::<u32>(),
      _ => size_of::<u64>(),
    };
    if buf.remaining() < width - 1 {
      return Err(codec::Error::UnexpectedEof);
    }
    buf.copy_to_slice(&mut data[1..width]);
    let mut value = 0u64;
    for byte in &data[..width] {
      value = value << 8 | *byte as u64;
    }
    Ok(VarInt(value))
  }
}

impl std::fmt::Debug for VarInt {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("VarInt").field(&self.0).finish()
  }
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq};

  #[allow(clippy::unusual_byte_groupings)]
  #[test]
  fn encoded_width_tracks_magnitude() {
    macro_rules! assert_encode {
      ($value:expr, $expected:expr) => {{
        let mut buf = Vec::new();
        VarInt::u64($value).unwrap().encode(&mut buf);
        let expected: &[u8] = &$expected;
        assert_eq!(&buf[..], expected);
      }};
    }

    assert_encode!(0, [0b00000000]);
    assert_encode!(1, [0b00000001]);
    assert_encode!(2u64.pow(6) - 1, [0b00_111111]);
    assert_encode!(2u64.pow(14) - 1, [0b01_111111, 0b11111111]);
    assert_encode!(2u64.pow(30) - 1, [0b10_111111, 0b11111111, 0b11111111, 0b11111111]);
    assert_encode!(
      2u64.pow(62) - 1,
      [0b11_111111, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
    );
  }

  #[test]
  fn round_trip_at_width_boundaries() {
    for value in [
      0,
      1,
      2u64.pow(6) - 1,
      2u64.pow(6),
      2u64.pow(14) - 1,
      2u64.pow(14),
      2u64.pow(30) - 1,
      2u64.pow(30),
      VarInt::MAX.value(),
    ] {
      let mut buf = Vec::new();
      VarInt::u64(value).unwrap().encode(&mut buf);
      let decoded = VarInt::decode(&mut &buf[..]).unwrap();
      assert_eq!(decoded.value(), value, "value {value}");
    }
    assert_eq!(VarInt::u64(VarInt::MAX.value() + 1), None);
  }

  #[test]
  fn zigzag_keeps_small_magnitudes_small() {
    for (signed, unsigned) in [(0i64, 0u64), (-1, 1), (1, 2), (-2, 3), (2, 4)] {
      let v = VarInt::zigzag(signed).unwrap();
      assert_eq!(v.value(), unsigned);
      assert_eq!(v.into_signed(), signed);
    }
    // -32..=31 fit one byte after zig-zag
    let mut buf = Vec::new();
    VarInt::zigzag(-31).unwrap().encode(&mut buf);
    assert_eq!(buf.len(), 1);
  }

  #[test]
  fn truncated_input_fails_closed() {
    let mut buf = Vec::new();
    VarInt::u32(u32::MAX).encode(&mut buf);
    assert!(matches!(
      VarInt::decode(&mut &buf[..buf.len() - 1]),
      Err(codec::Error::UnexpectedEof)
    ));
    assert!(matches!(VarInt::decode(&mut &[][..]), Err(codec::Error::UnexpectedEof)));
  }
}
