use serde::{Deserialize, Deserializer, Serialize, Serializer};
use static_assertions::assert_impl_all;
use std::fmt;
use std::str::FromStr;

const BASE_UUID_BYTES: [u8; 16] = [0, 0, 0, 0, 0, 0, 0x10, 0, 0x80, 0, 0, 0x80, 0x5F, 0x9B, 0x34, 0xFB];

/// Bluetooth-tailored UUID.
///
/// Bytes are kept in the textual (big-endian) order. Attribute protocol and advertising data
/// carry UUIDs little-endian, see [`from_le_slice`](#method.from_le_slice) and
/// [`to_le_bytes`](#method.to_le_bytes).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Uuid([u8; 16]);

impl Uuid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Constructs a `uuid16` on top of the Base UUID.
    pub const fn from_u16(v: u16) -> Self {
        let mut r = BASE_UUID_BYTES;
        r[2] = (v >> 8) as u8;
        r[3] = v as u8;
        Self(r)
    }

    /// Constructs a `uuid32` on top of the Base UUID.
    pub const fn from_u32(v: u32) -> Self {
        let mut r = BASE_UUID_BYTES;
        r[0] = (v >> 24) as u8;
        r[1] = (v >> 16) as u8;
        r[2] = (v >> 8) as u8;
        r[3] = v as u8;
        Self(r)
    }

    /// Constructs instance from little-endian wire bytes: 2 for `uuid16`, 4 for `uuid32` and 16
    /// for a full UUID. Returns `None` for any other length.
    pub fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        let mut r = match bytes.len() {
            2 | 4 => BASE_UUID_BYTES,
            16 => [0; 16],
            _ => return None,
        };
        let start = 4 - bytes.len().min(4);
        for (dst, src) in r[start..].iter_mut().zip(bytes.iter().rev()) {
            *dst = *src;
        }
        Some(Self(r))
    }

    /// Returns inner bytes array.
    pub fn bytes(&self) -> [u8; 16] {
        self.0
    }

    /// Returns the shortest possible UUID that is equivalent of this UUID.
    pub fn shorten(&self) -> &[u8] {
        if self.0[4..] == BASE_UUID_BYTES[4..] {
            if self.0[0..2] == BASE_UUID_BYTES[0..2] {
                &self.0[2..4]
            } else {
                &self.0[..4]
            }
        } else {
            &self.0
        }
    }

    /// Returns the `uuid16` value if this UUID is one.
    pub fn as_u16(&self) -> Option<u16> {
        match *self.shorten() {
            [hi, lo] => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }

    /// Returns the wire form used by the Attribute Protocol: 2 bytes for `uuid16`, otherwise
    /// all 16 bytes (ATT has no 32-bit form), little-endian.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut r = match self.as_u16() {
            Some(_) => self.0[2..4].to_vec(),
            None => self.0.to_vec(),
        };
        r.reverse();
        r
    }
}

assert_impl_all!(Uuid: Send, Sync);

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3],
            self.0[4], self.0[5], self.0[6], self.0[7],
            self.0[8], self.0[9], self.0[10], self.0[11],
            self.0[12], self.0[13], self.0[14], self.0[15])
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(v: [u8; 16]) -> Self {
        Self::from_bytes(v)
    }
}

impl From<u16> for Uuid {
    fn from(v: u16) -> Self {
        Self::from_u16(v)
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Parses the dashed 36 character form, the undashed 32 character form, or the short
    /// 4 (`uuid16`) and 8 (`uuid32`) character forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn decode(src: &[u8], dst: &mut [u8]) -> Result<(), UuidParseError> {
            debug_assert_eq!(src.len() % 2, 0);
            debug_assert_eq!(dst.len(), src.len() / 2);

            fn dig(c: u8) -> Result<u8, UuidParseError> {
                Ok(match c {
                    b'0'..=b'9' => c - b'0',
                    b'a'..=b'f' => c - b'a' + 10,
                    b'A'..=b'F' => c - b'A' + 10,
                    _ => return Err(UuidParseError(())),
                })
            }

            for (s, d) in src.chunks(2).zip(dst.iter_mut()) {
                *d = (dig(s[0])? << 4) | dig(s[1])?;
            }

            Ok(())
        }

        let s = s.as_bytes();
        let mut buf = [0; 16];
        match s.len() {
            4 => {
                decode(s, &mut buf[..2])?;
                return Ok(Self::from_u16(u16::from_be_bytes([buf[0], buf[1]])));
            }
            8 => {
                decode(s, &mut buf[..4])?;
                return Ok(Self::from_u32(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])));
            }
            32 => {
                decode(s, &mut buf)?;
                return Ok(buf.into());
            }
            36 => {}
            _ => return Err(UuidParseError(())),
        }

        const PARTS: [(usize, usize); 4] = [(8, 4), (13, 6), (18, 8), (23, 10)];
        if PARTS.iter().any(|&(i, _)| s[i] != b'-') {
            return Err(UuidParseError(()));
        }

        decode(&s[..PARTS[0].0], &mut buf[..PARTS[0].1])?;
        decode(&s[PARTS[0].0 + 1..PARTS[1].0], &mut buf[PARTS[0].1..PARTS[1].1])?;
        decode(&s[PARTS[1].0 + 1..PARTS[2].0], &mut buf[PARTS[1].1..PARTS[2].1])?;
        decode(&s[PARTS[2].0 + 1..PARTS[3].0], &mut buf[PARTS[2].1..PARTS[3].1])?;
        decode(&s[PARTS[3].0 + 1..], &mut buf[PARTS[3].1..])?;
        Ok(buf.into())
    }
}

impl Serialize for Uuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
pub struct UuidParseError(());

impl fmt::Display for UuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid UUID string")
    }
}

impl std::error::Error for UuidParseError {}
