//! Protocol layers between the raw controller transport and the central object model.
//!
//! The transport that frames HCI packets is external to this crate: it implements
//! [`Transport`] for outbound commands and feeds decoded [`HciEvent`]s back in.

pub mod acl_stream;
mod bindings;
pub mod crypto;
pub mod gap;
pub mod gatt;
pub mod handle_map;
pub mod signaling;
pub mod smp;

use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::fmt;
use std::str::FromStr;

use crate::error::*;

pub(in crate) use bindings::{Bindings, BindingsEvent, Options as BindingsOptions};

/// Fixed L2CAP channel of the Attribute Protocol.
pub const ATT_CID: u16 = 0x0004;

/// Fixed L2CAP channel of LE signaling.
pub const SIGNALING_CID: u16 = 0x0005;

/// Fixed L2CAP channel of the Security Manager Protocol.
pub const SMP_CID: u16 = 0x0006;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    pub fn from_u8(v: u8) -> Self {
        if v == 0x01 {
            Self::Random
        } else {
            Self::Public
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Public => 0x00,
            Self::Random => 0x01,
        }
    }
}

impl Default for AddressType {
    fn default() -> Self {
        Self::Public
    }
}

/// Device address in display order (most significant octet first).
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Address([u8; 6]);

assert_impl_all!(Address: Send, Sync);

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Octets in the order they travel over the air and in SMP computations.
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut r = self.0;
        r.reverse();
        r
    }

    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and `aabbccddeeff`, in any case.
    fn from_str(s: &str) -> Result<Self> {
        let digits: Vec<u8> = s.bytes().filter(|&c| c != b':' && c != b'-').collect();
        let invalid = || Error::new(ErrorKind::InvalidParameters, format!("invalid address {:?}", s));
        if digits.len() != 12 {
            return Err(invalid());
        }
        let mut r = [0; 6];
        for (d, pair) in r.iter_mut().zip(digits.chunks(2)) {
            let pair = std::str::from_utf8(pair).map_err(|_| invalid())?;
            *d = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }
        Ok(Self(r))
    }
}

/// Identity of a peripheral: its address as lowercase hex digits without separators.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

assert_impl_all!(PeripheralId: Send, Sync);

impl PeripheralId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address this identity was derived from.
    pub fn address(&self) -> Result<Address> {
        self.0.parse()
    }
}

impl From<Address> for PeripheralId {
    fn from(v: Address) -> Self {
        let b = v.bytes();
        Self(format!("{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}", b[0], b[1], b[2], b[3], b[4], b[5]))
    }
}

impl FromStr for PeripheralId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(s.parse::<Address>()?.into())
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeripheralId({})", self.0)
    }
}

/// LE connection parameters, in controller units.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionParameters {
    /// Minimum connection interval, 1.25 ms units.
    pub min_interval: u16,
    /// Maximum connection interval, 1.25 ms units.
    pub max_interval: u16,
    pub latency: u16,
    /// Supervision timeout, 10 ms units.
    pub supervision_timeout: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            min_interval: 0x0006,
            max_interval: 0x000c,
            latency: 0x0000,
            supervision_timeout: 0x00c8,
        }
    }
}

/// The possible states of the local controller.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum AdapterState {
    /// The controller state is unknown.
    Unknown,

    /// The transport to the controller was momentarily lost.
    Resetting,

    /// The controller doesn't support the Bluetooth low energy central role.
    Unsupported,

    /// The process isn't permitted to use the controller.
    Unauthorized,

    /// The controller is powered off.
    PoweredOff,

    /// The controller is powered on and available to use.
    PoweredOn,
}

/// Outbound side of the controller transport.
///
/// Calls are issued from the thread dispatching events and must not block on controller
/// responses; completions come back as [`HciEvent`]s.
pub trait Transport: Send {
    fn init(&mut self);

    fn reset(&mut self);

    fn set_scan_parameters(&mut self, interval: u16, window: u16, active: bool);

    fn set_scan_enabled(&mut self, enabled: bool, filter_duplicates: bool);

    fn create_le_conn(&mut self, address: Address, address_type: AddressType,
        params: ConnectionParameters);

    fn cancel_connect(&mut self);

    fn disconnect(&mut self, handle: u16);

    fn read_rssi(&mut self, handle: u16);

    fn write_acl_data(&mut self, handle: u16, cid: u16, data: Vec<u8>);

    fn start_le_encryption(&mut self, handle: u16, random: [u8; 8], diversifier: [u8; 2],
        key: [u8; 16]);

    fn conn_update_le(&mut self, handle: u16, min_interval: u16, max_interval: u16,
        latency: u16, supervision_timeout: u16);

    fn local_address(&self) -> Address;

    fn local_address_type(&self) -> AddressType;
}

/// Decoded controller events.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum HciEvent {
    StateChange(AdapterState),

    AddressChange(Address),

    LeScanParametersSet {
        status: u8,
    },

    /// Command Complete for a LE Set Scan Enable issued by anyone.
    LeScanEnableSet {
        status: u8,
    },

    /// A LE Set Scan Enable command was observed on the transport, possibly issued by
    /// another process.
    LeScanEnableSetCmd {
        enable: bool,
        filter_duplicates: bool,
    },

    LeAdvertisingReport {
        status: u8,
        /// Advertising event type, `0x03` is non-connectable undirected.
        kind: u8,
        address: Address,
        address_type: AddressType,
        eir: Vec<u8>,
        rssi: i8,
    },

    LeConnComplete {
        status: u8,
        handle: u16,
        /// `0` for central; `None` when the event didn't carry it.
        role: Option<u8>,
        address_type: Option<AddressType>,
        address: Option<Address>,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
        master_clock_accuracy: u8,
    },

    LeConnUpdateComplete {
        handle: u16,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },

    DisconnComplete {
        handle: u16,
        reason: u8,
    },

    EncryptChange {
        handle: u16,
        encrypt: bool,
    },

    RssiRead {
        handle: u16,
        rssi: i8,
    },

    AclDataPkt {
        handle: u16,
        cid: u16,
        data: Vec<u8>,
    },
}

#[cfg(test)]
pub(in crate) mod mock {
    use parking_lot::Mutex;
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum Call {
        Init,
        Reset,
        SetScanParameters { interval: u16, window: u16, active: bool },
        SetScanEnabled { enabled: bool, filter_duplicates: bool },
        CreateLeConn { address: Address, address_type: AddressType },
        CancelConnect,
        Disconnect(u16),
        ReadRssi(u16),
        WriteAclData { handle: u16, cid: u16, data: Vec<u8> },
        StartLeEncryption { handle: u16, random: [u8; 8], diversifier: [u8; 2], key: [u8; 16] },
        ConnUpdateLe { handle: u16, min_interval: u16, max_interval: u16 },
    }

    /// Transport that records every call.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub address: Address,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                calls: Default::default(),
                address: Address::new([0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6]),
            }
        }

        pub fn take(&self) -> Vec<Call> {
            std::mem::replace(&mut *self.calls.lock(), Vec::new())
        }

        pub fn acl_writes(&self, cid: u16) -> Vec<Vec<u8>> {
            self.calls.lock().iter()
                .filter_map(|c| match c {
                    Call::WriteAclData { cid: c, data, .. } if *c == cid => Some(data.clone()),
                    _ => None,
                })
                .collect()
        }

        fn push(&self, call: Call) {
            self.calls.lock().push(call);
        }
    }

    impl Transport for MockTransport {
        fn init(&mut self) {
            self.push(Call::Init);
        }

        fn reset(&mut self) {
            self.push(Call::Reset);
        }

        fn set_scan_parameters(&mut self, interval: u16, window: u16, active: bool) {
            self.push(Call::SetScanParameters { interval, window, active });
        }

        fn set_scan_enabled(&mut self, enabled: bool, filter_duplicates: bool) {
            self.push(Call::SetScanEnabled { enabled, filter_duplicates });
        }

        fn create_le_conn(&mut self, address: Address, address_type: AddressType,
            _params: ConnectionParameters)
        {
            self.push(Call::CreateLeConn { address, address_type });
        }

        fn cancel_connect(&mut self) {
            self.push(Call::CancelConnect);
        }

        fn disconnect(&mut self, handle: u16) {
            self.push(Call::Disconnect(handle));
        }

        fn read_rssi(&mut self, handle: u16) {
            self.push(Call::ReadRssi(handle));
        }

        fn write_acl_data(&mut self, handle: u16, cid: u16, data: Vec<u8>) {
            self.push(Call::WriteAclData { handle, cid, data });
        }

        fn start_le_encryption(&mut self, handle: u16, random: [u8; 8], diversifier: [u8; 2],
            key: [u8; 16])
        {
            self.push(Call::StartLeEncryption { handle, random, diversifier, key });
        }

        fn conn_update_le(&mut self, handle: u16, min_interval: u16, max_interval: u16,
            _latency: u16, _supervision_timeout: u16)
        {
            self.push(Call::ConnUpdateLe { handle, min_interval, max_interval });
        }

        fn local_address(&self) -> Address {
            self.address
        }

        fn local_address_type(&self) -> AddressType {
            AddressType::Public
        }
    }

    pub fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_forms() {
        let a: Address = "AA:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(a.bytes(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(a.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(a.to_le_bytes(), [0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(Address::from_le_bytes(a.to_le_bytes()), a);
        assert_eq!("aabbccddeeff".parse::<Address>().unwrap(), a);
        assert!("aa:bb:cc:dd:ee".parse::<Address>().is_err());
        assert!("aa:bb:cc:dd:ee:gg".parse::<Address>().is_err());
    }

    #[test]
    fn peripheral_id_is_normalized() {
        let id: PeripheralId = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(id.as_str(), "aabbccddeeff");
        assert_eq!(id, "aabbccddeeff".parse().unwrap());
        assert_eq!(id.address().unwrap().to_string(), "aa:bb:cc:dd:ee:ff");
    }
}
