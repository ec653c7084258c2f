use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    description: String,
}

impl Error {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Builds an error from a non-zero controller status code, e.g. the status of a
    /// LE Connection Complete event.
    pub fn from_hci_status(status: u8) -> Self {
        Self::new(ErrorKind::Hci(status),
            format!("{} (0x{:02x})", hci_status_message(status), status))
    }

    pub(in crate) fn from_att_code(opcode: u8, handle: u16, code: u8) -> Self {
        let kind = AttErrorKind::from_code(code as isize);
        Self::new(ErrorKind::Att(kind),
            format!("ATT error {:?} (0x{:02x}) for request 0x{:02x} on handle 0x{:04x}",
                kind, code, opcode, handle))
    }

    pub(in crate) fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancel")
    }

    pub(in crate) fn detached() -> Self {
        Self::new(ErrorKind::Detached, "object is not attached to a central")
    }

    pub(in crate) fn unknown_peripheral(id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::UnknownPeripheral, format!("unknown peripheral {}", id))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl std::error::Error for Error {}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The controller reported a non-zero status code.
    Hci(u8),

    /// The remote GATT server answered with an ATT Error Response.
    Att(AttErrorKind),

    /// A malformed or unexpected protocol data unit, or a failed pairing.
    Protocol,

    /// The operation addressed a peripheral that is not known or not connected.
    UnknownPeripheral,

    /// The operation addressed a service that hasn't been discovered.
    UnknownService,

    /// The operation addressed a characteristic that hasn't been discovered.
    UnknownCharacteristic,

    /// The operation addressed a descriptor that hasn't been discovered.
    UnknownDescriptor,

    /// The specified parameters are invalid.
    InvalidParameters,

    /// The peripheral isn't currently connected.
    NotConnected,

    /// The peripheral is already connected.
    AlreadyConnected,

    /// A connection attempt to the peripheral is already in flight or queued.
    AlreadyConnecting,

    /// Cancellation was requested for a peripheral that isn't the pending connection.
    NotConnecting,

    /// The operation could not be issued to the transport.
    NotIssued,

    /// No response arrived after all retries.
    RetriesExhausted,

    /// The operation was cancelled by the caller.
    Cancelled,

    /// The object is no longer attached to a central.
    Detached,

    /// The adapter isn't powered on.
    PoweredOff,
}

/// The possible errors returned by a GATT server (a remote peripheral) during
/// Bluetooth low energy ATT transactions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AttErrorKind {
    /// ATT error that didn't map to any of the existing variants.
    Other,

    /// The ATT command or request successfully completed.
    Success,

    /// The attribute handle is invalid on this peripheral.
    InvalidHandle,

    /// The permissions prohibit reading the attribute’s value.
    ReadNotPermitted,

    /// The permissions prohibit writing the attribute’s value.
    WriteNotPermitted,

    /// The attribute Protocol Data Unit (PDU) is invalid.
    InvalidPdu,

    /// Reading or writing the attribute’s value failed for lack of authentication.
    InsufficientAuthentication,

    /// The attribute server doesn’t support the request received from the client.
    RequestNotSupported,

    /// The specified offset value was past the end of the attribute’s value.
    InvalidOffset,

    /// Reading or writing the attribute’s value failed for lack of authorization.
    InsufficientAuthorization,

    /// The prepare queue is full, as a result of there being too many write requests in the queue.
    PrepareQueueFull,

    /// The attribute wasn’t found within the specified attribute handle range.
    AttributeNotFound,

    /// The ATT read blob request can’t read or write the attribute.
    AttributeNotLong,

    /// The encryption key size used for encrypting this link is insufficient.
    InsufficientEncryptionKeySize,

    /// The length of the attribute’s value is invalid for the intended operation.
    InvalidAttributeValueLength,

    /// The ATT request encountered an unlikely error and wasn’t completed.
    UnlikelyError,

    /// Reading or writing the attribute’s value failed for lack of encryption.
    InsufficientEncryption,

    /// The attribute type isn’t a supported grouping attribute as defined by a higher-layer specification.
    UnsupportedGroupType,

    /// Resources are insufficient to complete the ATT request.
    InsufficientResources,
}

impl AttErrorKind {
    fn from_code(code: isize) -> Self {
        use AttErrorKind::*;
        match code {
            0 => Success,
            1 => InvalidHandle,
            2 => ReadNotPermitted,
            3 => WriteNotPermitted,
            4 => InvalidPdu,
            5 => InsufficientAuthentication,
            6 => RequestNotSupported,
            7 => InvalidOffset,
            8 => InsufficientAuthorization,
            9 => PrepareQueueFull,
            10 => AttributeNotFound,
            11 => AttributeNotLong,
            12 => InsufficientEncryptionKeySize,
            13 => InvalidAttributeValueLength,
            14 => UnlikelyError,
            15 => InsufficientEncryption,
            16 => UnsupportedGroupType,
            17 => InsufficientResources,
            _ => Other,
        }
    }
}

/// Status code that requires the controller to be reset and re-initialized.
pub const HCI_STATUS_COMMAND_DISALLOWED: u8 = 0x0c;

/// Human-readable reason for a controller status code (Core spec Vol 1, Part F).
pub fn hci_status_message(status: u8) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "Unknown HCI Command",
        0x02 => "Unknown Connection Identifier",
        0x03 => "Hardware Failure",
        0x04 => "Page Timeout",
        0x05 => "Authentication Failure",
        0x06 => "PIN or Key Missing",
        0x07 => "Memory Capacity Exceeded",
        0x08 => "Connection Timeout",
        0x09 => "Connection Limit Exceeded",
        0x0a => "Synchronous Connection Limit to a Device Exceeded",
        0x0b => "ACL Connection Already Exists",
        0x0c => "Command Disallowed",
        0x0d => "Connection Rejected due to Limited Resources",
        0x0e => "Connection Rejected due to Security Reasons",
        0x0f => "Connection Rejected due to Unacceptable BD_ADDR",
        0x10 => "Connection Accept Timeout Exceeded",
        0x11 => "Unsupported Feature or Parameter Value",
        0x12 => "Invalid HCI Command Parameters",
        0x13 => "Remote User Terminated Connection",
        0x14 => "Remote Device Terminated due to Low Resources",
        0x15 => "Remote Device Terminated due to Power Off",
        0x16 => "Connection Terminated By Local Host",
        0x17 => "Repeated Attempts",
        0x18 => "Pairing Not Allowed",
        0x19 => "Unknown LMP PDU",
        0x1a => "Unsupported Remote Feature",
        0x1b => "SCO Offset Rejected",
        0x1c => "SCO Interval Rejected",
        0x1d => "SCO Air Mode Rejected",
        0x1e => "Invalid LMP Parameters / Invalid LL Parameters",
        0x1f => "Unspecified Error",
        0x20 => "Unsupported LMP Parameter Value / Unsupported LL Parameter Value",
        0x21 => "Role Change Not Allowed",
        0x22 => "LMP Response Timeout / LL Response Timeout",
        0x23 => "LMP Error Transaction Collision / LL Procedure Collision",
        0x24 => "LMP PDU Not Allowed",
        0x25 => "Encryption Mode Not Acceptable",
        0x26 => "Link Key cannot be Changed",
        0x27 => "Requested QoS Not Supported",
        0x28 => "Instant Passed",
        0x29 => "Pairing With Unit Key Not Supported",
        0x2a => "Different Transaction Collision",
        0x2c => "QoS Unacceptable Parameter",
        0x2d => "QoS Rejected",
        0x2e => "Channel Classification Not Supported",
        0x2f => "Insufficient Security",
        0x30 => "Parameter Out Of Mandatory Range",
        0x32 => "Role Switch Pending",
        0x34 => "Reserved Slot Violation",
        0x35 => "Role Switch Failed",
        0x36 => "Extended Inquiry Response Too Large",
        0x37 => "Secure Simple Pairing Not Supported By Host",
        0x38 => "Host Busy - Pairing",
        0x39 => "Connection Rejected due to No Suitable Channel Found",
        0x3a => "Controller Busy",
        0x3b => "Unacceptable Connection Parameters",
        0x3c => "Advertising Timeout",
        0x3d => "Connection Terminated due to MIC Failure",
        0x3e => "Connection Failed to be Established",
        0x3f => "MAC Connection Failed",
        0x40 => "Coarse Clock Adjustment Rejected but Will Try to Adjust Using Clock Dragging",
        0x41 => "Type0 Submap Not Defined",
        0x42 => "Unknown Advertising Identifier",
        0x43 => "Limit Reached",
        0x44 => "Operation Cancelled by Host",
        0x45 => "Packet Too Long",
        _ => "HCI Error: Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hci_status_description() {
        let e = Error::from_hci_status(0x3e);
        assert_eq!(e.kind(), ErrorKind::Hci(0x3e));
        assert_eq!(e.to_string(), "Connection Failed to be Established (0x3e)");

        let e = Error::from_hci_status(0xfe);
        assert_eq!(e.to_string(), "HCI Error: Unknown (0xfe)");
    }

    #[test]
    fn att_error_kind() {
        let e = Error::from_att_code(0x0a, 0x0003, 0x02);
        assert_eq!(e.kind(), ErrorKind::Att(AttErrorKind::ReadNotPermitted));
        let e = Error::from_att_code(0x0a, 0x0003, 0x80);
        assert_eq!(e.kind(), ErrorKind::Att(AttErrorKind::Other));
    }
}
