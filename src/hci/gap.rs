use log::*;

use crate::central::{AdvertisementData, ServiceData};
use crate::hci::{Address, AddressType, Transport};
use crate::util::Hex;
use crate::uuid::Uuid;

pub const DEFAULT_SCAN_INTERVAL: u16 = 0x0010;
pub const DEFAULT_SCAN_WINDOW: u16 = 0x0010;

const ADV_NONCONN_IND: u8 = 0x03;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanState {
    Idle,
    Starting,
    Started,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GapEvent {
    ScanParametersSet,
    ScanStart {
        filter_duplicates: bool,
    },
    ScanStop,
    Discover {
        status: u8,
        address: Address,
        address_type: AddressType,
        connectable: bool,
        advertisement: AdvertisementData,
        rssi: i8,
    },
}

/// Scan state machine.
///
/// The state follows what the controller reports, including scan enable commands issued
/// by other processes sharing the controller.
#[derive(Debug)]
pub struct Gap {
    state: ScanState,
    filter_duplicates: bool,
    force_allow_duplicates: bool,
    interval: u16,
    window: u16,
}

impl Gap {
    pub fn new(force_allow_duplicates: bool) -> Self {
        Self {
            state: ScanState::Idle,
            filter_duplicates: false,
            force_allow_duplicates,
            interval: DEFAULT_SCAN_INTERVAL,
            window: DEFAULT_SCAN_WINDOW,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn filter_duplicates(&self) -> bool {
        self.filter_duplicates
    }

    /// Sets and remembers the scan interval and window used by subsequent scans.
    pub fn set_scan_parameters(&mut self, transport: &mut dyn Transport, interval: u16,
        window: u16, active: bool)
    {
        self.interval = interval;
        self.window = window;
        transport.set_scan_parameters(interval, window, active);
    }

    pub fn start_scanning(&mut self, transport: &mut dyn Transport, allow_duplicates: bool,
        active: bool)
    {
        self.state = ScanState::Starting;
        self.filter_duplicates = !allow_duplicates;

        // Parameters can only be changed while scanning is disabled.
        transport.set_scan_enabled(false, true);
        transport.set_scan_parameters(self.interval, self.window, active);

        if self.force_allow_duplicates && self.filter_duplicates {
            debug!("duplicate filtering forced off to receive scan responses");
            self.filter_duplicates = false;
        }

        transport.set_scan_enabled(true, self.filter_duplicates);
    }

    pub fn stop_scanning(&mut self, transport: &mut dyn Transport) {
        self.state = ScanState::Stopping;
        transport.set_scan_enabled(false, true);
    }

    pub fn on_le_scan_parameters_set(&mut self, status: u8) -> GapEvent {
        debug!("scan parameters set, status 0x{:02x}", status);
        GapEvent::ScanParametersSet
    }

    /// Handles Command Complete of LE Set Scan Enable.
    pub fn on_le_scan_enable_set(&mut self, status: u8) -> Option<GapEvent> {
        if status != 0 {
            debug!("scan enable failed with status 0x{:02x}, state {:?} kept", status, self.state);
            return None;
        }
        match self.state {
            ScanState::Starting => {
                self.state = ScanState::Started;
                Some(GapEvent::ScanStart { filter_duplicates: self.filter_duplicates })
            }
            ScanState::Stopping => {
                self.state = ScanState::Stopped;
                Some(GapEvent::ScanStop)
            }
            _ => None,
        }
    }

    /// Handles a LE Set Scan Enable command observed on the transport.
    pub fn on_le_scan_enable_set_cmd(&mut self, enable: bool, filter_duplicates: bool)
        -> Option<GapEvent>
    {
        match self.state {
            ScanState::Starting | ScanState::Started => {
                if !enable {
                    // A disable while starting is our own restart sequence.
                    if self.state == ScanState::Started {
                        self.state = ScanState::Stopped;
                    }
                    Some(GapEvent::ScanStop)
                } else if self.filter_duplicates != filter_duplicates {
                    self.filter_duplicates = filter_duplicates;
                    Some(GapEvent::ScanStart { filter_duplicates })
                } else {
                    None
                }
            }
            ScanState::Stopping | ScanState::Stopped if enable => {
                self.state = ScanState::Started;
                self.filter_duplicates = filter_duplicates;
                Some(GapEvent::ScanStart { filter_duplicates })
            }
            _ => None,
        }
    }

    pub fn on_le_advertising_report(&mut self, status: u8, kind: u8, address: Address,
        address_type: AddressType, eir: &[u8], rssi: i8) -> GapEvent
    {
        let advertisement = parse_eir(eir);
        trace!("advertisement from {}: {:?}", address, advertisement);
        GapEvent::Discover {
            status,
            address,
            address_type,
            connectable: kind != ADV_NONCONN_IND,
            advertisement,
            rssi,
        }
    }
}

/// Decodes advertising data records.
///
/// Decoding stops at the first record with a zero length or a length running past the end of
/// the buffer; everything decoded up to that point is kept.
pub fn parse_eir(eir: &[u8]) -> AdvertisementData {
    let mut r = AdvertisementData::default();
    let mut i = 0;
    while i + 1 < eir.len() {
        let len = eir[i] as usize;
        if len < 1 {
            debug!("invalid EIR data, length = {}: {}", len, Hex(eir));
            break;
        }
        if i + len + 1 > eir.len() {
            debug!("invalid EIR data, out of range of buffer length: {}", Hex(eir));
            break;
        }
        let kind = eir[i + 1];
        let bytes = &eir[i + 2..i + len + 1];

        match kind {
            // Incomplete and complete lists of 16-bit service UUIDs.
            0x02 | 0x03 => push_uuids(&mut r.service_uuids, bytes, 2),
            // Incomplete and complete lists of 128-bit service UUIDs.
            0x06 | 0x07 => push_uuids(&mut r.service_uuids, bytes, 16),
            // Shortened and complete local name.
            0x08 | 0x09 => r.local_name = Some(String::from_utf8_lossy(bytes).into_owned()),
            0x0a => r.tx_power_level = bytes.first().map(|&v| v as i8),
            0x14 => push_uuids(&mut r.solicited_service_uuids, bytes, 2),
            0x1f => push_uuids(&mut r.solicited_service_uuids, bytes, 4),
            0x15 => push_uuids(&mut r.solicited_service_uuids, bytes, 16),
            0x16 => push_service_data(&mut r.service_data, bytes, 2),
            0x20 => push_service_data(&mut r.service_data, bytes, 4),
            0x21 => push_service_data(&mut r.service_data, bytes, 16),
            0xff => r.manufacturer_data = Some(bytes.to_vec()),
            _ => {}
        }

        i += len + 1;
    }
    r
}

fn push_uuids(list: &mut Vec<Uuid>, bytes: &[u8], uuid_len: usize) {
    for chunk in bytes.chunks_exact(uuid_len) {
        if let Some(uuid) = Uuid::from_le_slice(chunk) {
            if !list.contains(&uuid) {
                list.push(uuid);
            }
        }
    }
}

fn push_service_data(service_data: &mut ServiceData, bytes: &[u8], uuid_len: usize) {
    if bytes.len() < uuid_len {
        debug!("service data record shorter than its UUID: {}", Hex(bytes));
        return;
    }
    if let Some(uuid) = Uuid::from_le_slice(&bytes[..uuid_len]) {
        service_data.push(uuid, bytes[uuid_len..].to_vec());
    }
}

/// Detects kernels of Next Thing Co. C.H.I.P. boards, whose controller only delivers scan
/// responses with duplicate filtering disabled.
pub fn needs_duplicates_allowed() -> bool {
    if cfg!(target_os = "linux") {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|v| v.contains("-ntc"))
            .unwrap_or(false)
    } else {
        false
    }
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use crate::hci::mock::*;
    use super::*;

    #[test]
    fn start_scanning_sequence() {
        let mut t = MockTransport::new();
        let mut gap = Gap::new(false);
        gap.start_scanning(&mut t, false, true);
        assert_eq!(t.take(), vec![
            Call::SetScanEnabled { enabled: false, filter_duplicates: true },
            Call::SetScanParameters { interval: 0x10, window: 0x10, active: true },
            Call::SetScanEnabled { enabled: true, filter_duplicates: true },
        ]);
        assert_eq!(gap.state(), ScanState::Starting);

        assert_eq!(gap.on_le_scan_enable_set(0x0c), None);
        assert_eq!(gap.state(), ScanState::Starting);

        assert_eq!(gap.on_le_scan_enable_set(0),
            Some(GapEvent::ScanStart { filter_duplicates: true }));
        assert_eq!(gap.state(), ScanState::Started);

        gap.stop_scanning(&mut t);
        assert_eq!(t.take(), vec![Call::SetScanEnabled { enabled: false, filter_duplicates: true }]);
        assert_eq!(gap.on_le_scan_enable_set(0), Some(GapEvent::ScanStop));
        assert_eq!(gap.state(), ScanState::Stopped);
        assert_eq!(gap.on_le_scan_enable_set(0), None);
    }

    #[test]
    fn forced_duplicates() {
        let mut t = MockTransport::new();
        let mut gap = Gap::new(true);
        gap.start_scanning(&mut t, false, false);
        assert_eq!(t.take().last(),
            Some(&Call::SetScanEnabled { enabled: true, filter_duplicates: false }));
        assert!(!gap.filter_duplicates());
    }

    #[test]
    fn custom_scan_parameters_are_kept() {
        let mut t = MockTransport::new();
        let mut gap = Gap::new(false);
        gap.set_scan_parameters(&mut t, 0x60, 0x30, true);
        t.take();
        gap.start_scanning(&mut t, true, true);
        assert_eq!(t.take()[1], Call::SetScanParameters { interval: 0x60, window: 0x30, active: true });
    }

    #[test]
    fn external_scan_enable() {
        let mut t = MockTransport::new();
        let mut gap = Gap::new(false);

        assert_eq!(gap.on_le_scan_enable_set_cmd(true, true), None);

        gap.start_scanning(&mut t, true, true);
        gap.on_le_scan_enable_set(0);
        assert_eq!(gap.on_le_scan_enable_set_cmd(true, false), None);
        assert_eq!(gap.on_le_scan_enable_set_cmd(true, true),
            Some(GapEvent::ScanStart { filter_duplicates: true }));
        assert!(gap.filter_duplicates());
        assert_eq!(gap.on_le_scan_enable_set_cmd(false, true), Some(GapEvent::ScanStop));
        assert_eq!(gap.state(), ScanState::Stopped);
        assert_eq!(gap.on_le_scan_enable_set_cmd(true, true),
            Some(GapEvent::ScanStart { filter_duplicates: true }));
        assert_eq!(gap.state(), ScanState::Started);

        gap.stop_scanning(&mut t);
        gap.on_le_scan_enable_set(0);
        assert_eq!(gap.state(), ScanState::Stopped);
        assert_eq!(gap.on_le_scan_enable_set_cmd(false, true), None);
        assert_eq!(gap.on_le_scan_enable_set_cmd(true, false),
            Some(GapEvent::ScanStart { filter_duplicates: false }));
        assert_eq!(gap.state(), ScanState::Started);
        assert!(!gap.filter_duplicates());
    }

    #[test]
    fn own_restart_keeps_starting() {
        let mut t = MockTransport::new();
        let mut gap = Gap::new(false);
        gap.start_scanning(&mut t, false, true);
        assert_eq!(gap.on_le_scan_enable_set_cmd(false, true), Some(GapEvent::ScanStop));
        assert_eq!(gap.state(), ScanState::Starting);
        assert_eq!(gap.on_le_scan_enable_set(0),
            Some(GapEvent::ScanStart { filter_duplicates: true }));
    }

    #[test]
    fn eir_records() {
        let eir = hex!("
            020106
            05030f180a18
            0303 0f18
            11 07 a6a37d99f26f1a8a0c4b0a7ab0cce0eb
            0709 74657374 2d31
            020a f4
            0516 0f18 6400
            07ff 4c00 0215 0102
            0314 0d18
        ");
        let adv = parse_eir(&eir);
        assert_eq!(adv.service_uuids, vec![
            Uuid::from_u16(0x180f),
            Uuid::from_u16(0x180a),
            "ebe0ccb0-7a0a-4b0c-8a1a-6ff2997da3a6".parse().unwrap(),
        ]);
        assert_eq!(adv.local_name.as_deref(), Some("test-1"));
        assert_eq!(adv.tx_power_level, Some(-12));
        assert_eq!(adv.service_data.get(Uuid::from_u16(0x180f)), Some(&[0x64, 0x00][..]));
        assert_eq!(adv.manufacturer_data.as_deref(), Some(&hex!("4c00 0215 0102")[..]));
        assert_eq!(adv.solicited_service_uuids, vec![Uuid::from_u16(0x180d)]);
    }

    #[test]
    fn eir_truncated() {
        let adv = parse_eir(&hex!("0509 6162 6364 0a09 6566"));
        assert_eq!(adv.local_name.as_deref(), Some("abcd"));

        let adv = parse_eir(&hex!("0309 6162 00 0aff 0102"));
        assert_eq!(adv.local_name.as_deref(), Some("ab"));
        assert_eq!(adv.manufacturer_data, None);

        let adv = parse_eir(&hex!("02"));
        assert_eq!(adv, AdvertisementData::default());
    }

    #[test]
    fn eir_service_data_keeps_duplicates() {
        let adv = parse_eir(&hex!("0416 0f18 01 0416 0f18 02 0620 78563412 03"));
        let entries: Vec<_> = adv.service_data.iter().collect();
        assert_eq!(entries, vec![
            (Uuid::from_u16(0x180f), &[1][..]),
            (Uuid::from_u16(0x180f), &[2][..]),
            (Uuid::from_u32(0x1234_5678), &[3][..]),
        ]);
    }

    #[test]
    fn report_connectable() {
        let mut gap = Gap::new(false);
        let address = Address::new([1, 2, 3, 4, 5, 6]);
        let ev = gap.on_le_advertising_report(0, 0x03, address, AddressType::Random, &[], -50);
        match ev {
            GapEvent::Discover { connectable, rssi, address_type, .. } => {
                assert!(!connectable);
                assert_eq!(rssi, -50);
                assert_eq!(address_type, AddressType::Random);
            }
            _ => panic!(),
        }
        let ev = gap.on_le_advertising_report(0, 0x00, address, AddressType::Public, &[], -50);
        assert!(matches!(ev, GapEvent::Discover { connectable: true, .. }));
    }
}
