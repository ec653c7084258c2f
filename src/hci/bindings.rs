use log::*;
use std::collections::{HashMap, VecDeque};

use crate::central::AdvertisementData;
use crate::error::*;
use crate::hci::*;
use crate::hci::acl_stream::{AclSignal, AclStream};
use crate::hci::gap::{Gap, GapEvent};
use crate::hci::gatt::{CharacteristicInfo, DescriptorInfo, Gatt, GattEvent, ServiceInfo};
use crate::hci::handle_map::HandleMap;
use crate::hci::signaling::{Signaling, SignalingAction};
use crate::hci::smp::Smp;
use crate::uuid::Uuid;

/// Status of a LE Connection Complete for a connection attempt we cancelled ourselves.
const STATUS_UNKNOWN_CONNECTION_ID: u8 = 0x02;

#[derive(Clone, Debug)]
pub(in crate) enum BindingsEvent {
    StateChange(AdapterState),
    AddressChange(Address),
    ScanParametersSet,
    ScanStart {
        filter_duplicates: bool,
    },
    ScanStop,
    Discover {
        id: PeripheralId,
        address: Address,
        address_type: AddressType,
        connectable: bool,
        advertisement: AdvertisementData,
        rssi: i8,
    },
    Connect {
        id: PeripheralId,
        error: Option<Error>,
    },
    Disconnect {
        id: PeripheralId,
        /// `None` when the session was replaced by a new connection to the same peripheral.
        reason: Option<u8>,
    },
    RssiUpdate {
        id: PeripheralId,
        rssi: i8,
    },
    Encrypt {
        id: PeripheralId,
        encrypt: bool,
    },
    EncryptFail {
        id: PeripheralId,
    },
    PasskeyRequested {
        id: PeripheralId,
    },
    Ltk {
        id: PeripheralId,
        ltk: [u8; 16],
    },
    MasterIdent {
        id: PeripheralId,
        ediv: [u8; 2],
        rand: [u8; 8],
    },
    Gatt {
        id: PeripheralId,
        event: GattEvent,
    },
}

#[derive(Clone, Debug)]
struct PendingConnection {
    id: PeripheralId,
    address_type: AddressType,
    params: ConnectionParameters,
}

/// Protocol sessions of one live connection.
#[derive(Debug)]
struct Connection {
    id: PeripheralId,
    acl: AclStream,
    gatt: Gatt,
    signaling: Signaling,
}

/// Live connections indexed by controller handle and by peripheral identity.
#[derive(Debug, Default)]
struct ConnectionTable {
    handles: HandleMap,
    sessions: HashMap<u16, Connection>,
}

impl ConnectionTable {
    fn insert(&mut self, handle: u16, conn: Connection) {
        self.handles.insert(handle, conn.id.clone());
        self.sessions.insert(handle, conn);
    }

    fn remove(&mut self, handle: u16) -> Option<Connection> {
        self.handles.remove_handle(handle)?;
        self.sessions.remove(&handle)
    }

    fn handle(&self, id: &PeripheralId) -> Option<u16> {
        self.handles.handle(id)
    }

    fn get_mut(&mut self, handle: u16) -> Option<&mut Connection> {
        self.sessions.get_mut(&handle)
    }

    fn by_id_mut(&mut self, id: &PeripheralId) -> Option<&mut Connection> {
        let handle = self.handles.handle(id)?;
        self.sessions.get_mut(&handle)
    }
}

pub(in crate) struct Options {
    pub preferred_mtu: u16,
    pub passkey_entry: bool,
    pub force_allow_duplicates: bool,
    pub scan_interval: u16,
    pub scan_window: u16,
    pub active_scan: bool,
}

/// Connection lifecycle manager.
///
/// Owns the transport, the scan engine, the single pending connection attempt with its
/// queue, and the per-connection protocol sessions. Produced events are drained with
/// [`take_events`](#method.take_events).
pub(in crate) struct Bindings {
    transport: Box<dyn Transport>,
    state: Option<AdapterState>,
    gap: Gap,
    scan_service_uuids: Option<Vec<Uuid>>,
    pending: Option<PendingConnection>,
    queue: VecDeque<PendingConnection>,
    connections: ConnectionTable,
    preferred_mtu: u16,
    passkey_entry: bool,
    scan_interval: u16,
    scan_window: u16,
    active_scan: bool,
    events: Vec<BindingsEvent>,
}

impl Bindings {
    pub fn new(transport: Box<dyn Transport>, options: Options) -> Self {
        Self {
            transport,
            state: None,
            gap: Gap::new(options.force_allow_duplicates),
            scan_service_uuids: None,
            pending: None,
            queue: VecDeque::new(),
            connections: ConnectionTable::default(),
            preferred_mtu: options.preferred_mtu,
            passkey_entry: options.passkey_entry,
            scan_interval: options.scan_interval,
            scan_window: options.scan_window,
            active_scan: options.active_scan,
            events: Vec::new(),
        }
    }

    pub fn take_events(&mut self) -> Vec<BindingsEvent> {
        std::mem::replace(&mut self.events, Vec::new())
    }

    pub fn state(&self) -> Option<AdapterState> {
        self.state
    }

    pub fn init(&mut self) {
        self.transport.init();
    }

    pub fn reset(&mut self) {
        self.transport.reset();
    }

    pub fn set_scan_parameters(&mut self, interval: u16, window: u16) {
        self.scan_interval = interval;
        self.scan_window = window;
        self.gap.set_scan_parameters(self.transport.as_mut(), interval, window, self.active_scan);
    }

    pub fn start_scanning(&mut self, service_uuids: &[Uuid], allow_duplicates: bool) {
        self.scan_service_uuids = Some(service_uuids.to_vec());
        self.gap.start_scanning(self.transport.as_mut(), allow_duplicates, self.active_scan);
    }

    pub fn stop_scanning(&mut self) {
        self.gap.stop_scanning(self.transport.as_mut());
    }

    pub fn connect(&mut self, id: &PeripheralId, address_type: AddressType,
        params: ConnectionParameters) -> Result<()>
    {
        let address = id.address()?;
        if self.is_connecting(id) {
            debug!("connection to {} already pending", id);
            return Ok(());
        }
        let conn = PendingConnection {
            id: id.clone(),
            address_type,
            params,
        };
        if self.pending.is_none() {
            self.stop_scanning();
            self.pending = Some(conn);
            self.transport.create_le_conn(address, address_type, params);
        } else {
            debug!("connection to {} queued", id);
            self.queue.push_back(conn);
        }
        Ok(())
    }

    /// Cancels the attempt in flight to `id`, or drops it from the queue if it hasn't started.
    pub fn cancel_connect(&mut self, id: &PeripheralId) -> Result<()> {
        match &self.pending {
            Some(p) if &p.id == id => {
                self.transport.cancel_connect();
                self.process_pending_queue();
                Ok(())
            }
            _ => match self.queue.iter().position(|p| &p.id == id) {
                Some(i) => {
                    self.queue.remove(i);
                    debug!("queued connection to {} dropped", id);
                    Ok(())
                }
                None => Err(Error::new(ErrorKind::NotConnecting,
                    format!("requested cancellation of {} but was not connecting", id))),
            },
        }
    }

    /// Whether a connection attempt to `id` is in flight or queued.
    pub fn is_connecting(&self, id: &PeripheralId) -> bool {
        self.pending.iter().chain(self.queue.iter()).any(|p| &p.id == id)
    }

    pub fn disconnect(&mut self, id: &PeripheralId) -> Result<()> {
        let handle = self.handle(id)?;
        self.transport.disconnect(handle);
        Ok(())
    }

    pub fn update_rssi(&mut self, id: &PeripheralId) -> Result<()> {
        let handle = self.handle(id)?;
        self.transport.read_rssi(handle);
        Ok(())
    }

    pub fn encrypt(&mut self, id: &PeripheralId) -> Result<()> {
        let transport = self.transport.as_mut();
        let conn = self.connections.by_id_mut(id).ok_or_else(|| not_connected(id))?;
        conn.acl.encrypt(transport);
        Ok(())
    }

    pub fn provide_passkey(&mut self, id: &PeripheralId, passkey: u32) -> Result<()> {
        let transport = self.transport.as_mut();
        let conn = self.connections.by_id_mut(id).ok_or_else(|| not_connected(id))?;
        conn.acl.provide_passkey(transport, passkey)
    }

    pub fn is_connected(&self, id: &PeripheralId) -> bool {
        self.connections.handle(id).is_some()
    }

    pub fn mtu(&self, id: &PeripheralId) -> Option<u16> {
        let handle = self.connections.handle(id)?;
        self.connections.sessions.get(&handle).map(|c| c.gatt.mtu())
    }

    pub fn add_services(&mut self, id: &PeripheralId, services: &[ServiceInfo]) -> Result<()> {
        self.with_gatt(id, |g| {
            g.add_services(services);
            Ok(())
        })
    }

    pub fn add_characteristics(&mut self, id: &PeripheralId, service: Uuid,
        characteristics: &[CharacteristicInfo]) -> Result<()>
    {
        self.with_gatt(id, |g| {
            g.add_characteristics(service, characteristics);
            Ok(())
        })
    }

    pub fn add_descriptors(&mut self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        descriptors: &[DescriptorInfo]) -> Result<()>
    {
        self.with_gatt(id, |g| {
            g.add_descriptors(service, characteristic, descriptors);
            Ok(())
        })
    }

    pub fn discover_services(&mut self, id: &PeripheralId, filter: &[Uuid]) -> Result<()> {
        self.with_gatt(id, |g| {
            g.discover_services(filter);
            Ok(())
        })
    }

    pub fn discover_included_services(&mut self, id: &PeripheralId, service: Uuid,
        filter: &[Uuid]) -> Result<()>
    {
        self.with_gatt(id, |g| g.discover_included_services(service, filter))
    }

    pub fn discover_characteristics(&mut self, id: &PeripheralId, service: Uuid,
        filter: &[Uuid]) -> Result<()>
    {
        self.with_gatt(id, |g| g.discover_characteristics(service, filter))
    }

    pub fn discover_descriptors(&mut self, id: &PeripheralId, service: Uuid,
        characteristic: Uuid) -> Result<()>
    {
        self.with_gatt(id, |g| g.discover_descriptors(service, characteristic))
    }

    pub fn read(&mut self, id: &PeripheralId, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.with_gatt(id, |g| g.read(service, characteristic))
    }

    pub fn write(&mut self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        data: Vec<u8>, without_response: bool) -> Result<()>
    {
        self.with_gatt(id, |g| g.write(service, characteristic, data, without_response))
    }

    pub fn broadcast(&mut self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        enable: bool) -> Result<()>
    {
        self.with_gatt(id, |g| g.broadcast(service, characteristic, enable))
    }

    pub fn notify(&mut self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        enable: bool) -> Result<()>
    {
        self.with_gatt(id, |g| g.notify(service, characteristic, enable))
    }

    pub fn read_value(&mut self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        descriptor: Uuid) -> Result<()>
    {
        self.with_gatt(id, |g| g.read_value(service, characteristic, descriptor))
    }

    pub fn write_value(&mut self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        descriptor: Uuid, data: Vec<u8>) -> Result<()>
    {
        self.with_gatt(id, |g| g.write_value(service, characteristic, descriptor, data))
    }

    pub fn read_handle(&mut self, id: &PeripheralId, handle: u16) -> Result<()> {
        self.with_gatt(id, |g| {
            g.read_handle(handle);
            Ok(())
        })
    }

    pub fn write_handle(&mut self, id: &PeripheralId, handle: u16, data: Vec<u8>,
        without_response: bool) -> Result<()>
    {
        self.with_gatt(id, |g| g.write_handle(handle, data, without_response))
    }

    /// Dispatches one controller event.
    pub fn handle_event(&mut self, event: HciEvent) {
        match event {
            HciEvent::StateChange(state) => self.on_state_change(state),
            HciEvent::AddressChange(address) => self.events.push(BindingsEvent::AddressChange(address)),
            HciEvent::LeScanParametersSet { status } => {
                let ev = self.gap.on_le_scan_parameters_set(status);
                self.on_gap_event(Some(ev));
            }
            HciEvent::LeScanEnableSet { status } => {
                let ev = self.gap.on_le_scan_enable_set(status);
                self.on_gap_event(ev);
            }
            HciEvent::LeScanEnableSetCmd { enable, filter_duplicates } => {
                let ev = self.gap.on_le_scan_enable_set_cmd(enable, filter_duplicates);
                self.on_gap_event(ev);
            }
            HciEvent::LeAdvertisingReport { status, kind, address, address_type, eir, rssi } => {
                let ev = self.gap.on_le_advertising_report(status, kind, address, address_type,
                    &eir, rssi);
                self.on_gap_event(Some(ev));
            }
            HciEvent::LeConnComplete { status, handle, role, address_type, address, .. } =>
                self.on_le_conn_complete(status, handle, role, address_type, address),
            HciEvent::LeConnUpdateComplete { handle, interval, latency, supervision_timeout } => {
                debug!("connection {} updated: interval {}, latency {}, timeout {}",
                    handle, interval, latency, supervision_timeout);
            }
            HciEvent::DisconnComplete { handle, reason } =>
                self.on_disconn_complete(handle, Some(reason)),
            HciEvent::EncryptChange { handle, encrypt } => {
                if let Some(conn) = self.connections.get_mut(handle) {
                    if let AclSignal::Encrypt(encrypt) = conn.acl.push_encrypt(encrypt) {
                        let id = conn.id.clone();
                        self.events.push(BindingsEvent::Encrypt { id, encrypt });
                    }
                }
            }
            HciEvent::RssiRead { handle, rssi } => {
                match self.connections.handles.id(handle) {
                    Some(id) => {
                        let id = id.clone();
                        self.events.push(BindingsEvent::RssiUpdate { id, rssi });
                    }
                    None => warn!("unknown handle {} on RSSI read", handle),
                }
            }
            HciEvent::AclDataPkt { handle, cid, data } => self.on_acl_data(handle, cid, data),
        }
    }

    fn on_state_change(&mut self, state: AdapterState) {
        if self.state == Some(state) {
            return;
        }
        self.state = Some(state);
        match state {
            AdapterState::Unauthorized =>
                warn!("adapter state unauthorized, elevated privileges are required"),
            AdapterState::Unsupported =>
                warn!("adapter does not support Bluetooth Low Energy"),
            AdapterState::PoweredOn => {
                self.transport.set_scan_enabled(false, true);
                self.gap.set_scan_parameters(self.transport.as_mut(), self.scan_interval,
                    self.scan_window, self.active_scan);
            }
            _ => {}
        }
        self.events.push(BindingsEvent::StateChange(state));
    }

    fn on_gap_event(&mut self, event: Option<GapEvent>) {
        let event = match event {
            Some(v) => v,
            None => return,
        };
        match event {
            GapEvent::ScanParametersSet => self.events.push(BindingsEvent::ScanParametersSet),
            GapEvent::ScanStart { filter_duplicates } =>
                self.events.push(BindingsEvent::ScanStart { filter_duplicates }),
            GapEvent::ScanStop => self.events.push(BindingsEvent::ScanStop),
            GapEvent::Discover { address, address_type, connectable, advertisement, rssi, .. } => {
                let wanted = match &self.scan_service_uuids {
                    None => return,
                    Some(uuids) => uuids.is_empty()
                        || advertisement.service_uuids.iter().copied()
                            .chain(advertisement.service_data.keys())
                            .any(|u| uuids.contains(&u)),
                };
                if wanted {
                    self.events.push(BindingsEvent::Discover {
                        id: address.into(),
                        address,
                        address_type,
                        connectable,
                        advertisement,
                        rssi,
                    });
                }
            }
        }
    }

    fn on_le_conn_complete(&mut self, status: u8, handle: u16, role: Option<u8>,
        address_type: Option<AddressType>, address: Option<Address>)
    {
        if let Some(role) = role {
            if role != 0 {
                if status == STATUS_UNKNOWN_CONNECTION_ID {
                    return;
                }
                warn!("role not central, ignoring connection result with status 0x{:02x} \
                    and handle {}", status, handle);
                if handle != 0 {
                    self.transport.disconnect(handle);
                }
                return;
            }
        }

        let pending = self.pending.clone();
        let resolved = match (address, address_type) {
            (Some(a), Some(t)) => Some((a.into(), a, t)),
            (a, t) => pending.and_then(|p| {
                let address = match a {
                    Some(v) => v,
                    None => p.id.address().ok()?,
                };
                Some((a.map(PeripheralId::from).unwrap_or(p.id), address,
                    t.unwrap_or(p.address_type)))
            }),
        };
        let (id, address, address_type): (PeripheralId, Address, AddressType) = match resolved {
            Some(v) => v,
            None => {
                warn!("connection complete without address and no pending connection");
                if handle != 0 {
                    self.transport.disconnect(handle);
                }
                self.process_pending_queue();
                return;
            }
        };
        debug!("connection complete: {} {:?} status 0x{:02x} handle {}",
            id, address_type, status, handle);

        let error = if status == 0 {
            if let Some(existing) = self.connections.handle(&id) {
                self.on_disconn_complete(existing, None);
            }

            let smp = Smp::new(self.transport.local_address_type(), self.transport.local_address(),
                address_type, address, self.passkey_entry);
            let mut conn = Connection {
                id: id.clone(),
                acl: AclStream::new(handle, smp),
                gatt: Gatt::new(handle, self.preferred_mtu),
                signaling: Signaling::new(handle),
            };
            conn.gatt.exchange_mtu(self.preferred_mtu);
            self.connections.insert(handle, conn);
            if let Some(conn) = self.connections.get_mut(handle) {
                flush(self.transport.as_mut(), conn, &mut self.events);
            }
            None
        } else {
            if status == HCI_STATUS_COMMAND_DISALLOWED {
                warn!("connection status 0x{:02x} usually requires a controller reset (handle {})",
                    status, handle);
                self.transport.cancel_connect();
                self.transport.reset();
                self.transport.init();
            }
            Some(Error::from_hci_status(status))
        };

        self.events.push(BindingsEvent::Connect { id, error });
        self.process_pending_queue();
    }

    fn on_disconn_complete(&mut self, handle: u16, reason: Option<u8>) {
        let mut conn = match self.connections.remove(handle) {
            Some(v) => v,
            None => {
                warn!("unknown handle {} disconnected", handle);
                return;
            }
        };
        conn.acl.push(self.transport.as_mut(), 0, None);
        conn.gatt.end();
        conn.signaling.end();
        self.events.push(BindingsEvent::Disconnect { id: conn.id, reason });
    }

    fn on_acl_data(&mut self, handle: u16, cid: u16, data: Vec<u8>) {
        let transport = self.transport.as_mut();
        let conn = match self.connections.get_mut(handle) {
            Some(v) => v,
            None => {
                debug!("ACL data for unknown handle {}", handle);
                return;
            }
        };
        let id = conn.id.clone();
        let signal = match conn.acl.push(transport, cid, Some(data)) {
            Some(v) => v,
            None => return,
        };
        let event = match signal {
            AclSignal::Data { cid: ATT_CID, data } => {
                conn.gatt.on_data(&data);
                flush(transport, conn, &mut self.events);
                return;
            }
            AclSignal::Data { cid: SIGNALING_CID, data } => {
                for action in conn.signaling.on_data(&data) {
                    match action {
                        SignalingAction::Reply(r) => conn.acl.write(transport, SIGNALING_CID, r),
                        SignalingAction::UpdateConnection(p) => transport.conn_update_le(handle,
                            p.min_interval, p.max_interval, p.latency, p.supervision_timeout),
                    }
                }
                return;
            }
            AclSignal::Data { cid, .. } => {
                debug!("ignoring data on unsupported channel 0x{:04x} of {}", cid, handle);
                return;
            }
            AclSignal::Encrypt(encrypt) => BindingsEvent::Encrypt { id, encrypt },
            AclSignal::EncryptFail => BindingsEvent::EncryptFail { id },
            AclSignal::PasskeyRequested => BindingsEvent::PasskeyRequested { id },
            AclSignal::Ltk(ltk) => BindingsEvent::Ltk { id, ltk },
            AclSignal::MasterIdent { ediv, rand } => BindingsEvent::MasterIdent { id, ediv, rand },
            AclSignal::End => return,
        };
        self.events.push(event);
    }

    fn process_pending_queue(&mut self) {
        if self.pending.is_none() {
            return;
        }
        match self.queue.pop_front() {
            Some(next) => {
                debug!("connecting to {} from queue", next.id);
                match next.id.address() {
                    Ok(address) => self.transport.create_le_conn(address, next.address_type,
                        next.params),
                    Err(e) => warn!("dropping queued connection to {}: {}", next.id, e),
                }
                self.pending = Some(next);
            }
            None => self.pending = None,
        }
    }

    fn handle(&self, id: &PeripheralId) -> Result<u16> {
        self.connections.handle(id).ok_or_else(|| not_connected(id))
    }

    fn with_gatt<R>(&mut self, id: &PeripheralId, f: impl FnOnce(&mut Gatt) -> Result<R>)
        -> Result<R>
    {
        let transport = self.transport.as_mut();
        let conn = self.connections.by_id_mut(id).ok_or_else(|| not_connected(id))?;
        let r = f(&mut conn.gatt);
        flush(transport, conn, &mut self.events);
        r
    }
}

/// Sends queued ATT frames and collects completed operations of a connection.
fn flush(transport: &mut dyn Transport, conn: &mut Connection, events: &mut Vec<BindingsEvent>) {
    for pdu in conn.gatt.take_outbox() {
        conn.acl.write(transport, ATT_CID, pdu);
    }
    for event in conn.gatt.take_events() {
        events.push(BindingsEvent::Gatt { id: conn.id.clone(), event });
    }
}

fn not_connected(id: &PeripheralId) -> Error {
    Error::new(ErrorKind::NotConnected, format!("peripheral {} is not connected", id))
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use crate::hci::mock::*;
    use super::*;

    const A: &str = "aa:bb:cc:dd:ee:ff";
    const B: &str = "11:22:33:44:55:66";

    fn bindings() -> (Bindings, MockTransport) {
        init_logger();
        let t = MockTransport::new();
        let b = Bindings::new(Box::new(t.clone()), Options {
            preferred_mtu: 256,
            passkey_entry: false,
            force_allow_duplicates: false,
            scan_interval: 0x10,
            scan_window: 0x10,
            active_scan: true,
        });
        (b, t)
    }

    fn id(s: &str) -> PeripheralId {
        s.parse().unwrap()
    }

    fn conn_complete(status: u8, handle: u16, address: &str) -> HciEvent {
        HciEvent::LeConnComplete {
            status,
            handle,
            role: Some(0),
            address_type: Some(AddressType::Random),
            address: Some(address.parse().unwrap()),
            interval: 0x18,
            latency: 0,
            supervision_timeout: 0xc8,
            master_clock_accuracy: 0,
        }
    }

    fn creates(t: &MockTransport) -> Vec<Address> {
        t.take().into_iter()
            .filter_map(|c| match c {
                Call::CreateLeConn { address, .. } => Some(address),
                _ => None,
            })
            .collect()
    }

    fn connected(b: &mut Bindings, t: &MockTransport, handle: u16, address: &str) {
        b.connect(&id(address), AddressType::Random, Default::default()).unwrap();
        b.handle_event(conn_complete(0, handle, address));
        b.handle_event(HciEvent::AclDataPkt { handle, cid: ATT_CID, data: hex!("03 b900").to_vec() });
        b.take_events();
        t.take();
    }

    #[test]
    fn second_connect_is_queued() {
        let (mut b, t) = bindings();
        b.connect(&id(A), AddressType::Public, Default::default()).unwrap();
        assert_eq!(creates(&t), vec![A.parse::<Address>().unwrap()]);

        b.connect(&id(B), AddressType::Public, Default::default()).unwrap();
        assert!(creates(&t).is_empty());

        b.handle_event(conn_complete(0x3e, 0, A));
        assert_eq!(creates(&t), vec![B.parse::<Address>().unwrap()]);
        match &b.take_events()[..] {
            [BindingsEvent::Connect { id: i, error: Some(e) }] => {
                assert_eq!(i, &id(A));
                assert_eq!(e.kind(), ErrorKind::Hci(0x3e));
                assert_eq!(e.description(), "Connection Failed to be Established (0x3e)");
            }
            e => panic!("{:?}", e),
        }

        b.handle_event(conn_complete(0, 0x41, B));
        assert!(creates(&t).is_empty());
        assert!(b.is_connected(&id(B)));
        assert!(b.pending.is_none());
    }

    #[test]
    fn connect_success_builds_session() {
        let (mut b, t) = bindings();
        b.connect(&id(A), AddressType::Random, Default::default()).unwrap();
        assert_eq!(t.take(), vec![
            Call::SetScanEnabled { enabled: false, filter_duplicates: true },
            Call::CreateLeConn { address: A.parse().unwrap(), address_type: AddressType::Random },
        ]);

        b.handle_event(conn_complete(0, 0x40, A));
        assert_eq!(t.take(), vec![Call::WriteAclData {
            handle: 0x40,
            cid: ATT_CID,
            data: hex!("02 0001").to_vec(),
        }]);
        assert!(matches!(&b.take_events()[..], [BindingsEvent::Connect { error: None, .. }]));
        assert_eq!(b.connections.handle(&id(A)), Some(0x40));

        b.handle_event(HciEvent::AclDataPkt { handle: 0x40, cid: ATT_CID, data: hex!("03 b900").to_vec() });
        assert_eq!(b.mtu(&id(A)), Some(185));
        assert!(matches!(&b.take_events()[..],
            [BindingsEvent::Gatt { event: GattEvent::Mtu(185), .. }]));
    }

    #[test]
    fn unknown_handle_disconnect_is_ignored() {
        let (mut b, t) = bindings();
        connected(&mut b, &t, 0x40, A);

        b.handle_event(HciEvent::DisconnComplete { handle: 7, reason: 0x13 });
        assert!(b.take_events().is_empty());
        assert!(t.take().is_empty());
        assert_eq!(b.connections.handle(&id(A)), Some(0x40));
        assert_eq!(b.connections.sessions.len(), 1);
    }

    #[test]
    fn disconnect_cleans_up() {
        let (mut b, t) = bindings();
        connected(&mut b, &t, 0x40, A);

        b.disconnect(&id(A)).unwrap();
        assert_eq!(t.take(), vec![Call::Disconnect(0x40)]);

        b.handle_event(HciEvent::DisconnComplete { handle: 0x40, reason: 0x13 });
        match &b.take_events()[..] {
            [BindingsEvent::Disconnect { id: i, reason: Some(0x13) }] => assert_eq!(i, &id(A)),
            e => panic!("{:?}", e),
        }
        assert!(!b.is_connected(&id(A)));
        assert!(b.connections.sessions.is_empty());

        assert_eq!(b.disconnect(&id(A)).unwrap_err().kind(), ErrorKind::NotConnected);
        assert_eq!(b.discover_services(&id(A), &[]).unwrap_err().kind(), ErrorKind::NotConnected);
        b.handle_event(HciEvent::AclDataPkt { handle: 0x40, cid: ATT_CID, data: vec![0x0b] });
        assert!(t.take().is_empty());
    }

    #[test]
    fn reconnect_replaces_session() {
        let (mut b, t) = bindings();
        connected(&mut b, &t, 0x40, A);

        b.connect(&id(A), AddressType::Random, Default::default()).unwrap();
        b.handle_event(conn_complete(0, 0x41, A));
        match &b.take_events()[..] {
            [BindingsEvent::Disconnect { reason: None, .. }, BindingsEvent::Connect { error: None, .. }] => {}
            e => panic!("{:?}", e),
        }
        assert_eq!(b.connections.handle(&id(A)), Some(0x41));
        assert_eq!(b.connections.sessions.len(), 1);
    }

    #[test]
    fn command_disallowed_resets_controller() {
        let (mut b, t) = bindings();
        b.connect(&id(A), AddressType::Public, Default::default()).unwrap();
        t.take();
        b.handle_event(conn_complete(0x0c, 0, A));
        assert_eq!(t.take(), vec![Call::CancelConnect, Call::Reset, Call::Init]);
        assert!(matches!(&b.take_events()[..],
            [BindingsEvent::Connect { error: Some(e), .. }] if e.kind() == ErrorKind::Hci(0x0c)));
    }

    #[test]
    fn foreign_role_is_rejected() {
        let (mut b, t) = bindings();
        let mut ev = conn_complete(0, 0x40, A);
        if let HciEvent::LeConnComplete { role, .. } = &mut ev {
            *role = Some(1);
        }
        b.handle_event(ev.clone());
        assert_eq!(t.take(), vec![Call::Disconnect(0x40)]);

        if let HciEvent::LeConnComplete { status, .. } = &mut ev {
            *status = 0x02;
        }
        b.handle_event(ev);
        assert!(t.take().is_empty());
        assert!(b.take_events().is_empty());
    }

    #[test]
    fn address_falls_back_to_pending() {
        let (mut b, t) = bindings();
        b.connect(&id(A), AddressType::Random, Default::default()).unwrap();
        t.take();
        b.handle_event(HciEvent::LeConnComplete {
            status: 0,
            handle: 0x40,
            role: None,
            address_type: None,
            address: None,
            interval: 0,
            latency: 0,
            supervision_timeout: 0,
            master_clock_accuracy: 0,
        });
        assert!(b.is_connected(&id(A)));
    }

    #[test]
    fn cancel_connect_checks_pending() {
        let (mut b, t) = bindings();
        assert_eq!(b.cancel_connect(&id(A)).unwrap_err().kind(), ErrorKind::NotConnecting);

        b.connect(&id(A), AddressType::Public, Default::default()).unwrap();
        b.connect(&id(B), AddressType::Public, Default::default()).unwrap();
        t.take();

        b.cancel_connect(&id(A)).unwrap();
        let calls = t.take();
        assert_eq!(calls[0], Call::CancelConnect);
        assert_eq!(calls[1], Call::CreateLeConn { address: B.parse().unwrap(), address_type: AddressType::Public });
        assert!(!b.is_connecting(&id(A)));
        assert!(b.is_connecting(&id(B)));
    }

    #[test]
    fn cancel_connect_drops_queued() {
        let (mut b, t) = bindings();
        b.connect(&id(A), AddressType::Public, Default::default()).unwrap();
        b.connect(&id(B), AddressType::Public, Default::default()).unwrap();
        t.take();

        b.cancel_connect(&id(B)).unwrap();
        assert!(t.take().is_empty());
        assert!(!b.is_connecting(&id(B)));
        assert_eq!(b.cancel_connect(&id(B)).unwrap_err().kind(), ErrorKind::NotConnecting);

        b.handle_event(conn_complete(0, 0x40, A));
        assert!(creates(&t).is_empty());
    }

    #[test]
    fn repeated_connect_is_not_queued_twice() {
        let (mut b, t) = bindings();
        b.connect(&id(A), AddressType::Public, Default::default()).unwrap();
        b.connect(&id(B), AddressType::Public, Default::default()).unwrap();
        b.connect(&id(A), AddressType::Public, Default::default()).unwrap();
        b.connect(&id(B), AddressType::Public, Default::default()).unwrap();
        assert_eq!(creates(&t), vec![A.parse::<Address>().unwrap()]);
        t.take();

        b.handle_event(conn_complete(0, 0x40, A));
        assert_eq!(creates(&t), vec![B.parse::<Address>().unwrap()]);
        t.take();
        b.handle_event(conn_complete(0, 0x41, B));
        assert!(creates(&t).is_empty());
    }

    #[test]
    fn discover_filters_by_service() {
        let (mut b, _t) = bindings();
        let report = |eir: &[u8]| HciEvent::LeAdvertisingReport {
            status: 0,
            kind: 0,
            address: A.parse().unwrap(),
            address_type: AddressType::Public,
            eir: eir.to_vec(),
            rssi: -60,
        };

        b.handle_event(report(&hex!("0303 0f18")));
        assert!(b.take_events().is_empty());

        b.start_scanning(&[Uuid::from_u16(0x180f)], false);
        b.handle_event(report(&hex!("0303 0a18")));
        assert!(b.take_events().is_empty());

        b.handle_event(report(&hex!("0303 0f18")));
        assert!(matches!(&b.take_events()[..], [BindingsEvent::Discover { rssi: -60, .. }]));

        b.handle_event(report(&hex!("0416 0f18 64")));
        match &b.take_events()[..] {
            [BindingsEvent::Discover { id: i, connectable: true, .. }] => assert_eq!(i, &id(A)),
            e => panic!("{:?}", e),
        }

        b.start_scanning(&[], true);
        b.handle_event(report(&[]));
        assert_eq!(b.take_events().len(), 1);
    }

    #[test]
    fn signaling_updates_connection() {
        let (mut b, t) = bindings();
        connected(&mut b, &t, 0x40, A);
        b.handle_event(HciEvent::AclDataPkt {
            handle: 0x40,
            cid: SIGNALING_CID,
            data: hex!("12 07 0800 1800 2800 0000 f401").to_vec(),
        });
        assert_eq!(t.take(), vec![
            Call::WriteAclData { handle: 0x40, cid: SIGNALING_CID, data: hex!("13 07 0200 0000").to_vec() },
            Call::ConnUpdateLe { handle: 0x40, min_interval: 0x18, max_interval: 0x28 },
        ]);
    }

    #[test]
    fn gatt_round_trip() {
        let (mut b, t) = bindings();
        connected(&mut b, &t, 0x40, A);
        b.discover_services(&id(A), &[]).unwrap();
        assert_eq!(t.acl_writes(ATT_CID), vec![hex!("10 0100 ffff 0028").to_vec()]);
        b.handle_event(HciEvent::AclDataPkt {
            handle: 0x40,
            cid: ATT_CID,
            data: hex!("11 06 0100 ffff 0f18").to_vec(),
        });
        match &b.take_events()[..] {
            [BindingsEvent::Gatt { event: GattEvent::ServicesDiscovered(Ok(s)), .. }] =>
                assert_eq!(s[0].uuid, Uuid::from_u16(0x180f)),
            e => panic!("{:?}", e),
        }
    }

    #[test]
    fn encryption_events() {
        let (mut b, t) = bindings();
        connected(&mut b, &t, 0x40, A);
        b.encrypt(&id(A)).unwrap();
        assert_eq!(t.acl_writes(SMP_CID).len(), 1);

        b.handle_event(HciEvent::EncryptChange { handle: 0x40, encrypt: true });
        assert!(matches!(&b.take_events()[..], [BindingsEvent::Encrypt { encrypt: true, .. }]));

        b.handle_event(HciEvent::AclDataPkt { handle: 0x40, cid: SMP_CID, data: vec![0x05, 0x08] });
        assert!(matches!(&b.take_events()[..], [BindingsEvent::EncryptFail { .. }]));

        assert_eq!(b.provide_passkey(&id(A), 1).unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn rssi() {
        let (mut b, t) = bindings();
        connected(&mut b, &t, 0x40, A);
        b.update_rssi(&id(A)).unwrap();
        assert_eq!(t.take(), vec![Call::ReadRssi(0x40)]);
        b.handle_event(HciEvent::RssiRead { handle: 0x40, rssi: -42 });
        b.handle_event(HciEvent::RssiRead { handle: 0x99, rssi: -1 });
        assert!(matches!(&b.take_events()[..], [BindingsEvent::RssiUpdate { rssi: -42, .. }]));
    }

    #[test]
    fn scan_events() {
        let (mut b, t) = bindings();
        b.handle_event(HciEvent::StateChange(AdapterState::PoweredOn));
        b.handle_event(HciEvent::StateChange(AdapterState::PoweredOn));
        assert_eq!(t.take(), vec![
            Call::SetScanEnabled { enabled: false, filter_duplicates: true },
            Call::SetScanParameters { interval: 0x10, window: 0x10, active: true },
        ]);
        b.start_scanning(&[], false);
        t.take();
        b.handle_event(HciEvent::LeScanEnableSet { status: 0 });
        b.stop_scanning();
        b.handle_event(HciEvent::LeScanEnableSet { status: 0 });
        match &b.take_events()[..] {
            [BindingsEvent::StateChange(AdapterState::PoweredOn),
                BindingsEvent::ScanStart { filter_duplicates: true },
                BindingsEvent::ScanStop] => {}
            e => panic!("{:?}", e),
        }
        assert_eq!(b.state(), Some(AdapterState::PoweredOn));
    }
}
