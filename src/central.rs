pub mod attribute;
pub mod characteristic;
pub mod descriptor;
pub mod peripheral;
mod peripheral_db;
pub mod service;

use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::*;
use crate::hci::{Address, AddressType, AdapterState, Bindings, BindingsEvent, BindingsOptions,
    ConnectionParameters, HciEvent, PeripheralId, Transport};
use crate::hci::gap;
use crate::hci::gatt::GattEvent;
use crate::request::{self, Projection, Request, RequestOptions};
use crate::sync::{self, Receiver, Subject, Subscription};
use crate::uuid::Uuid;

use characteristic::Characteristic;
use descriptor::Descriptor;
use peripheral::{ConnectionState, Peripheral, PeripheralDump};
use peripheral_db::PeripheralDb;
use service::Service;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum CentralEvent {
    StateChanged {
        new_state: AdapterState,
    },

    AddressChanged {
        address: Address,
    },

    ScanParametersSet,

    ScanStarted {
        filter_duplicates: bool,
    },

    ScanStopped,

    PeripheralDiscovered {
        peripheral: Peripheral,
        /// Advertisement data merged from all reports of the peripheral.
        advertisement_data: AdvertisementData,
        rssi: i8,
    },

    PeripheralConnected {
        peripheral: Peripheral,
    },

    PeripheralConnectFailed {
        peripheral: Peripheral,
        error: Error,
    },

    PeripheralDisconnected {
        peripheral: Peripheral,
        /// HCI reason code or `None` if the link was replaced by a new connection.
        reason: Option<u8>,
    },

    RssiUpdated {
        peripheral: Peripheral,
        rssi: i8,
    },

    MtuChanged {
        peripheral: Peripheral,
        mtu: u16,
    },

    ServicesDiscovered {
        peripheral: Peripheral,
        services: Result<Vec<Service>>,
    },

    IncludedServicesDiscovered {
        peripheral: Peripheral,
        service: Service,
        included_service_uuids: Result<Vec<Uuid>>,
    },

    CharacteristicsDiscovered {
        peripheral: Peripheral,
        service: Service,
        characteristics: Result<Vec<Characteristic>>,
    },

    DescriptorsDiscovered {
        peripheral: Peripheral,
        characteristic: Characteristic,
        descriptors: Result<Vec<Descriptor>>,
    },

    CharacteristicValue {
        peripheral: Peripheral,
        characteristic: Characteristic,
        value: Result<Vec<u8>>,
        /// Whether the value came from a notification or indication rather than a read.
        is_notification: bool,
    },

    WriteCharacteristicResult {
        peripheral: Peripheral,
        characteristic: Characteristic,
        result: Result<()>,
    },

    BroadcastChanged {
        peripheral: Peripheral,
        characteristic: Characteristic,
        result: Result<bool>,
    },

    SubscriptionChanged {
        peripheral: Peripheral,
        characteristic: Characteristic,
        result: Result<bool>,
    },

    DescriptorValue {
        peripheral: Peripheral,
        descriptor: Descriptor,
        value: Result<Vec<u8>>,
    },

    WriteDescriptorResult {
        peripheral: Peripheral,
        descriptor: Descriptor,
        result: Result<()>,
    },

    HandleValue {
        peripheral: Peripheral,
        handle: u16,
        value: Result<Vec<u8>>,
    },

    WriteHandleResult {
        peripheral: Peripheral,
        handle: u16,
        result: Result<()>,
    },

    /// Notification or indication of an attribute without a known characteristic.
    HandleNotification {
        peripheral: Peripheral,
        handle: u16,
        value: Vec<u8>,
    },

    EncryptionChanged {
        peripheral: Peripheral,
        encrypted: bool,
    },

    EncryptionFailed {
        peripheral: Peripheral,
    },

    /// Passkey entry pairing is waiting for [`Central::provide_passkey`].
    PasskeyRequested {
        peripheral: Peripheral,
    },

    LongTermKey {
        peripheral: Peripheral,
        ltk: [u8; 16],
    },

    MasterIdentification {
        peripheral: Peripheral,
        ediv: [u8; 2],
        rand: [u8; 8],
    },

    Warning {
        message: String,
    },
}

assert_impl_all!(CentralEvent: Send, Sync);

/// Supplies the passkey for passkey entry pairing. Returning `None` leaves the pairing waiting
/// for [`Central::provide_passkey`].
pub type PasskeyCallback = Arc<dyn Fn(&Peripheral) -> Option<u32> + Send + Sync>;

#[derive(Clone)]
pub struct CentralBuilder {
    request_options: RequestOptions,
    connect_options: RequestOptions,
    preferred_mtu: u16,
    scan_interval: u16,
    scan_window: u16,
    active_scan: bool,
    force_allow_duplicates: Option<bool>,
    passkey: Option<PasskeyCallback>,
    event_capacity: usize,
}

impl CentralBuilder {
    pub fn new() -> Self {
        Self {
            request_options: RequestOptions::default(),
            connect_options: RequestOptions::once(Duration::from_secs(30)),
            preferred_mtu: 256,
            scan_interval: gap::DEFAULT_SCAN_INTERVAL,
            scan_window: gap::DEFAULT_SCAN_WINDOW,
            active_scan: true,
            force_allow_duplicates: None,
            passkey: None,
            event_capacity: sync::DEFAULT_CAPACITY,
        }
    }

    /// Timeout and retries of GATT and RSSI requests.
    pub fn request_options(&mut self, v: RequestOptions) -> &mut Self {
        self.request_options = v;
        self
    }

    /// Timeout and retries of connection and encryption requests.
    pub fn connect_options(&mut self, v: RequestOptions) -> &mut Self {
        self.connect_options = v;
        self
    }

    pub fn preferred_mtu(&mut self, v: u16) -> &mut Self {
        self.preferred_mtu = v;
        self
    }

    /// Scan interval in 0.625 ms units.
    pub fn scan_interval(&mut self, v: u16) -> &mut Self {
        self.scan_interval = v;
        self
    }

    /// Scan window in 0.625 ms units.
    pub fn scan_window(&mut self, v: u16) -> &mut Self {
        self.scan_window = v;
        self
    }

    pub fn active_scan(&mut self, v: bool) -> &mut Self {
        self.active_scan = v;
        self
    }

    /// Disables controller duplicate filtering regardless of scan options. Detected from the
    /// kernel release by default.
    pub fn force_allow_duplicates(&mut self, v: bool) -> &mut Self {
        self.force_allow_duplicates = Some(v);
        self
    }

    /// Enables passkey entry pairing with the given passkey source.
    pub fn passkey(&mut self, f: impl Fn(&Peripheral) -> Option<u32> + Send + Sync + 'static)
        -> &mut Self
    {
        self.passkey = Some(Arc::new(f));
        self
    }

    /// Events each subscriber, including every in-flight request, may fall behind by before
    /// it starts losing the oldest ones. Values below 1 are raised to 1.
    pub fn event_capacity(&mut self, v: usize) -> &mut Self {
        self.event_capacity = v.max(1);
        self
    }

    pub fn build(&self, transport: impl Transport + 'static)
        -> (Central, Subscription<CentralEvent>)
    {
        Central::build(self, Box::new(transport))
    }
}

impl Default for CentralBuilder {
    fn default() -> Self {
        Self::new()
    }
}

assert_impl_all!(CentralBuilder: Send, Sync);

#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    allow_duplicates: bool,
    services: Vec<Uuid>,
}

impl ScanOptions {
    /// Report every advertisement instead of the first one per peripheral and scan.
    pub fn allow_duplicates(mut self, v: bool) -> Self {
        self.allow_duplicates = v;
        self
    }

    /// Only report peripherals advertising any of the services, either in the service UUID
    /// lists or in service data.
    pub fn services(mut self, uuids: &[Uuid]) -> Self {
        for &uuid in uuids {
            if !self.services.contains(&uuid) {
                self.services.push(uuid);
            }
        }
        self
    }
}

assert_impl_all!(ScanOptions: Send, Sync);

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(in crate) local_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(in crate) tx_power_level: Option<i8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(in crate) manufacturer_data: Option<Vec<u8>>,
    #[serde(default)]
    pub(in crate) service_data: ServiceData,
    #[serde(default)]
    pub(in crate) service_uuids: Vec<Uuid>,
    #[serde(default)]
    pub(in crate) solicited_service_uuids: Vec<Uuid>,
}

assert_impl_all!(AdvertisementData: Send, Sync);

impl AdvertisementData {
    /// The local name of a peripheral, complete or shortened.
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_ref().map(|v| v.as_str())
    }

    /// The transmit power of a peripheral.
    /// You can calculate the path loss by comparing the RSSI value with the transmitting power level.
    pub fn tx_power_level(&self) -> Option<i8> {
        self.tx_power_level
    }

    /// The manufacturer data of a peripheral, including the company identifier.
    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        self.manufacturer_data.as_ref().map(|v| v.as_slice())
    }

    /// Service-specific advertisement data.
    pub fn service_data(&self) -> &ServiceData {
        &self.service_data
    }

    /// Service UUIDs.
    pub fn service_uuids(&self) -> &[Uuid] {
        &self.service_uuids
    }

    /// Solicited service UUIDs.
    pub fn solicited_service_uuids(&self) -> &[Uuid] {
        &self.solicited_service_uuids
    }

    /// Overwrites fields present in `other`. Lists count as present when not empty.
    pub(in crate) fn merge(&mut self, other: &AdvertisementData) {
        if other.local_name.is_some() {
            self.local_name = other.local_name.clone();
        }
        if other.tx_power_level.is_some() {
            self.tx_power_level = other.tx_power_level;
        }
        if other.manufacturer_data.is_some() {
            self.manufacturer_data = other.manufacturer_data.clone();
        }
        if !other.service_data.is_empty() {
            self.service_data = other.service_data.clone();
        }
        if !other.service_uuids.is_empty() {
            self.service_uuids = other.service_uuids.clone();
        }
        if !other.solicited_service_uuids.is_empty() {
            self.solicited_service_uuids = other.solicited_service_uuids.clone();
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
struct ServiceDataEntry {
    uuid: Uuid,
    data: Vec<u8>,
}

/// Service-specific advertisement data in advertisement order. The same service UUID may
/// appear more than once.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceData(Vec<ServiceDataEntry>);

assert_impl_all!(ServiceData: Send, Sync);

impl ServiceData {
    pub(in crate) fn push(&mut self, uuid: Uuid, data: Vec<u8>) {
        self.0.push(ServiceDataEntry { uuid, data });
    }

    /// Data of the first entry for `uuid`.
    pub fn get(&self, uuid: Uuid) -> Option<&[u8]> {
        self.0.iter().find(|e| e.uuid == uuid).map(|e| e.data.as_slice())
    }

    pub fn keys<'a>(&'a self) -> impl Iterator<Item=Uuid> + 'a {
        self.0.iter().map(|e| e.uuid)
    }

    pub fn values<'a>(&'a self) -> impl Iterator<Item=&[u8]> + 'a {
        self.0.iter().map(|e| e.data.as_slice())
    }

    pub fn iter<'a>(&'a self) -> impl Iterator<Item=(Uuid, &[u8])> + 'a {
        self.0.iter().map(|e| (e.uuid, e.data.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fails a request when `peripheral` disconnects while the request is in flight.
pub(in crate) fn reject_on_disconnect<T>(event: &CentralEvent, peripheral: &Peripheral)
    -> Projection<T>
{
    match event {
        CentralEvent::PeripheralDisconnected { peripheral: p, .. } if p == peripheral =>
            Projection::Reject(Error::new(ErrorKind::NotConnected,
                format!("{} disconnected", peripheral.id()))),
        _ => Projection::Ignore,
    }
}

struct ScanState {
    allow_duplicates: bool,
    discovered: HashSet<PeripheralId>,
}

struct Config {
    request_options: RequestOptions,
    connect_options: RequestOptions,
    passkey: Option<PasskeyCallback>,
}

pub(in crate) struct Inner {
    bindings: Mutex<Bindings>,
    events: Subject<CentralEvent>,
    peripherals: Mutex<PeripheralDb>,
    scan: Mutex<ScanState>,
    config: Config,
}

/// Entry point of the central role.
///
/// Operations here are fire-and-forget: they validate synchronously, issue the command and
/// report the outcome as a [`CentralEvent`]. Awaitable forms of the same operations are on
/// [`Peripheral`], [`Service`], [`Characteristic`] and [`Descriptor`].
///
/// Inbound controller events are fed with [`handle_event`](#method.handle_event) or
/// [`run`](#method.run).
#[derive(Clone)]
pub struct Central(Arc<Inner>);

assert_impl_all!(Central: Send, Sync);

impl Central {
    pub fn new(transport: impl Transport + 'static) -> (Self, Subscription<CentralEvent>) {
        CentralBuilder::new().build(transport)
    }

    fn build(b: &CentralBuilder, transport: Box<dyn Transport>)
        -> (Self, Subscription<CentralEvent>)
    {
        let bindings = Bindings::new(transport, BindingsOptions {
            preferred_mtu: b.preferred_mtu,
            passkey_entry: b.passkey.is_some(),
            force_allow_duplicates: b.force_allow_duplicates
                .unwrap_or_else(gap::needs_duplicates_allowed),
            scan_interval: b.scan_interval,
            scan_window: b.scan_window,
            active_scan: b.active_scan,
        });
        let events = Subject::with_capacity(b.event_capacity);
        let subscription = events.subscribe();
        (Self(Arc::new(Inner {
            bindings: Mutex::new(bindings),
            events,
            peripherals: Mutex::new(PeripheralDb::default()),
            scan: Mutex::new(ScanState {
                allow_duplicates: false,
                discovered: HashSet::new(),
            }),
            config: Config {
                request_options: b.request_options,
                connect_options: b.connect_options,
                passkey: b.passkey.clone(),
            },
        })), subscription)
    }

    pub(in crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self(inner)
    }

    /// Subscribes to events emitted from now on.
    pub fn events(&self) -> Subscription<CentralEvent> {
        self.0.events.subscribe()
    }

    /// Last reported controller state or `None` if the controller hasn't reported one yet.
    pub fn state(&self) -> Option<AdapterState> {
        self.0.bindings.lock().state()
    }

    /// Initializes the transport. The controller reports its state afterwards.
    pub fn init(&self) {
        self.0.bindings.lock().init();
    }

    pub fn reset(&self) {
        self.0.bindings.lock().reset();
    }

    /// Dispatches one decoded controller event.
    pub fn handle_event(&self, event: HciEvent) {
        trace!("HCI event: {:?}", event);
        let events = {
            let mut bindings = self.0.bindings.lock();
            bindings.handle_event(event);
            bindings.take_events()
        };
        self.dispatch(events);
    }

    /// Pumps controller events until the channel closes.
    pub async fn run(&self, mut events: Receiver<HciEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("controller event channel closed");
    }

    /// Known peripherals ordered by identity.
    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.0.peripherals.lock().all()
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.0.peripherals.lock().get(id).cloned()
    }

    /// Returns the peripheral with `address`, registering it if it's unknown. Allows connecting
    /// to a peripheral with a known address without scanning for it first.
    pub fn add_peripheral(&self, address: Address, address_type: AddressType) -> Peripheral {
        let id = PeripheralId::from(address);
        let mut db = self.0.peripherals.lock();
        if let Some(p) = db.get(&id) {
            return p.clone();
        }
        let p = Peripheral::new(Arc::downgrade(&self.0), address, address_type);
        db.insert(p.clone());
        p
    }

    /// Removes peripherals that are not connected and haven't advertised for longer than
    /// `older_than`. Returns the removed ones.
    pub fn expire(&self, older_than: Duration) -> Vec<Peripheral> {
        let expired = self.0.peripherals.lock().expire(older_than);
        if !expired.is_empty() {
            let mut scan = self.0.scan.lock();
            for p in &expired {
                scan.discovered.remove(p.id());
            }
            debug!("expired {} peripherals", expired.len());
        }
        expired
    }

    /// Registers a peripheral from a dump. If the peripheral is already known, the dumped
    /// attributes are merged into it and the known object is returned.
    pub fn restore(&self, dump: &PeripheralDump) -> Peripheral {
        let restored = Peripheral::from_dump_in(Arc::downgrade(&self.0), dump);
        let existing = {
            let mut db = self.0.peripherals.lock();
            match db.get(&dump.id).cloned() {
                Some(p) => p,
                None => {
                    db.insert(restored.clone());
                    return restored;
                }
            }
        };
        restored.merge_services_to(&existing);
        existing
    }

    pub fn set_scan_parameters(&self, interval: u16, window: u16) -> Result<()> {
        self.with_bindings(|b| {
            b.set_scan_parameters(interval, window);
            Ok(())
        })
    }

    /// Starts scanning. Fails with [`ErrorKind::PoweredOff`] unless the controller is powered
    /// on. Each call starts a new scan, so every peripheral is reported again at least once.
    pub fn start_scanning(&self, options: &ScanOptions) -> Result<()> {
        match self.state() {
            Some(AdapterState::PoweredOn) => {}
            state => return Err(Error::new(ErrorKind::PoweredOff,
                format!("can't start scanning in {:?} state", state))),
        }
        {
            let mut scan = self.0.scan.lock();
            scan.allow_duplicates = options.allow_duplicates;
            scan.discovered.clear();
        }
        self.with_bindings(|b| {
            b.start_scanning(&options.services, options.allow_duplicates);
            Ok(())
        })
    }

    pub fn stop_scanning(&self) -> Result<()> {
        self.with_bindings(|b| {
            b.stop_scanning();
            Ok(())
        })
    }

    /// Starts scanning and resolves with the controller duplicate filtering state once the
    /// controller confirms.
    pub fn start_scanning_async(&self, options: ScanOptions) -> Request<bool> {
        self.request(RequestOptions::once(self.0.config.connect_options.timeout),
            move |central| central.start_scanning(&options),
            |event| match event {
                CentralEvent::ScanStarted { filter_duplicates } => Projection::Resolve(*filter_duplicates),
                _ => Projection::Ignore,
            })
    }

    pub fn stop_scanning_async(&self) -> Request<()> {
        self.request(RequestOptions::once(self.0.config.connect_options.timeout),
            |central| central.stop_scanning(),
            |event| match event {
                CentralEvent::ScanStopped => Projection::Resolve(()),
                _ => Projection::Ignore,
            })
    }

    pub fn connect(&self, id: &PeripheralId) -> Result<()> {
        self.connect_with_parameters(id, ConnectionParameters::default())
    }

    /// Connects to a known peripheral. Only one connection attempt is in flight at a time,
    /// further ones are queued.
    pub fn connect_with_parameters(&self, id: &PeripheralId, params: ConnectionParameters)
        -> Result<()>
    {
        let peripheral = self.known(id)?;
        match peripheral.connection_state() {
            ConnectionState::Connected => return Err(Error::new(ErrorKind::AlreadyConnected,
                format!("{} is already connected", id))),
            ConnectionState::Connecting => return Err(Error::new(ErrorKind::AlreadyConnecting,
                format!("connection to {} is already pending", id))),
            _ => {}
        }
        let address_type = peripheral.address_type();
        self.with_bindings(|b| b.connect(id, address_type, params))?;
        peripheral.set_connection_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Cancels the connection attempt to `id`, in flight or queued.
    pub fn cancel_connect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.known(id)?;
        self.with_bindings(|b| b.cancel_connect(id))?;
        peripheral.set_connection_state(ConnectionState::Disconnected);
        Ok(())
    }

    pub fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.known(id)?;
        self.with_bindings(|b| b.disconnect(id))?;
        peripheral.set_connection_state(ConnectionState::Disconnecting);
        Ok(())
    }

    pub fn update_rssi(&self, id: &PeripheralId) -> Result<()> {
        self.known(id)?;
        self.with_bindings(|b| b.update_rssi(id))
    }

    /// Starts encryption of the link, pairing first if needed.
    pub fn encrypt(&self, id: &PeripheralId) -> Result<()> {
        self.known(id)?;
        self.with_bindings(|b| b.encrypt(id))
    }

    /// Continues a passkey entry pairing with `id`.
    pub fn provide_passkey(&self, id: &PeripheralId, passkey: u32) -> Result<()> {
        self.known(id)?;
        self.with_bindings(|b| b.provide_passkey(id, passkey))
    }

    pub fn discover_services(&self, id: &PeripheralId, uuids: &[Uuid]) -> Result<()> {
        self.known(id)?;
        self.with_bindings(|b| b.discover_services(id, uuids))
    }

    pub fn discover_included_services(&self, id: &PeripheralId, service: Uuid, uuids: &[Uuid])
        -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.discover_included_services(id, service, uuids))
    }

    pub fn discover_characteristics(&self, id: &PeripheralId, service: Uuid, uuids: &[Uuid])
        -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.discover_characteristics(id, service, uuids))
    }

    pub fn discover_descriptors(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid)
        -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.discover_descriptors(id, service, characteristic))
    }

    pub fn read(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.known(id)?;
        self.with_bindings(|b| b.read(id, service, characteristic))
    }

    pub fn write(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid, data: &[u8],
        without_response: bool) -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.write(id, service, characteristic, data.to_vec(),
            without_response))
    }

    pub fn broadcast(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        enable: bool) -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.broadcast(id, service, characteristic, enable))
    }

    pub fn notify(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid, enable: bool)
        -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.notify(id, service, characteristic, enable))
    }

    pub fn read_value(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        descriptor: Uuid) -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.read_value(id, service, characteristic, descriptor))
    }

    pub fn write_value(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid,
        descriptor: Uuid, data: &[u8]) -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.write_value(id, service, characteristic, descriptor,
            data.to_vec()))
    }

    pub fn read_handle(&self, id: &PeripheralId, handle: u16) -> Result<()> {
        self.known(id)?;
        self.with_bindings(|b| b.read_handle(id, handle))
    }

    pub fn write_handle(&self, id: &PeripheralId, handle: u16, data: &[u8],
        without_response: bool) -> Result<()>
    {
        self.known(id)?;
        self.with_bindings(|b| b.write_handle(id, handle, data.to_vec(), without_response))
    }

    pub(in crate) fn request_options(&self) -> RequestOptions {
        self.0.config.request_options
    }

    pub(in crate) fn connect_options(&self) -> RequestOptions {
        self.0.config.connect_options
    }

    /// Builds a request whose send action runs a fire-and-forget operation of this central.
    pub(in crate) fn request<T, S, P>(&self, options: RequestOptions, mut send: S, project: P)
        -> Request<T>
    where
        T: Send + 'static,
        S: FnMut(&Central) -> Result<()> + Send + 'static,
        P: FnMut(&CentralEvent) -> Projection<T> + Send + 'static,
    {
        let central = self.clone();
        request::request(&self.0.events, options, move || send(&central).map(|_| true), project)
    }

    fn known(&self, id: &PeripheralId) -> Result<Peripheral> {
        self.peripheral(id).ok_or_else(|| Error::unknown_peripheral(id))
    }

    /// Runs `f` on the bindings and dispatches what it produced after the lock is released.
    fn with_bindings<T>(&self, f: impl FnOnce(&mut Bindings) -> Result<T>) -> Result<T> {
        let (r, events) = {
            let mut bindings = self.0.bindings.lock();
            let r = f(&mut bindings);
            (r, bindings.take_events())
        };
        self.dispatch(events);
        r
    }

    fn emit(&self, event: CentralEvent) {
        self.0.events.emit(event);
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.emit(CentralEvent::Warning { message });
    }

    fn dispatch(&self, events: Vec<BindingsEvent>) {
        for event in events {
            self.dispatch_one(event);
        }
    }

    fn dispatch_one(&self, event: BindingsEvent) {
        use BindingsEvent::*;
        let (id, event) = match event {
            StateChange(new_state) => return self.emit(CentralEvent::StateChanged { new_state }),
            AddressChange(address) => return self.emit(CentralEvent::AddressChanged { address }),
            ScanParametersSet => return self.emit(CentralEvent::ScanParametersSet),
            ScanStart { filter_duplicates } =>
                return self.emit(CentralEvent::ScanStarted { filter_duplicates }),
            ScanStop => return self.emit(CentralEvent::ScanStopped),
            Discover { id, address, address_type, connectable, advertisement, rssi } =>
                return self.on_discover(id, address, address_type, connectable, &advertisement,
                    rssi),
            Connect { id, error } => (id, Dispatch::Connect(error)),
            Disconnect { id, reason } => (id, Dispatch::Disconnect(reason)),
            RssiUpdate { id, rssi } => (id, Dispatch::Rssi(rssi)),
            Encrypt { id, encrypt } => (id, Dispatch::Encrypt(encrypt)),
            EncryptFail { id } => (id, Dispatch::EncryptFail),
            PasskeyRequested { id } => (id, Dispatch::PasskeyRequested),
            Ltk { id, ltk } => (id, Dispatch::Ltk(ltk)),
            MasterIdent { id, ediv, rand } => (id, Dispatch::MasterIdent(ediv, rand)),
            Gatt { id, event } => (id, Dispatch::Gatt(event)),
        };
        let peripheral = match self.peripheral(&id) {
            Some(v) => v,
            None => {
                debug!("dropping {:?} for unknown peripheral {}", event, id);
                return;
            }
        };
        let event = match event {
            Dispatch::Connect(None) => {
                peripheral.set_connection_state(ConnectionState::Connected);
                self.seed_gatt(&peripheral);
                CentralEvent::PeripheralConnected { peripheral }
            }
            Dispatch::Connect(Some(error)) => {
                peripheral.set_connection_state(ConnectionState::Error);
                CentralEvent::PeripheralConnectFailed { peripheral, error }
            }
            Dispatch::Disconnect(reason) => {
                peripheral.set_connection_state(ConnectionState::Disconnected);
                CentralEvent::PeripheralDisconnected { peripheral, reason }
            }
            Dispatch::Rssi(rssi) => {
                peripheral.set_rssi(rssi);
                CentralEvent::RssiUpdated { peripheral, rssi }
            }
            Dispatch::Encrypt(encrypted) => CentralEvent::EncryptionChanged { peripheral, encrypted },
            Dispatch::EncryptFail => CentralEvent::EncryptionFailed { peripheral },
            Dispatch::PasskeyRequested => return self.on_passkey_requested(peripheral),
            Dispatch::Ltk(ltk) => CentralEvent::LongTermKey { peripheral, ltk },
            Dispatch::MasterIdent(ediv, rand) =>
                CentralEvent::MasterIdentification { peripheral, ediv, rand },
            Dispatch::Gatt(event) => match self.on_gatt_event(peripheral, event) {
                Some(v) => v,
                None => return,
            },
        };
        self.emit(event);
    }

    fn on_discover(&self, id: PeripheralId, address: Address, address_type: AddressType,
        connectable: bool, advertisement: &AdvertisementData, rssi: i8)
    {
        let peripheral = {
            let mut db = self.0.peripherals.lock();
            match db.get(&id) {
                Some(p) => p.clone(),
                None => {
                    let p = Peripheral::new(Arc::downgrade(&self.0), address, address_type);
                    db.insert(p.clone());
                    p
                }
            }
        };
        peripheral.on_discover(address_type, connectable, advertisement, rssi);

        let report = {
            let mut scan = self.0.scan.lock();
            scan.discovered.insert(id) || scan.allow_duplicates
        };
        if report {
            let advertisement_data = peripheral.advertisement();
            self.emit(CentralEvent::PeripheralDiscovered {
                peripheral,
                advertisement_data,
                rssi,
            });
        }
    }

    fn on_passkey_requested(&self, peripheral: Peripheral) {
        self.emit(CentralEvent::PasskeyRequested { peripheral: peripheral.clone() });
        let callback = match &self.0.config.passkey {
            Some(v) => v.clone(),
            None => return,
        };
        match callback(&peripheral) {
            Some(passkey) => if let Err(e) = self.provide_passkey(peripheral.id(), passkey) {
                self.warn(format!("passkey for {} rejected: {}", peripheral.id(), e));
            }
            None => debug!("no passkey for {} yet", peripheral.id()),
        }
    }

    /// Loads the attributes known from previous discoveries into a new ATT session.
    fn seed_gatt(&self, peripheral: &Peripheral) {
        let table = peripheral.attribute_table();
        if table.is_empty() {
            return;
        }
        let id = peripheral.id();
        let r = self.with_bindings(|b| {
            let services: Vec<_> = table.iter().map(|(s, _)| *s).collect();
            b.add_services(id, &services)?;
            for (s, characteristics) in &table {
                let infos: Vec<_> = characteristics.iter().map(|(c, _)| *c).collect();
                b.add_characteristics(id, s.uuid, &infos)?;
                for (c, descriptors) in characteristics {
                    b.add_descriptors(id, s.uuid, c.uuid, descriptors)?;
                }
            }
            Ok(())
        });
        if let Err(e) = r {
            warn!("can't load known attributes of {}: {}", id, e);
        }
    }

    fn on_gatt_event(&self, peripheral: Peripheral, event: GattEvent) -> Option<CentralEvent> {
        Some(match event {
            GattEvent::Mtu(mtu) => {
                peripheral.set_mtu(mtu);
                CentralEvent::MtuChanged { peripheral, mtu }
            }
            GattEvent::ServicesDiscovered(result) => {
                let services = result.map(|v| peripheral.merge_services(&v));
                CentralEvent::ServicesDiscovered { peripheral, services }
            }
            GattEvent::IncludedServicesDiscovered { service, result } => {
                let service = self.find_service(&peripheral, service)?;
                if let Ok(uuids) = &result {
                    service.set_included_service_uuids(uuids);
                }
                CentralEvent::IncludedServicesDiscovered {
                    peripheral,
                    service,
                    included_service_uuids: result,
                }
            }
            GattEvent::CharacteristicsDiscovered { service, result } => {
                let service = self.find_service(&peripheral, service)?;
                let characteristics = result.map(|v| service.merge_characteristics(&v));
                CentralEvent::CharacteristicsDiscovered { peripheral, service, characteristics }
            }
            GattEvent::DescriptorsDiscovered { service, characteristic, result } => {
                let characteristic = self.find_characteristic(&peripheral, service, characteristic)?;
                let descriptors = result.map(|v| characteristic.merge_descriptors(&v));
                CentralEvent::DescriptorsDiscovered { peripheral, characteristic, descriptors }
            }
            GattEvent::Read { service, characteristic, result, is_notification } => {
                let characteristic = self.find_characteristic(&peripheral, service, characteristic)?;
                CentralEvent::CharacteristicValue {
                    peripheral,
                    characteristic,
                    value: result,
                    is_notification,
                }
            }
            GattEvent::Write { service, characteristic, result } => {
                let characteristic = self.find_characteristic(&peripheral, service, characteristic)?;
                CentralEvent::WriteCharacteristicResult { peripheral, characteristic, result }
            }
            GattEvent::Broadcast { service, characteristic, result } => {
                let characteristic = self.find_characteristic(&peripheral, service, characteristic)?;
                CentralEvent::BroadcastChanged { peripheral, characteristic, result }
            }
            GattEvent::Notify { service, characteristic, result } => {
                let characteristic = self.find_characteristic(&peripheral, service, characteristic)?;
                CentralEvent::SubscriptionChanged { peripheral, characteristic, result }
            }
            GattEvent::ValueRead { service, characteristic, descriptor, result } => {
                let descriptor = self.find_descriptor(&peripheral, service, characteristic,
                    descriptor)?;
                CentralEvent::DescriptorValue { peripheral, descriptor, value: result }
            }
            GattEvent::ValueWrite { service, characteristic, descriptor, result } => {
                let descriptor = self.find_descriptor(&peripheral, service, characteristic,
                    descriptor)?;
                CentralEvent::WriteDescriptorResult { peripheral, descriptor, result }
            }
            GattEvent::HandleRead { handle, result } =>
                CentralEvent::HandleValue { peripheral, handle, value: result },
            GattEvent::HandleWrite { handle, result } =>
                CentralEvent::WriteHandleResult { peripheral, handle, result },
            GattEvent::HandleNotify { handle, data } =>
                CentralEvent::HandleNotification { peripheral, handle, value: data },
        })
    }

    fn find_service(&self, peripheral: &Peripheral, uuid: Uuid) -> Option<Service> {
        let r = peripheral.service(uuid);
        if r.is_none() {
            self.warn(format!("unknown service {} of {}", uuid, peripheral.id()));
        }
        r
    }

    fn find_characteristic(&self, peripheral: &Peripheral, service: Uuid, uuid: Uuid)
        -> Option<Characteristic>
    {
        let r = self.find_service(peripheral, service)?.characteristic(uuid);
        if r.is_none() {
            self.warn(format!("unknown characteristic {} of service {} of {}",
                uuid, service, peripheral.id()));
        }
        r
    }

    fn find_descriptor(&self, peripheral: &Peripheral, service: Uuid, characteristic: Uuid,
        uuid: Uuid) -> Option<Descriptor>
    {
        let r = self.find_characteristic(peripheral, service, characteristic)?.descriptor(uuid);
        if r.is_none() {
            self.warn(format!("unknown descriptor {} of characteristic {} of {}",
                uuid, characteristic, peripheral.id()));
        }
        r
    }
}

impl fmt::Debug for Central {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Central")
            .field("state", &self.state())
            .finish()
    }
}

/// Per-peripheral part of a bindings event.
#[derive(Debug)]
enum Dispatch {
    Connect(Option<Error>),
    Disconnect(Option<u8>),
    Rssi(i8),
    Encrypt(bool),
    EncryptFail,
    PasskeyRequested,
    Ltk([u8; 16]),
    MasterIdent([u8; 2], [u8; 8]),
    Gatt(GattEvent),
}

#[cfg(test)]
mod test {
    use hex_literal::hex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::hci::{ATT_CID, SMP_CID};
    use crate::hci::mock::*;

    const A: &str = "c0:ff:ee:00:00:01";

    fn central() -> (Central, Subscription<CentralEvent>, MockTransport) {
        init_logger();
        let t = MockTransport::new();
        let (c, events) = CentralBuilder::new()
            .force_allow_duplicates(false)
            .build(t.clone());
        (c, events, t)
    }

    fn powered_on() -> (Central, Subscription<CentralEvent>, MockTransport) {
        let (c, mut events, t) = central();
        c.handle_event(HciEvent::StateChange(AdapterState::PoweredOn));
        drain(&mut events);
        t.take();
        (c, events, t)
    }

    fn drain(events: &mut Subscription<CentralEvent>) -> Vec<CentralEvent> {
        let mut r = Vec::new();
        while let Some(e) = events.try_recv() {
            r.push(e);
        }
        r
    }

    fn report(address: &str, eir: &[u8]) -> HciEvent {
        HciEvent::LeAdvertisingReport {
            status: 0,
            kind: 0,
            address: address.parse().unwrap(),
            address_type: AddressType::Random,
            eir: eir.to_vec(),
            rssi: -60,
        }
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

    fn att(c: &Central, data: &[u8]) {
        c.handle_event(HciEvent::AclDataPkt { handle: 0x40, cid: ATT_CID, data: data.to_vec() });
    }

    async fn connect(c: &Central, address: &str) -> Peripheral {
        let p = c.add_peripheral(address.parse().unwrap(), AddressType::Random);
        let task = tokio::spawn(p.connect());
        tokio::task::yield_now().await;
        c.handle_event(conn_complete(0, 0x40, address));
        task.await.unwrap().unwrap();
        att(c, &hex!("03 b900"));
        p
    }

    #[test]
    fn scanning_requires_power() {
        let (c, _events, t) = central();
        assert_eq!(c.start_scanning(&ScanOptions::default()).unwrap_err().kind(),
            ErrorKind::PoweredOff);
        assert!(t.take().is_empty());
    }

    #[test]
    fn discovery_reports_once_per_scan() {
        let (c, mut events, _t) = powered_on();
        c.start_scanning(&ScanOptions::default()).unwrap();
        c.handle_event(report(A, &hex!("05 09 61626364")));
        c.handle_event(report(A, &hex!("02 0a f4")));

        let discovered: Vec<_> = drain(&mut events).into_iter()
            .filter_map(|e| match e {
                CentralEvent::PeripheralDiscovered { advertisement_data, .. } => Some(advertisement_data),
                _ => None,
            })
            .collect();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].local_name(), Some("abcd"));

        let p = c.peripheral(&A.parse().unwrap()).unwrap();
        assert_eq!(p.name().as_deref(), Some("abcd"));
        assert_eq!(p.advertisement().tx_power_level(), Some(-12));
        assert_eq!(p.rssi(), -60);
        assert_eq!(c.peripherals(), vec![p]);

        c.start_scanning(&ScanOptions::default().allow_duplicates(true)).unwrap();
        c.handle_event(report(A, &[]));
        c.handle_event(report(A, &[]));
        let n = drain(&mut events).iter()
            .filter(|e| matches!(e, CentralEvent::PeripheralDiscovered { .. }))
            .count();
        assert_eq!(n, 2);
    }

    #[test]
    fn scan_filter_uses_service_data() {
        let (c, mut events, _t) = powered_on();
        c.start_scanning(&ScanOptions::default().services(&[Uuid::from_u16(0x180f)])).unwrap();
        c.handle_event(report("c0:ff:ee:00:00:02", &hex!("03 03 0d18")));
        c.handle_event(report(A, &hex!("04 16 0f18 64")));
        let found: Vec<_> = drain(&mut events).into_iter()
            .filter_map(|e| match e {
                CentralEvent::PeripheralDiscovered { peripheral, .. } => Some(peripheral),
                _ => None,
            })
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), &A.parse::<PeripheralId>().unwrap());
    }

    #[test]
    fn lookup_errors_send_nothing() {
        let (c, _events, t) = powered_on();
        let id: PeripheralId = A.parse().unwrap();
        let s = Uuid::from_u16(0x180f);
        let ch = Uuid::from_u16(0x2a19);
        assert_eq!(c.connect(&id).unwrap_err().kind(), ErrorKind::UnknownPeripheral);
        assert_eq!(c.read(&id, s, ch).unwrap_err().kind(), ErrorKind::UnknownPeripheral);
        assert_eq!(c.write(&id, s, ch, &[1], false).unwrap_err().kind(),
            ErrorKind::UnknownPeripheral);

        c.add_peripheral(A.parse().unwrap(), AddressType::Random);
        assert_eq!(c.read(&id, s, ch).unwrap_err().kind(), ErrorKind::NotConnected);
        assert!(t.take().is_empty());
    }

    #[tokio::test]
    async fn connect_discover_read() {
        let (c, mut events, t) = powered_on();
        let p = connect(&c, A).await;
        assert!(p.is_connected());
        assert_eq!(p.mtu(), Some(185));
        assert_eq!(c.connect(p.id()).unwrap_err().kind(), ErrorKind::AlreadyConnected);
        t.take();

        let task = tokio::spawn(p.discover_all_services_and_characteristics());
        tokio::task::yield_now().await;
        assert_eq!(t.acl_writes(ATT_CID), vec![hex!("10 0100 ffff 0028").to_vec()]);
        att(&c, &hex!("11 06 0100 ffff 0f18"));
        tokio::task::yield_now().await;
        att(&c, &hex!("09 07 0200 12 0300 192a"));
        att(&c, &hex!("01 08 0300 0a"));
        let (services, characteristics) = task.await.unwrap().unwrap();
        assert_eq!(services, p.services().unwrap());
        assert_eq!(characteristics.len(), 1);
        let battery = characteristics[0].clone();
        assert_eq!(battery.value_handle(), 3);
        assert!(battery.properties().is_notify());

        t.take();
        let task = tokio::spawn(battery.read());
        tokio::task::yield_now().await;
        assert_eq!(t.acl_writes(ATT_CID), vec![hex!("0a 0300").to_vec()]);
        att(&c, &hex!("0b 64"));
        assert_eq!(task.await.unwrap().unwrap(), vec![0x64]);

        let seen = drain(&mut events);
        assert!(seen.iter().any(|e| matches!(e,
            CentralEvent::CharacteristicValue { value: Ok(v), is_notification: false, .. } if v == &[0x64])));
    }

    #[tokio::test]
    async fn missing_requested_service_fails_discovery() {
        let (c, _events, t) = powered_on();
        let p = connect(&c, A).await;
        t.take();

        let task = tokio::spawn(p.discover_some_services_and_characteristics(
            &[Uuid::from_u16(0x180f), Uuid::from_u16(0x180a)], &[]));
        tokio::task::yield_now().await;
        att(&c, &hex!("11 06 0100 ffff 0f18"));
        assert_eq!(task.await.unwrap().unwrap_err().kind(), ErrorKind::UnknownService);
        assert_eq!(p.services().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_connect_joins_pending_attempt() {
        let (c, _events, t) = powered_on();
        let p = c.add_peripheral(A.parse().unwrap(), AddressType::Random);
        c.connect(p.id()).unwrap();
        assert_eq!(c.connect(p.id()).unwrap_err().kind(), ErrorKind::AlreadyConnecting);
        let creates = t.take().into_iter()
            .filter(|c| matches!(c, Call::CreateLeConn { .. }))
            .count();
        assert_eq!(creates, 1);

        let task = tokio::spawn(p.connect());
        tokio::task::yield_now().await;
        assert!(t.take().is_empty());
        c.handle_event(conn_complete(0, 0x40, A));
        task.await.unwrap().unwrap();
        assert!(p.is_connected());
    }

    #[tokio::test]
    async fn disconnect_fails_requests_in_flight() {
        let (c, _events, _t) = powered_on();
        let p = connect(&c, A).await;

        let task = tokio::spawn(p.discover_services(&[]));
        tokio::task::yield_now().await;
        c.handle_event(HciEvent::DisconnComplete { handle: 0x40, reason: 0x13 });
        assert_eq!(task.await.unwrap().unwrap_err().kind(), ErrorKind::NotConnected);
        assert_eq!(p.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let (c, _events, _t) = powered_on();
        let p = c.add_peripheral(A.parse().unwrap(), AddressType::Random);
        let task = tokio::spawn(p.connect());
        tokio::task::yield_now().await;
        assert_eq!(p.connection_state(), ConnectionState::Connecting);
        c.handle_event(conn_complete(0x3e, 0, A));
        assert_eq!(task.await.unwrap().unwrap_err().kind(), ErrorKind::Hci(0x3e));
        assert_eq!(p.connection_state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn cancelled_connect_cancels_attempt() {
        let (c, _events, t) = powered_on();
        let p = c.add_peripheral(A.parse().unwrap(), AddressType::Random);
        let request = p.connect();
        let canceller = request.canceller();
        let task = tokio::spawn(request);
        tokio::task::yield_now().await;
        t.take();

        canceller.cancel();
        assert_eq!(task.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(t.take(), vec![Call::CancelConnect]);
        assert_eq!(p.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn restored_attributes_work_without_discovery() {
        let (c, _events, _t) = powered_on();
        let p = connect(&c, A).await;
        let task = tokio::spawn(p.discover_services(&[]));
        tokio::task::yield_now().await;
        att(&c, &hex!("11 06 0100 ffff 0f18"));
        task.await.unwrap().unwrap();
        let service = p.service(Uuid::from_u16(0x180f)).unwrap();
        let task = tokio::spawn(service.discover_characteristics(&[]));
        tokio::task::yield_now().await;
        att(&c, &hex!("09 07 0200 02 0300 192a"));
        att(&c, &hex!("01 08 0300 0a"));
        task.await.unwrap().unwrap();
        let dump = p.dump();

        let (c, _events, t2) = powered_on();
        let p = c.restore(&dump);
        assert_eq!(p.dump(), dump);
        connect(&c, A).await;
        t2.take();

        let battery = p.service(Uuid::from_u16(0x180f)).unwrap()
            .characteristic(Uuid::from_u16(0x2a19)).unwrap();
        c.read(p.id(), Uuid::from_u16(0x180f), battery.uuid()).unwrap();
        assert_eq!(t2.acl_writes(ATT_CID), vec![hex!("0a 0300").to_vec()]);
    }

    #[test]
    fn restore_merges_into_known_peripheral() {
        let (c, _events, _t) = powered_on();
        let known = c.add_peripheral(A.parse().unwrap(), AddressType::Random);

        let other = Peripheral::from_dump(&known.dump());
        other.merge_services(&[crate::hci::gatt::ServiceInfo {
            uuid: Uuid::from_u16(0x180f),
            start_handle: 1,
            end_handle: 4,
        }]);
        let restored = c.restore(&other.dump());
        assert_eq!(restored, known);
        assert_eq!(known.services().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn passkey_callback_answers_pairing() {
        init_logger();
        let t = MockTransport::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (c, mut events) = {
            let calls = calls.clone();
            CentralBuilder::new()
                .force_allow_duplicates(false)
                .passkey(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Some(123456)
                })
                .build(t.clone())
        };
        let p = connect(&c, A).await;
        c.encrypt(p.id()).unwrap();
        t.take();

        // Pairing response selecting passkey entry: peer displays, we type.
        c.handle_event(HciEvent::AclDataPkt {
            handle: 0x40,
            cid: SMP_CID,
            data: hex!("02 00 00 05 10 00 01").to_vec(),
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(drain(&mut events).iter()
            .any(|e| matches!(e, CentralEvent::PasskeyRequested { .. })));
        assert_eq!(t.acl_writes(SMP_CID).len(), 1);
    }

    #[test]
    fn event_capacity_bounds_backlog() {
        init_logger();
        let (c, mut events) = CentralBuilder::new()
            .force_allow_duplicates(false)
            .event_capacity(1)
            .build(MockTransport::new());
        c.handle_event(HciEvent::StateChange(AdapterState::PoweredOn));
        c.handle_event(HciEvent::StateChange(AdapterState::PoweredOff));
        let seen = drain(&mut events);
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0],
            CentralEvent::StateChanged { new_state: AdapterState::PoweredOff }));
    }

    #[test]
    fn advertisement_merge() -> anyhow::Result<()> {
        let mut a = AdvertisementData::default();
        a.local_name = Some("first".into());
        a.manufacturer_data = Some(hex::decode("4c000215")?);
        a.service_uuids = vec![Uuid::from_u16(0x180f)];

        let mut b = AdvertisementData::default();
        b.tx_power_level = Some(4);
        b.service_data.push(Uuid::from_u16(0x180f), vec![1]);
        a.merge(&b);

        assert_eq!(a.local_name(), Some("first"));
        assert_eq!(a.tx_power_level(), Some(4));
        assert_eq!(a.service_uuids(), &[Uuid::from_u16(0x180f)]);
        assert_eq!(a.service_data().get(Uuid::from_u16(0x180f)), Some(&[1][..]));

        assert_eq!(a.manufacturer_data().map(hex::encode).as_deref(), Some("4c000215"));

        let json = serde_json::to_value(&a)?;
        assert_eq!(json["localName"], "first");
        assert!(json.get("solicitedServiceUuids").is_some());
        let back: AdvertisementData = serde_json::from_value(json)?;
        assert_eq!(back, a);
        Ok(())
    }
}
