use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::time::Instant;

use crate::central::{AdvertisementData, Central, CentralEvent, Inner, reject_on_disconnect};
use crate::central::characteristic::Characteristic;
use crate::central::service::{Service, ServiceDump};
use crate::error::*;
use crate::hci::{Address, AddressType, PeripheralId};
use crate::hci::gatt::{CharacteristicInfo, DescriptorInfo, ServiceInfo};
use crate::request::{cancelify, Projection, Request, RequestOptions};
use crate::uuid::Uuid;

/// Connection state of a peripheral as seen by the central.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// The last connection attempt failed.
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Serializable snapshot of a peripheral and everything discovered on it.
///
/// Connection state is not part of the dump, a restored peripheral is always disconnected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralDump {
    pub id: PeripheralId,
    pub address: Address,
    pub address_type: AddressType,
    pub connectable: bool,
    #[serde(default)]
    pub advertisement: AdvertisementData,
    pub rssi: i8,
    #[serde(default)]
    pub mtu: Option<u16>,
    #[serde(default)]
    pub services: Option<Vec<ServiceDump>>,
}

struct State {
    address: Address,
    address_type: AddressType,
    connectable: bool,
    advertisement: AdvertisementData,
    rssi: i8,
    mtu: Option<u16>,
    connection: ConnectionState,
    last_seen: Instant,
    services: Option<Vec<Service>>,
}

pub(in crate) struct PeripheralInner {
    id: PeripheralId,
    central: Weak<Inner>,
    state: Mutex<State>,
}

/// A remote peripheral device.
///
/// Peripherals are identified by their address. Objects handed out by a [`Central`] for the same
/// address are the same object until the peripheral is expired from the registry.
#[derive(Clone)]
pub struct Peripheral(Arc<PeripheralInner>);

assert_impl_all!(Peripheral: Send, Sync);

impl Peripheral {
    pub(in crate) fn new(central: Weak<Inner>, address: Address, address_type: AddressType)
        -> Self
    {
        Self(Arc::new(PeripheralInner {
            id: address.into(),
            central,
            state: Mutex::new(State {
                address,
                address_type,
                connectable: false,
                advertisement: AdvertisementData::default(),
                rssi: 0,
                mtu: None,
                connection: ConnectionState::Disconnected,
                last_seen: Instant::now(),
                services: None,
            }),
        }))
    }

    pub(in crate) fn from_inner(inner: Arc<PeripheralInner>) -> Self {
        Self(inner)
    }

    /// Recreates a detached peripheral from a dump. Operations on it fail with
    /// [`ErrorKind::Detached`] until it's [restored](crate::central::Central::restore) into a
    /// central.
    pub fn from_dump(dump: &PeripheralDump) -> Self {
        Self::from_dump_in(Weak::new(), dump)
    }

    pub(in crate) fn from_dump_in(central: Weak<Inner>, dump: &PeripheralDump) -> Self {
        let r = Self(Arc::new(PeripheralInner {
            id: dump.id.clone(),
            central,
            state: Mutex::new(State {
                address: dump.address,
                address_type: dump.address_type,
                connectable: dump.connectable,
                advertisement: dump.advertisement.clone(),
                rssi: dump.rssi,
                mtu: dump.mtu,
                connection: ConnectionState::Disconnected,
                last_seen: Instant::now(),
                services: None,
            }),
        }));
        let services = dump.services.as_ref().map(|v| v.iter()
            .map(|s| Service::from_dump(Arc::downgrade(&r.0), s))
            .collect());
        r.0.state.lock().services = services;
        r
    }

    pub fn id(&self) -> &PeripheralId {
        &self.0.id
    }

    pub fn address(&self) -> Address {
        self.0.state.lock().address
    }

    pub fn address_type(&self) -> AddressType {
        self.0.state.lock().address_type
    }

    pub fn is_connectable(&self) -> bool {
        self.0.state.lock().connectable
    }

    /// Advertisement data merged from all advertising reports seen so far.
    pub fn advertisement(&self) -> AdvertisementData {
        self.0.state.lock().advertisement.clone()
    }

    /// Local name from the advertisement data.
    pub fn name(&self) -> Option<String> {
        self.0.state.lock().advertisement.local_name().map(|v| v.to_owned())
    }

    pub fn rssi(&self) -> i8 {
        self.0.state.lock().rssi
    }

    /// ATT MTU of the current or last connection.
    pub fn mtu(&self) -> Option<u16> {
        self.0.state.lock().mtu
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.0.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// When an advertising report from this peripheral was last seen.
    pub fn last_seen(&self) -> Instant {
        self.0.state.lock().last_seen
    }

    /// Discovered services or `None` if services were never discovered.
    pub fn services(&self) -> Option<Vec<Service>> {
        self.0.state.lock().services.clone()
    }

    pub fn service(&self, uuid: Uuid) -> Option<Service> {
        self.0.state.lock().services.as_ref()?
            .iter()
            .find(|s| s.uuid() == uuid)
            .cloned()
    }

    pub(in crate) fn central(&self) -> Result<Central> {
        self.0.central.upgrade()
            .map(Central::from_inner)
            .ok_or_else(Error::detached)
    }

    pub(in crate) fn on_discover(&self, address_type: AddressType, connectable: bool,
        advertisement: &AdvertisementData, rssi: i8)
    {
        let mut state = self.0.state.lock();
        state.address_type = address_type;
        state.connectable = connectable;
        state.advertisement.merge(advertisement);
        state.rssi = rssi;
        state.last_seen = Instant::now();
    }

    pub(in crate) fn set_connection_state(&self, v: ConnectionState) {
        self.0.state.lock().connection = v;
    }

    pub(in crate) fn set_rssi(&self, v: i8) {
        self.0.state.lock().rssi = v;
    }

    pub(in crate) fn set_mtu(&self, v: u16) {
        self.0.state.lock().mtu = Some(v);
    }

    /// Merges discovery results into the service list and returns the objects matching `infos`,
    /// in the same order.
    pub(in crate) fn merge_services(&self, infos: &[ServiceInfo]) -> Vec<Service> {
        let mut state = self.0.state.lock();
        let list = state.services.get_or_insert_with(Vec::new);
        infos.iter()
            .map(|info| match list.iter().find(|s| s.uuid() == info.uuid) {
                Some(s) => {
                    s.update(info);
                    s.clone()
                }
                None => {
                    let s = Service::new(Arc::downgrade(&self.0), info);
                    list.push(s.clone());
                    s
                }
            })
            .collect()
    }

    /// Everything known about the attribute table, used to seed a new ATT session so that
    /// operations on previously discovered attributes work without rediscovery.
    pub(in crate) fn attribute_table(&self)
        -> Vec<(ServiceInfo, Vec<(CharacteristicInfo, Vec<DescriptorInfo>)>)>
    {
        self.services().unwrap_or_default().iter()
            .map(|s| {
                let characteristics = s.characteristics().unwrap_or_default().iter()
                    .map(|c| (c.info(), c.descriptor_infos().unwrap_or_default()))
                    .collect();
                (s.info(), characteristics)
            })
            .collect()
    }

    /// Copies what `target` lacks from this peripheral's discovered attributes: services it
    /// doesn't have and, per service, handles and characteristics.
    pub fn merge_services_to(&self, target: &Peripheral) {
        if Arc::ptr_eq(&self.0, &target.0) {
            return;
        }
        let services = match self.services() {
            Some(v) => v,
            None => return,
        };
        for service in &services {
            match target.service(service.uuid()) {
                Some(existing) => existing.merge_from(service),
                None => {
                    let s = Service::from_dump(Arc::downgrade(&target.0), &service.dump());
                    target.0.state.lock().services.get_or_insert_with(Vec::new).push(s);
                }
            }
        }
        let mut state = target.0.state.lock();
        if state.mtu.is_none() {
            state.mtu = self.mtu();
        }
    }

    pub fn dump(&self) -> PeripheralDump {
        let services = self.services();
        let state = self.0.state.lock();
        PeripheralDump {
            id: self.0.id.clone(),
            address: state.address,
            address_type: state.address_type,
            connectable: state.connectable,
            advertisement: state.advertisement.clone(),
            rssi: state.rssi,
            mtu: state.mtu,
            services: services.map(|v| v.iter().map(|s| s.dump()).collect()),
        }
    }

    /// Connects with the default connection parameters. Joins the attempt already in flight,
    /// if any.
    ///
    /// Cancelling the request cancels the pending connection attempt.
    pub fn connect(&self) -> Request<()> {
        let central = try_request!(self.central());
        let id = self.id().clone();
        let this = self.clone();
        let cancel = {
            let central = central.clone();
            let id = id.clone();
            move || {
                if let Err(e) = central.cancel_connect(&id) {
                    debug!("can't cancel connection to {}: {}", id, e);
                }
            }
        };
        central.request(central.connect_options(),
            move |central| match central.connect(&id) {
                Err(e) if e.kind() == ErrorKind::AlreadyConnecting => Ok(()),
                r => r,
            },
            move |event| match event {
                CentralEvent::PeripheralConnected { peripheral } if peripheral == &this =>
                    Projection::Resolve(()),
                CentralEvent::PeripheralConnectFailed { peripheral, error } if peripheral == &this =>
                    Projection::Reject(error.clone()),
                _ => Projection::Ignore,
            })
            .on_cancel(cancel)
    }

    /// Cancels a pending connection attempt to this peripheral.
    pub fn cancel_connect(&self) -> Request<()> {
        let central = try_request!(self.central());
        Request::ready(central.cancel_connect(self.id()))
    }

    /// Disconnects and resolves with the disconnect reason.
    pub fn disconnect(&self) -> Request<Option<u8>> {
        let central = try_request!(self.central());
        let id = self.id().clone();
        let this = self.clone();
        central.request(RequestOptions::once(central.connect_options().timeout),
            move |central| central.disconnect(&id),
            move |event| match event {
                CentralEvent::PeripheralDisconnected { peripheral, reason } if peripheral == &this =>
                    Projection::Resolve(*reason),
                _ => Projection::Ignore,
            })
    }

    pub fn update_rssi(&self) -> Request<i8> {
        let central = try_request!(self.central());
        let id = self.id().clone();
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.update_rssi(&id),
            move |event| match event {
                CentralEvent::RssiUpdated { peripheral, rssi } if peripheral == &this =>
                    Projection::Resolve(*rssi),
                event => reject_on_disconnect(event, &this),
            })
    }

    /// Starts link encryption, pairing first if there's no key for the peripheral. Resolves with
    /// the resulting encryption state.
    pub fn encrypt(&self) -> Request<bool> {
        let central = try_request!(self.central());
        let id = self.id().clone();
        let this = self.clone();
        central.request(central.connect_options(),
            move |central| central.encrypt(&id),
            move |event| match event {
                CentralEvent::EncryptionChanged { peripheral, encrypted } if peripheral == &this =>
                    Projection::Resolve(*encrypted),
                CentralEvent::EncryptionFailed { peripheral } if peripheral == &this =>
                    Projection::Reject(Error::new(ErrorKind::Protocol,
                        format!("pairing with {} failed", this.id()))),
                event => reject_on_disconnect(event, &this),
            })
    }

    /// Answers a pending passkey entry request.
    pub fn provide_passkey(&self, passkey: u32) -> Result<()> {
        self.central()?.provide_passkey(self.id(), passkey)
    }

    /// Discovers primary services. An empty `uuids` means all of them.
    pub fn discover_services(&self, uuids: &[Uuid]) -> Request<Vec<Service>> {
        let central = try_request!(self.central());
        let id = self.id().clone();
        let uuids = uuids.to_vec();
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.discover_services(&id, &uuids),
            move |event| match event {
                CentralEvent::ServicesDiscovered { peripheral, services } if peripheral == &this =>
                    services.clone().into(),
                event => reject_on_disconnect(event, &this),
            })
    }

    /// Discovers the services with `service_uuids` and then characteristics with
    /// `characteristic_uuids` in each of them. Empty lists mean all. Fails with
    /// [`ErrorKind::UnknownService`] if any of the requested services is absent.
    pub fn discover_some_services_and_characteristics(&self, service_uuids: &[Uuid],
        characteristic_uuids: &[Uuid]) -> Request<(Vec<Service>, Vec<Characteristic>)>
    {
        let this = self.clone();
        let service_uuids = service_uuids.to_vec();
        let characteristic_uuids = characteristic_uuids.to_vec();
        cancelify(move |slot| async move {
            let step = this.discover_services(&service_uuids);
            let canceller = step.canceller();
            slot.set(move || canceller.cancel());
            let services = step.await?;
            if let Some(missing) = service_uuids.iter()
                .find(|&&u| !services.iter().any(|s| s.uuid() == u))
            {
                return Err(Error::new(ErrorKind::UnknownService,
                    format!("service {} not found on {}", missing, this.id())));
            }

            let mut characteristics = Vec::new();
            for service in &services {
                let step = service.discover_characteristics(&characteristic_uuids);
                let canceller = step.canceller();
                slot.set(move || canceller.cancel());
                characteristics.extend(step.await?);
            }
            Ok((services, characteristics))
        })
    }

    pub fn discover_all_services_and_characteristics(&self)
        -> Request<(Vec<Service>, Vec<Characteristic>)>
    {
        self.discover_some_services_and_characteristics(&[], &[])
    }

    /// Reads an attribute by raw handle.
    pub fn read_handle(&self, handle: u16) -> Request<Vec<u8>> {
        let central = try_request!(self.central());
        let id = self.id().clone();
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.read_handle(&id, handle),
            move |event| match event {
                CentralEvent::HandleValue { peripheral, handle: h, value }
                    if peripheral == &this && *h == handle => value.clone().into(),
                event => reject_on_disconnect(event, &this),
            })
    }

    /// Writes an attribute by raw handle.
    pub fn write_handle(&self, handle: u16, data: &[u8], without_response: bool) -> Request<()> {
        let central = try_request!(self.central());
        let id = self.id().clone();
        let data = data.to_vec();
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.write_handle(&id, handle, &data, without_response),
            move |event| match event {
                CentralEvent::WriteHandleResult { peripheral, handle: h, result }
                    if peripheral == &this && *h == handle => result.clone().into(),
                event => reject_on_disconnect(event, &this),
            })
    }
}

impl PartialEq for Peripheral {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Peripheral {}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.0.id)
            .field("connection", &self.connection_state())
            .finish()
    }
}

impl fmt::Display for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = serde_json::to_string(&self.dump()).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use super::*;
    use crate::central::characteristic::Properties;

    fn peripheral() -> Peripheral {
        Peripheral::new(Weak::new(), Address::new(hex!("c0ffeec0ffee")), AddressType::Random)
    }

    fn service(uuid: u16, start: u16, end: u16) -> ServiceInfo {
        ServiceInfo {
            uuid: Uuid::from_u16(uuid),
            start_handle: start,
            end_handle: end,
        }
    }

    #[test]
    fn identity_from_address() {
        let p = peripheral();
        assert_eq!(p.id().as_str(), "c0ffeec0ffee");
        assert_eq!(p.connection_state(), ConnectionState::Disconnected);
        assert!(p.services().is_none());
    }

    #[test]
    fn merge_services_is_stable() {
        let p = peripheral();
        let first = p.merge_services(&[service(0x1800, 1, 5)]);
        let second = p.merge_services(&[service(0x1800, 1, 7), service(0x180f, 8, 10)]);
        assert_eq!(first[0], second[0]);
        assert_eq!(second[0].end_handle(), 7);
        assert_eq!(p.services().unwrap().len(), 2);
        assert_eq!(second[1].peripheral(), Some(p.clone()));
    }

    #[test]
    fn dump_excludes_connection_state() {
        let p = peripheral();
        p.set_connection_state(ConnectionState::Connected);
        p.set_mtu(185);
        let s = p.merge_services(&[service(0x180f, 8, 10)]);
        s[0].merge_characteristics(&[CharacteristicInfo {
            uuid: Uuid::from_u16(0x2a19),
            properties: Properties::from_bits_truncate(0x12),
            start_handle: 9,
            value_handle: 10,
            end_handle: 10,
        }]);

        let json = serde_json::to_value(p.dump()).unwrap();
        assert_eq!(json["id"], "c0ffeec0ffee");
        assert_eq!(json["address"], "c0:ff:ee:c0:ff:ee");
        assert_eq!(json["addressType"], "random");
        assert_eq!(json["mtu"], 185);
        assert!(json.get("connection").is_none());

        let restored = Peripheral::from_dump(&serde_json::from_value(json).unwrap());
        assert_eq!(restored.connection_state(), ConnectionState::Disconnected);
        assert_eq!(restored.dump(), p.dump());
        let c = restored.service(Uuid::from_u16(0x180f)).unwrap()
            .characteristic(Uuid::from_u16(0x2a19)).unwrap();
        assert_eq!(c.value_handle(), 10);
        assert!(c.properties().is_notify());
    }

    #[test]
    fn merge_services_to_adds_missing() {
        let source = peripheral();
        source.set_mtu(100);
        source.merge_services(&[service(0x1800, 1, 5), service(0x180f, 8, 10)]);

        let target = peripheral();
        let own = target.merge_services(&[service(0x1800, 1, 5)]);

        source.merge_services_to(&target);
        let services = target.services().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0], own[0]);
        assert_eq!(services[1].uuid(), Uuid::from_u16(0x180f));
        assert_eq!(services[1].peripheral(), Some(target.clone()));
        assert_eq!(target.mtu(), Some(100));
    }

    #[test]
    fn attribute_table_lists_known_handles() {
        let p = peripheral();
        let s = p.merge_services(&[service(0x180f, 8, 10)]);
        let c = s[0].merge_characteristics(&[CharacteristicInfo {
            uuid: Uuid::from_u16(0x2a19),
            properties: Properties::from_bits_truncate(0x12),
            start_handle: 9,
            value_handle: 10,
            end_handle: 11,
        }]);
        c[0].merge_descriptors(&[DescriptorInfo { uuid: Uuid::from_u16(0x2902), handle: 11 }]);

        let table = p.attribute_table();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].0, service(0x180f, 8, 10));
        assert_eq!(table[0].1[0].0.value_handle, 10);
        assert_eq!(table[0].1[0].1, vec![DescriptorInfo { uuid: Uuid::from_u16(0x2902), handle: 11 }]);
    }

    #[test]
    fn detached_requests_fail() {
        let p = peripheral();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        assert_eq!(rt.block_on(p.connect()).unwrap_err().kind(), ErrorKind::Detached);
        assert_eq!(rt.block_on(p.discover_services(&[])).unwrap_err().kind(), ErrorKind::Detached);
        assert_eq!(p.provide_passkey(123456).unwrap_err().kind(), ErrorKind::Detached);
    }
}
