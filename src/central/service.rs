use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::central::{CentralEvent, reject_on_disconnect};
use crate::central::attribute::Attribute;
use crate::central::characteristic::{Characteristic, CharacteristicDump};
use crate::central::peripheral::{Peripheral, PeripheralInner};
use crate::error::*;
use crate::hci::gatt::{CharacteristicInfo, ServiceInfo};
use crate::request::Request;
use crate::uuid::Uuid;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDump {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub start_handle: u16,
    pub end_handle: u16,
    #[serde(default)]
    pub included_service_uuids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub characteristics: Option<Vec<CharacteristicDump>>,
}

struct State {
    start_handle: u16,
    end_handle: u16,
    included_service_uuids: Option<Vec<Uuid>>,
    characteristics: Option<Vec<Characteristic>>,
}

pub(in crate) struct ServiceInner {
    uuid: Uuid,
    peripheral: Weak<PeripheralInner>,
    state: Mutex<State>,
}

/// A primary service of a remote peripheral.
///
/// A service groups characteristics that together implement one function of the device, e.g.
/// heart rate measurement or battery status. Handles compare equal when they refer to the same
/// discovered service.
#[derive(Clone)]
pub struct Service(Arc<ServiceInner>);

assert_impl_all!(Service: Send, Sync);

impl Service {
    pub(in crate) fn new(peripheral: Weak<PeripheralInner>, info: &ServiceInfo) -> Self {
        Self(Arc::new(ServiceInner {
            uuid: info.uuid,
            peripheral,
            state: Mutex::new(State {
                start_handle: info.start_handle,
                end_handle: info.end_handle,
                included_service_uuids: None,
                characteristics: None,
            }),
        }))
    }

    pub(in crate) fn from_inner(inner: Arc<ServiceInner>) -> Self {
        Self(inner)
    }

    pub(in crate) fn from_dump(peripheral: Weak<PeripheralInner>, dump: &ServiceDump) -> Self {
        let r = Self::new(peripheral, &ServiceInfo {
            uuid: dump.uuid,
            start_handle: dump.start_handle,
            end_handle: dump.end_handle,
        });
        {
            let mut state = r.0.state.lock();
            state.included_service_uuids = dump.included_service_uuids.clone();
            state.characteristics = dump.characteristics.as_ref().map(|v| v.iter()
                .map(|c| Characteristic::from_dump(Arc::downgrade(&r.0), c))
                .collect());
        }
        r
    }

    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    pub fn start_handle(&self) -> u16 {
        self.0.state.lock().start_handle
    }

    pub fn end_handle(&self) -> u16 {
        self.0.state.lock().end_handle
    }

    /// UUIDs of the included services or `None` if they were never discovered.
    pub fn included_service_uuids(&self) -> Option<Vec<Uuid>> {
        self.0.state.lock().included_service_uuids.clone()
    }

    /// Discovered characteristics or `None` if characteristics were never discovered.
    pub fn characteristics(&self) -> Option<Vec<Characteristic>> {
        self.0.state.lock().characteristics.clone()
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.0.state.lock().characteristics.as_ref()?
            .iter()
            .find(|c| c.uuid() == uuid)
            .cloned()
    }

    /// The owning peripheral or `None` if it's gone.
    pub fn peripheral(&self) -> Option<Peripheral> {
        self.0.peripheral.upgrade().map(Peripheral::from_inner)
    }

    pub(in crate) fn info(&self) -> ServiceInfo {
        let state = self.0.state.lock();
        ServiceInfo {
            uuid: self.0.uuid,
            start_handle: state.start_handle,
            end_handle: state.end_handle,
        }
    }

    pub(in crate) fn update(&self, info: &ServiceInfo) {
        let mut state = self.0.state.lock();
        state.start_handle = info.start_handle;
        state.end_handle = info.end_handle;
    }

    pub(in crate) fn set_included_service_uuids(&self, uuids: &[Uuid]) {
        let mut state = self.0.state.lock();
        let list = state.included_service_uuids.get_or_insert_with(Vec::new);
        for &uuid in uuids {
            if !list.contains(&uuid) {
                list.push(uuid);
            }
        }
    }

    /// Merges discovery results into the characteristic list and returns the objects matching
    /// `infos`, in the same order.
    pub(in crate) fn merge_characteristics(&self, infos: &[CharacteristicInfo])
        -> Vec<Characteristic>
    {
        let mut state = self.0.state.lock();
        let list = state.characteristics.get_or_insert_with(Vec::new);
        infos.iter()
            .map(|info| match list.iter().find(|c| c.uuid() == info.uuid) {
                Some(c) => {
                    c.update(info);
                    c.clone()
                }
                None => {
                    let c = Characteristic::new(Arc::downgrade(&self.0), info);
                    list.push(c.clone());
                    c
                }
            })
            .collect()
    }

    /// Fills what this service lacks from `other`: zero handles, never discovered included
    /// services and an empty characteristic list.
    pub(in crate) fn merge_from(&self, other: &Service) {
        let other = other.dump();
        let mut state = self.0.state.lock();
        if state.start_handle == 0 && state.end_handle == 0 {
            state.start_handle = other.start_handle;
            state.end_handle = other.end_handle;
        }
        if state.included_service_uuids.is_none() {
            state.included_service_uuids = other.included_service_uuids;
        }
        let has_characteristics = state.characteristics.as_ref()
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if !has_characteristics {
            if let Some(characteristics) = &other.characteristics {
                state.characteristics = Some(characteristics.iter()
                    .map(|c| Characteristic::from_dump(Arc::downgrade(&self.0), c))
                    .collect());
            }
        }
    }

    pub fn dump(&self) -> ServiceDump {
        let info = self.info();
        ServiceDump {
            uuid: info.uuid,
            name: self.name().map(|v| v.to_owned()),
            type_name: self.type_name().map(|v| v.to_owned()),
            start_handle: info.start_handle,
            end_handle: info.end_handle,
            included_service_uuids: self.included_service_uuids(),
            characteristics: self.characteristics()
                .map(|v| v.iter().map(|c| c.dump()).collect()),
        }
    }

    /// Discovers services included by this one. An empty `uuids` means all of them.
    pub fn discover_included_services(&self, uuids: &[Uuid]) -> Request<Vec<Uuid>> {
        let peripheral = try_request!(self.peripheral().ok_or_else(Error::detached));
        let central = try_request!(peripheral.central());
        let id = peripheral.id().clone();
        let s = self.uuid();
        let uuids = uuids.to_vec();
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.discover_included_services(&id, s, &uuids),
            move |event| match event {
                CentralEvent::IncludedServicesDiscovered { service, included_service_uuids, .. }
                    if service == &this => included_service_uuids.clone().into(),
                event => reject_on_disconnect(event, &peripheral),
            })
    }

    /// Discovers characteristics of this service. An empty `uuids` means all of them.
    pub fn discover_characteristics(&self, uuids: &[Uuid]) -> Request<Vec<Characteristic>> {
        let peripheral = try_request!(self.peripheral().ok_or_else(Error::detached));
        let central = try_request!(peripheral.central());
        let id = peripheral.id().clone();
        let s = self.uuid();
        let uuids = uuids.to_vec();
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.discover_characteristics(&id, s, &uuids),
            move |event| match event {
                CentralEvent::CharacteristicsDiscovered { service, characteristics, .. }
                    if service == &this => characteristics.clone().into(),
                event => reject_on_disconnect(event, &peripheral),
            })
    }
}

impl Attribute for Service {
    fn uuid(&self) -> Uuid {
        self.0.uuid
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Service {}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let info = self.info();
        f.debug_struct("Service")
            .field("uuid", &info.uuid)
            .field("start_handle", &info.start_handle)
            .field("end_handle", &info.end_handle)
            .finish()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = serde_json::to_string(&self.dump()).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::central::characteristic::Properties;

    fn service(uuid: u16, start: u16, end: u16) -> Service {
        Service::new(Weak::new(), &ServiceInfo {
            uuid: Uuid::from_u16(uuid),
            start_handle: start,
            end_handle: end,
        })
    }

    fn characteristic(uuid: u16, start: u16) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: Uuid::from_u16(uuid),
            properties: Properties::from_bits_truncate(0x02),
            start_handle: start,
            value_handle: start + 1,
            end_handle: start + 1,
        }
    }

    #[test]
    fn merge_characteristics_is_stable() {
        let s = service(0x180a, 1, 10);
        let first = s.merge_characteristics(&[characteristic(0x2a29, 2)]);
        let second = s.merge_characteristics(&[characteristic(0x2a29, 4), characteristic(0x2a24, 6)]);
        assert_eq!(first[0], second[0]);
        assert_eq!(second[0].value_handle(), 5);
        assert_eq!(s.characteristics().unwrap().len(), 2);
        assert_eq!(second[1].service(), Some(s.clone()));

        assert!(s.merge_characteristics(&[]).is_empty());
        assert_eq!(s.characteristics().unwrap().len(), 2);
    }

    #[test]
    fn characteristics_absent_until_discovered() {
        let s = service(0x180f, 1, 4);
        assert!(s.characteristics().is_none());
        assert!(s.characteristic(Uuid::from_u16(0x2a19)).is_none());
        s.merge_characteristics(&[]);
        assert_eq!(s.characteristics(), Some(vec![]));
    }

    #[test]
    fn merge_from_fills_gaps() {
        let target = service(0x180f, 0, 0);
        target.merge_characteristics(&[]);

        let source = service(0x180f, 0x10, 0x14);
        source.set_included_service_uuids(&[Uuid::from_u16(0x1800)]);
        source.merge_characteristics(&[characteristic(0x2a19, 0x11)]);

        target.merge_from(&source);
        assert_eq!(target.start_handle(), 0x10);
        assert_eq!(target.end_handle(), 0x14);
        assert_eq!(target.included_service_uuids(), Some(vec![Uuid::from_u16(0x1800)]));
        let c = target.characteristic(Uuid::from_u16(0x2a19)).unwrap();
        assert_eq!(c.service(), Some(target.clone()));
        assert_ne!(Some(c), source.characteristic(Uuid::from_u16(0x2a19)));
    }

    #[test]
    fn merge_from_keeps_own_characteristics() {
        let target = service(0x180f, 1, 4);
        let own = target.merge_characteristics(&[characteristic(0x2a19, 2)]);

        let source = service(0x180f, 0x10, 0x14);
        source.merge_characteristics(&[characteristic(0x2a19, 0x11), characteristic(0x2a1a, 0x13)]);

        target.merge_from(&source);
        assert_eq!(target.start_handle(), 1);
        assert_eq!(target.characteristics(), Some(own));
    }

    #[test]
    fn dump_shape() {
        let s = service(0x180f, 1, 4);
        s.merge_characteristics(&[characteristic(0x2a19, 2)]);
        let json = serde_json::to_value(s.dump()).unwrap();
        assert_eq!(json["uuid"], "0000180f-0000-1000-8000-00805f9b34fb");
        assert_eq!(json["name"], "Battery Service");
        assert_eq!(json["startHandle"], 1);
        assert_eq!(json["includedServiceUuids"], serde_json::Value::Null);
        assert_eq!(json["characteristics"][0]["name"], "Battery Level");
    }
}
