use enumflags2::BitFlags;
use parking_lot::Mutex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use static_assertions::assert_impl_all;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::central::{Central, CentralEvent, reject_on_disconnect};
use crate::central::attribute::Attribute;
use crate::central::descriptor::{Descriptor, DescriptorDump};
use crate::central::peripheral::Peripheral;
use crate::central::service::{Service, ServiceInner};
use crate::error::*;
use crate::hci::gatt::{CharacteristicInfo, DescriptorInfo};
use crate::request::Request;
use crate::uuid::Uuid;

#[derive(BitFlags, Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
enum Property {
    Broadcast                       = 0x01,
    Read                            = 0x02,
    WriteWithoutResponse            = 0x04,
    Write                           = 0x08,
    Notify                          = 0x10,
    Indicate                        = 0x20,
    AuthenticatedSignedWrites       = 0x40,
    ExtendedProperties              = 0x80,
}

impl Property {
    const ALL: [Property; 8] = [
        Property::Broadcast,
        Property::Read,
        Property::WriteWithoutResponse,
        Property::Write,
        Property::Notify,
        Property::Indicate,
        Property::AuthenticatedSignedWrites,
        Property::ExtendedProperties,
    ];

    fn name(self) -> &'static str {
        use Property::*;
        match self {
            Broadcast => "broadcast",
            Read => "read",
            WriteWithoutResponse => "writeWithoutResponse",
            Write => "write",
            Notify => "notify",
            Indicate => "indicate",
            AuthenticatedSignedWrites => "authenticatedSignedWrites",
            ExtendedProperties => "extendedProperties",
        }
    }
}

/// Characteristic properties bit field as declared by the peripheral.
///
/// Serialized as the list of set property names, e.g. `["read", "notify"]`.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Properties(BitFlags<Property>);

impl Properties {
    pub(in crate) fn from_bits_truncate(bits: u8) -> Self {
        Self(BitFlags::from_bits_truncate(bits))
    }

    pub fn bits(&self) -> u8 {
        self.0.bits()
    }

    /// Names of the set properties in bit order.
    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(Property::name).collect()
    }
}

macro_rules! properties {
    ($($(#[$attr:meta])* $f:ident => $e:ident,)*) => {
        impl Properties {
            $(
                $(#[$attr])*
                pub fn $f(&self) -> bool {
                    self.0.contains(Property::$e)
                }
            )*
        }
    };
}

properties!(
    #[doc="Characteristic can broadcast its value using a server characteristic configuration descriptor."]
    is_broadcast => Broadcast,

    #[doc="A central can read the characteristic’s value."]
    is_read => Read,

    #[doc="A central can write the characteristic’s value, without a response to indicate that the write succeeded."]
    is_write_without_response => WriteWithoutResponse,

    #[doc="A central can write the characteristic’s value, with a response to indicate that the write succeeded."]
    is_write => Write,

    #[doc="The peripheral permits notifications of the characteristic’s value, without a response from the central to indicate receipt of the notification."]
    is_notify => Notify,

    #[doc="The peripheral permits notifications of the characteristic’s value, with a response from the central to indicate receipt of the notification."]
    is_indicate => Indicate,

    #[doc="The peripheral allows signed writes of the characteristic’s value, without a response to indicate the write succeeded."]
    is_authenticated_signed_writes => AuthenticatedSignedWrites,

    #[doc="The characteristic defines additional properties in the extended properties descriptor."]
    is_extended_properties => ExtendedProperties,
);

assert_impl_all!(Properties: Send, Sync);

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Properties")
            .field(&crate::util::BitFlagsDebug(self.0))
            .finish()
    }
}

impl Serialize for Properties {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(Property::name))
    }
}

impl<'de> Deserialize<'de> for Properties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut bits = 0;
        for name in &names {
            let p = Property::ALL.iter()
                .find(|p| p.name() == name.as_str())
                .ok_or_else(|| de::Error::custom(
                    format!("unknown characteristic property `{}`", name)))?;
            bits |= *p as u8;
        }
        Ok(Self::from_bits_truncate(bits))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicDump {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub properties: Properties,
    pub start_handle: u16,
    pub value_handle: u16,
    pub end_handle: u16,
    #[serde(default)]
    pub descriptors: Option<Vec<DescriptorDump>>,
}

struct State {
    properties: Properties,
    start_handle: u16,
    value_handle: u16,
    end_handle: u16,
    descriptors: Option<Vec<Descriptor>>,
}

pub(in crate) struct CharacteristicInner {
    uuid: Uuid,
    service: Weak<ServiceInner>,
    state: Mutex<State>,
}

/// A characteristic of a remote peripheral’s service.
///
/// Handles are cheap to clone and compare equal when they refer to the same discovered
/// characteristic.
#[derive(Clone)]
pub struct Characteristic(Arc<CharacteristicInner>);

assert_impl_all!(Characteristic: Send, Sync);

impl Characteristic {
    pub(in crate) fn new(service: Weak<ServiceInner>, info: &CharacteristicInfo) -> Self {
        Self(Arc::new(CharacteristicInner {
            uuid: info.uuid,
            service,
            state: Mutex::new(State {
                properties: info.properties,
                start_handle: info.start_handle,
                value_handle: info.value_handle,
                end_handle: info.end_handle,
                descriptors: None,
            }),
        }))
    }

    pub(in crate) fn from_inner(inner: Arc<CharacteristicInner>) -> Self {
        Self(inner)
    }

    pub(in crate) fn from_dump(service: Weak<ServiceInner>, dump: &CharacteristicDump) -> Self {
        let r = Self::new(service, &CharacteristicInfo {
            uuid: dump.uuid,
            properties: dump.properties,
            start_handle: dump.start_handle,
            value_handle: dump.value_handle,
            end_handle: dump.end_handle,
        });
        if let Some(descriptors) = &dump.descriptors {
            let descriptors = descriptors.iter()
                .map(|d| Descriptor::from_dump(Arc::downgrade(&r.0), d))
                .collect();
            r.0.state.lock().descriptors = Some(descriptors);
        }
        r
    }

    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    pub fn properties(&self) -> Properties {
        self.0.state.lock().properties
    }

    pub fn start_handle(&self) -> u16 {
        self.0.state.lock().start_handle
    }

    /// Handle of the characteristic value attribute.
    pub fn value_handle(&self) -> u16 {
        self.0.state.lock().value_handle
    }

    pub fn end_handle(&self) -> u16 {
        self.0.state.lock().end_handle
    }

    /// Discovered descriptors or `None` if descriptors were never discovered.
    pub fn descriptors(&self) -> Option<Vec<Descriptor>> {
        self.0.state.lock().descriptors.clone()
    }

    pub fn descriptor(&self, uuid: Uuid) -> Option<Descriptor> {
        self.0.state.lock().descriptors.as_ref()?
            .iter()
            .find(|d| d.uuid() == uuid)
            .cloned()
    }

    /// The owning service or `None` if it's gone.
    pub fn service(&self) -> Option<Service> {
        self.0.service.upgrade().map(Service::from_inner)
    }

    pub(in crate) fn info(&self) -> CharacteristicInfo {
        let state = self.0.state.lock();
        CharacteristicInfo {
            uuid: self.0.uuid,
            properties: state.properties,
            start_handle: state.start_handle,
            value_handle: state.value_handle,
            end_handle: state.end_handle,
        }
    }

    pub(in crate) fn descriptor_infos(&self) -> Option<Vec<DescriptorInfo>> {
        Some(self.descriptors()?.iter().map(|d| d.info()).collect())
    }

    pub(in crate) fn update(&self, info: &CharacteristicInfo) {
        let mut state = self.0.state.lock();
        state.properties = info.properties;
        state.start_handle = info.start_handle;
        state.value_handle = info.value_handle;
        state.end_handle = info.end_handle;
    }

    /// Merges discovery results into the descriptor list and returns the objects matching
    /// `infos`, in the same order.
    pub(in crate) fn merge_descriptors(&self, infos: &[DescriptorInfo]) -> Vec<Descriptor> {
        let mut state = self.0.state.lock();
        let list = state.descriptors.get_or_insert_with(Vec::new);
        infos.iter()
            .map(|info| match list.iter().find(|d| d.uuid() == info.uuid) {
                Some(d) => {
                    d.update(info);
                    d.clone()
                }
                None => {
                    let d = Descriptor::new(Arc::downgrade(&self.0), info);
                    list.push(d.clone());
                    d
                }
            })
            .collect()
    }

    pub fn dump(&self) -> CharacteristicDump {
        let info = self.info();
        CharacteristicDump {
            uuid: info.uuid,
            name: self.name().map(|v| v.to_owned()),
            type_name: self.type_name().map(|v| v.to_owned()),
            properties: info.properties,
            start_handle: info.start_handle,
            value_handle: info.value_handle,
            end_handle: info.end_handle,
            descriptors: self.descriptors().map(|v| v.iter().map(|d| d.dump()).collect()),
        }
    }

    pub fn read(&self) -> Request<Vec<u8>> {
        let (central, peripheral, service) = try_request!(self.route());
        let id = peripheral.id().clone();
        let (s, c) = (service.uuid(), self.uuid());
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.read(&id, s, c),
            move |event| match event {
                CentralEvent::CharacteristicValue { characteristic, value, is_notification: false, .. }
                    if characteristic == &this => value.clone().into(),
                event => reject_on_disconnect(event, &peripheral),
            })
    }

    /// Writes the value. Values longer than what fits one request are written with prepared
    /// writes; `without_response` writes must fit the link MTU.
    pub fn write(&self, data: &[u8], without_response: bool) -> Request<()> {
        let (central, peripheral, service) = try_request!(self.route());
        let id = peripheral.id().clone();
        let (s, c) = (service.uuid(), self.uuid());
        let data = data.to_vec();
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.write(&id, s, c, &data, without_response),
            move |event| match event {
                CentralEvent::WriteCharacteristicResult { characteristic, result, .. }
                    if characteristic == &this => result.clone().into(),
                event => reject_on_disconnect(event, &peripheral),
            })
    }

    /// Sets the broadcast bit of the server characteristic configuration. Resolves with the
    /// new state.
    pub fn broadcast(&self, enable: bool) -> Request<bool> {
        self.configure(true, enable, |v| v)
    }

    /// Enables or disables notifications or indications, whichever the characteristic
    /// supports. Resolves with the new state.
    pub fn notify(&self, enable: bool) -> Request<bool> {
        self.configure(false, enable, |v| v)
    }

    pub fn subscribe(&self) -> Request<()> {
        self.configure(false, true, |_| ())
    }

    pub fn unsubscribe(&self) -> Request<()> {
        self.configure(false, false, |_| ())
    }

    pub fn discover_descriptors(&self) -> Request<Vec<Descriptor>> {
        let (central, peripheral, service) = try_request!(self.route());
        let id = peripheral.id().clone();
        let (s, c) = (service.uuid(), self.uuid());
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.discover_descriptors(&id, s, c),
            move |event| match event {
                CentralEvent::DescriptorsDiscovered { characteristic, descriptors, .. }
                    if characteristic == &this => descriptors.clone().into(),
                event => reject_on_disconnect(event, &peripheral),
            })
    }

    fn configure<T, F>(&self, broadcast: bool, enable: bool, map: F) -> Request<T>
    where
        T: Send + 'static,
        F: Fn(bool) -> T + Send + 'static,
    {
        let (central, peripheral, service) = try_request!(self.route());
        let id = peripheral.id().clone();
        let (s, c) = (service.uuid(), self.uuid());
        let this = self.clone();
        central.request(central.request_options(),
            move |central| if broadcast {
                central.broadcast(&id, s, c, enable)
            } else {
                central.notify(&id, s, c, enable)
            },
            move |event| match event {
                CentralEvent::BroadcastChanged { characteristic, result, .. }
                    if broadcast && characteristic == &this => result.clone().map(&map).into(),
                CentralEvent::SubscriptionChanged { characteristic, result, .. }
                    if !broadcast && characteristic == &this => result.clone().map(&map).into(),
                event => reject_on_disconnect(event, &peripheral),
            })
    }

    fn route(&self) -> Result<(Central, Peripheral, Service)> {
        let service = self.service().ok_or_else(Error::detached)?;
        let peripheral = service.peripheral().ok_or_else(Error::detached)?;
        let central = peripheral.central()?;
        Ok((central, peripheral, service))
    }
}

impl Attribute for Characteristic {
    fn uuid(&self) -> Uuid {
        self.0.uuid
    }
}

impl PartialEq for Characteristic {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Characteristic {}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let info = self.info();
        f.debug_struct("Characteristic")
            .field("uuid", &info.uuid)
            .field("properties", &info.properties)
            .field("value_handle", &info.value_handle)
            .finish()
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = serde_json::to_string(&self.dump()).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}
