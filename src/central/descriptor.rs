use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::central::{Central, CentralEvent, reject_on_disconnect};
use crate::central::attribute::Attribute;
use crate::central::characteristic::{Characteristic, CharacteristicInner};
use crate::central::peripheral::Peripheral;
use crate::central::service::Service;
use crate::error::*;
use crate::hci::gatt::DescriptorInfo;
use crate::request::Request;
use crate::uuid::Uuid;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorDump {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub handle: u16,
}

pub(in crate) struct DescriptorInner {
    uuid: Uuid,
    characteristic: Weak<CharacteristicInner>,
    handle: Mutex<u16>,
}

/// An object that provides further information about a remote peripheral’s characteristic.
///
/// Descriptors provide further information about a characteristic’s value. For example, they may
/// describe the value in human-readable form and describe how to format the value for presentation
/// purposes. Characteristic descriptors also indicate whether a characteristic’s value indicates or
/// notifies a client (a central) when the value of the characteristic changes.
///
/// Two handles are equal when they refer to the same discovered descriptor.
#[derive(Clone)]
pub struct Descriptor(Arc<DescriptorInner>);

assert_impl_all!(Descriptor: Send, Sync);

impl Descriptor {
    pub(in crate) fn new(characteristic: Weak<CharacteristicInner>, info: &DescriptorInfo) -> Self {
        Self(Arc::new(DescriptorInner {
            uuid: info.uuid,
            characteristic,
            handle: Mutex::new(info.handle),
        }))
    }

    pub(in crate) fn from_dump(characteristic: Weak<CharacteristicInner>, dump: &DescriptorDump)
        -> Self
    {
        Self::new(characteristic, &DescriptorInfo {
            uuid: dump.uuid,
            handle: dump.handle,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    pub fn handle(&self) -> u16 {
        *self.0.handle.lock()
    }

    pub fn characteristic(&self) -> Option<Characteristic> {
        self.0.characteristic.upgrade().map(Characteristic::from_inner)
    }

    pub(in crate) fn info(&self) -> DescriptorInfo {
        DescriptorInfo {
            uuid: self.uuid(),
            handle: self.handle(),
        }
    }

    pub(in crate) fn update(&self, info: &DescriptorInfo) {
        *self.0.handle.lock() = info.handle;
    }

    pub fn dump(&self) -> DescriptorDump {
        DescriptorDump {
            uuid: self.uuid(),
            name: self.name().map(|v| v.to_owned()),
            type_name: self.type_name().map(|v| v.to_owned()),
            handle: self.handle(),
        }
    }

    pub fn read_value(&self) -> Request<Vec<u8>> {
        let (central, peripheral, service, characteristic) = try_request!(self.route());
        let id = peripheral.id().clone();
        let (s, c, d) = (service.uuid(), characteristic.uuid(), self.uuid());
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.read_value(&id, s, c, d),
            move |event| match event {
                CentralEvent::DescriptorValue { descriptor, value, .. } if descriptor == &this =>
                    value.clone().into(),
                event => reject_on_disconnect(event, &peripheral),
            })
    }

    pub fn write_value(&self, data: &[u8]) -> Request<()> {
        let (central, peripheral, service, characteristic) = try_request!(self.route());
        let id = peripheral.id().clone();
        let (s, c, d) = (service.uuid(), characteristic.uuid(), self.uuid());
        let data = data.to_vec();
        let this = self.clone();
        central.request(central.request_options(),
            move |central| central.write_value(&id, s, c, d, &data),
            move |event| match event {
                CentralEvent::WriteDescriptorResult { descriptor, result, .. } if descriptor == &this =>
                    result.clone().into(),
                event => reject_on_disconnect(event, &peripheral),
            })
    }

    fn route(&self) -> Result<(Central, Peripheral, Service, Characteristic)> {
        let characteristic = self.characteristic().ok_or_else(Error::detached)?;
        let service = characteristic.service().ok_or_else(Error::detached)?;
        let peripheral = service.peripheral().ok_or_else(Error::detached)?;
        let central = peripheral.central()?;
        Ok((central, peripheral, service, characteristic))
    }
}

impl Attribute for Descriptor {
    fn uuid(&self) -> Uuid {
        self.0.uuid
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Descriptor {}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.uuid())
            .field("handle", &self.handle())
            .finish()
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = serde_json::to_string(&self.dump()).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}
