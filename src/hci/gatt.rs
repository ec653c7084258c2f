//! Attribute Protocol client of one connection.
//!
//! Requests are serialized: at most one is outstanding and the others wait in a FIFO queue.
//! Frames to send are queued and drained with [`take_outbox`](Gatt::take_outbox); completed
//! operations with [`take_events`](Gatt::take_events).

use log::*;
use std::collections::{HashMap, VecDeque};

use crate::central::characteristic::Properties;
use crate::error::*;
use crate::util::{Hex, read_u16_le};
use crate::uuid::Uuid;

const ERROR_RESP: u8 = 0x01;
const MTU_REQ: u8 = 0x02;
const MTU_RESP: u8 = 0x03;
const FIND_INFO_REQ: u8 = 0x04;
const READ_BY_TYPE_REQ: u8 = 0x08;
const READ_REQ: u8 = 0x0a;
const READ_BLOB_REQ: u8 = 0x0c;
const READ_BY_GROUP_REQ: u8 = 0x10;
const WRITE_REQ: u8 = 0x12;
const PREPARE_WRITE_REQ: u8 = 0x16;
const EXECUTE_WRITE_REQ: u8 = 0x18;
const HANDLE_NOTIFY: u8 = 0x1b;
const HANDLE_IND: u8 = 0x1d;
const HANDLE_CNF: u8 = 0x1e;
const WRITE_CMD: u8 = 0x52;

const ECODE_REQ_NOT_SUPP: u8 = 0x06;
const ECODE_INVALID_OFFSET: u8 = 0x07;
const ECODE_ATTR_NOT_FOUND: u8 = 0x0a;
const ECODE_ATTR_NOT_LONG: u8 = 0x0b;

const PRIMARY_SERVICE_UUID: u16 = 0x2800;
const INCLUDE_UUID: u16 = 0x2802;
const CHARACTERISTIC_UUID: u16 = 0x2803;
const CLIENT_CHARACTERISTIC_CONFIG_UUID: u16 = 0x2902;
const SERVER_CHARACTERISTIC_CONFIG_UUID: u16 = 0x2903;

/// MTU every LE link starts with.
pub const DEFAULT_MTU: u16 = 23;

/// Maximum length of an attribute value.
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 512;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: Properties,
    pub start_handle: u16,
    pub value_handle: u16,
    pub end_handle: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DescriptorInfo {
    pub uuid: Uuid,
    pub handle: u16,
}

#[derive(Clone, Debug)]
pub enum GattEvent {
    Mtu(u16),
    ServicesDiscovered(Result<Vec<ServiceInfo>>),
    IncludedServicesDiscovered {
        service: Uuid,
        result: Result<Vec<Uuid>>,
    },
    CharacteristicsDiscovered {
        service: Uuid,
        result: Result<Vec<CharacteristicInfo>>,
    },
    DescriptorsDiscovered {
        service: Uuid,
        characteristic: Uuid,
        result: Result<Vec<DescriptorInfo>>,
    },
    Read {
        service: Uuid,
        characteristic: Uuid,
        result: Result<Vec<u8>>,
        is_notification: bool,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        result: Result<()>,
    },
    Broadcast {
        service: Uuid,
        characteristic: Uuid,
        result: Result<bool>,
    },
    Notify {
        service: Uuid,
        characteristic: Uuid,
        result: Result<bool>,
    },
    ValueRead {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        result: Result<Vec<u8>>,
    },
    ValueWrite {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        result: Result<()>,
    },
    HandleRead {
        handle: u16,
        result: Result<Vec<u8>>,
    },
    HandleWrite {
        handle: u16,
        result: Result<()>,
    },
    HandleNotify {
        handle: u16,
        data: Vec<u8>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Config {
    /// Server Characteristic Configuration, broadcast bit.
    Server,
    /// Client Characteristic Configuration, notify or indicate bit.
    Client,
}

#[derive(Clone, Debug, PartialEq)]
enum Op {
    ExchangeMtu {
        mtu: u16,
    },
    DiscoverServices {
        filter: Vec<Uuid>,
        found: Vec<ServiceInfo>,
    },
    DiscoverIncludedServices {
        service: ServiceInfo,
        filter: Vec<Uuid>,
        found: Vec<Uuid>,
    },
    DiscoverCharacteristics {
        service: ServiceInfo,
        filter: Vec<Uuid>,
        found: Vec<CharacteristicInfo>,
    },
    DiscoverDescriptors {
        service: Uuid,
        characteristic: CharacteristicInfo,
        found: Vec<DescriptorInfo>,
    },
    Read {
        service: Uuid,
        characteristic: CharacteristicInfo,
        value: Vec<u8>,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
    },
    WriteCommand {
        service: Uuid,
        characteristic: Uuid,
    },
    LongWrite {
        service: Uuid,
        characteristic: CharacteristicInfo,
        data: Vec<u8>,
        offset: usize,
    },
    CancelPreparedWrites,
    ReadConfig {
        service: Uuid,
        characteristic: CharacteristicInfo,
        config: Config,
        enable: bool,
    },
    WriteConfig {
        service: Uuid,
        characteristic: Uuid,
        config: Config,
        enable: bool,
    },
    ReadValue {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    WriteValue {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    ReadHandle {
        handle: u16,
    },
    WriteHandle {
        handle: u16,
        without_response: bool,
    },
}

impl Op {
    /// Whether the PDU is a command that gets no response.
    fn is_command(&self) -> bool {
        match self {
            Op::WriteCommand { .. } | Op::WriteHandle { without_response: true, .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Transaction {
    pdu: Vec<u8>,
    op: Op,
}

enum Step {
    Done(Option<GattEvent>),
    Next(Vec<u8>, Op),
}

#[derive(Debug)]
pub struct Gatt {
    handle: u16,
    preferred_mtu: u16,
    mtu: u16,
    services: Vec<ServiceInfo>,
    characteristics: HashMap<Uuid, Vec<CharacteristicInfo>>,
    descriptors: HashMap<(Uuid, Uuid), Vec<DescriptorInfo>>,
    current: Option<Transaction>,
    queue: VecDeque<Transaction>,
    outbox: Vec<Vec<u8>>,
    events: Vec<GattEvent>,
    ended: bool,
}

impl Gatt {
    pub fn new(handle: u16, preferred_mtu: u16) -> Self {
        Self {
            handle,
            preferred_mtu: preferred_mtu.max(DEFAULT_MTU),
            mtu: DEFAULT_MTU,
            services: Vec::new(),
            characteristics: HashMap::new(),
            descriptors: HashMap::new(),
            current: None,
            queue: VecDeque::new(),
            outbox: Vec::new(),
            events: Vec::new(),
            ended: false,
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::replace(&mut self.outbox, Vec::new())
    }

    pub fn take_events(&mut self) -> Vec<GattEvent> {
        std::mem::replace(&mut self.events, Vec::new())
    }

    /// Drops queued requests and ignores any further input.
    pub fn end(&mut self) {
        self.ended = true;
        self.current = None;
        self.queue.clear();
        self.outbox.clear();
    }

    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    /// Seeds the attribute table with services known from a previous discovery.
    pub fn add_services(&mut self, services: &[ServiceInfo]) {
        for s in services {
            merge_by_uuid(&mut self.services, *s, |v| v.uuid);
        }
    }

    pub fn add_characteristics(&mut self, service: Uuid, characteristics: &[CharacteristicInfo]) {
        let list = self.characteristics.entry(service).or_default();
        for c in characteristics {
            merge_by_uuid(list, *c, |v| v.uuid);
        }
    }

    pub fn add_descriptors(&mut self, service: Uuid, characteristic: Uuid,
        descriptors: &[DescriptorInfo])
    {
        let list = self.descriptors.entry((service, characteristic)).or_default();
        for d in descriptors {
            merge_by_uuid(list, *d, |v| v.uuid);
        }
    }

    pub fn exchange_mtu(&mut self, mtu: u16) {
        let mtu = mtu.max(DEFAULT_MTU);
        self.preferred_mtu = mtu;
        let mut pdu = vec![MTU_REQ];
        pdu.extend_from_slice(&mtu.to_le_bytes());
        self.enqueue(pdu, Op::ExchangeMtu { mtu });
    }

    pub fn discover_services(&mut self, filter: &[Uuid]) {
        self.enqueue(read_by_group_request(0x0001, 0xffff, PRIMARY_SERVICE_UUID),
            Op::DiscoverServices {
                filter: filter.to_vec(),
                found: Vec::new(),
            });
    }

    pub fn discover_included_services(&mut self, service: Uuid, filter: &[Uuid]) -> Result<()> {
        let service = self.service(service)?;
        self.enqueue(read_by_type_request(service.start_handle, service.end_handle, INCLUDE_UUID),
            Op::DiscoverIncludedServices {
                service,
                filter: filter.to_vec(),
                found: Vec::new(),
            });
        Ok(())
    }

    pub fn discover_characteristics(&mut self, service: Uuid, filter: &[Uuid]) -> Result<()> {
        let service = self.service(service)?;
        self.enqueue(
            read_by_type_request(service.start_handle, service.end_handle, CHARACTERISTIC_UUID),
            Op::DiscoverCharacteristics {
                service,
                filter: filter.to_vec(),
                found: Vec::new(),
            });
        Ok(())
    }

    pub fn discover_descriptors(&mut self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(service, characteristic)?;
        if c.value_handle >= c.end_handle {
            self.events.push(GattEvent::DescriptorsDiscovered {
                service,
                characteristic,
                result: Ok(Vec::new()),
            });
            return Ok(());
        }
        self.enqueue(find_info_request(c.value_handle + 1, c.end_handle),
            Op::DiscoverDescriptors {
                service,
                characteristic: c,
                found: Vec::new(),
            });
        Ok(())
    }

    pub fn read(&mut self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(service, characteristic)?;
        self.enqueue(read_request(c.value_handle), Op::Read {
            service,
            characteristic: c,
            value: Vec::new(),
        });
        Ok(())
    }

    pub fn write(&mut self, service: Uuid, characteristic: Uuid, data: Vec<u8>,
        without_response: bool) -> Result<()>
    {
        check_value_len(&data)?;
        let c = self.characteristic(service, characteristic)?;
        if without_response {
            self.enqueue(write_pdu(WRITE_CMD, c.value_handle, &data),
                Op::WriteCommand { service, characteristic });
        } else if data.len() > self.mtu as usize - 3 {
            let pdu = self.prepare_write_request(c.value_handle, 0, &data);
            self.enqueue(pdu, Op::LongWrite {
                service,
                characteristic: c,
                data,
                offset: 0,
            });
        } else {
            self.enqueue(write_pdu(WRITE_REQ, c.value_handle, &data),
                Op::Write { service, characteristic });
        }
        Ok(())
    }

    pub fn broadcast(&mut self, service: Uuid, characteristic: Uuid, enable: bool) -> Result<()> {
        self.configure(service, characteristic, Config::Server, enable)
    }

    pub fn notify(&mut self, service: Uuid, characteristic: Uuid, enable: bool) -> Result<()> {
        self.configure(service, characteristic, Config::Client, enable)
    }

    pub fn read_value(&mut self, service: Uuid, characteristic: Uuid, descriptor: Uuid)
        -> Result<()>
    {
        let d = self.descriptor(service, characteristic, descriptor)?;
        self.enqueue(read_request(d.handle), Op::ReadValue { service, characteristic, descriptor });
        Ok(())
    }

    pub fn write_value(&mut self, service: Uuid, characteristic: Uuid, descriptor: Uuid,
        data: Vec<u8>) -> Result<()>
    {
        check_value_len(&data)?;
        let d = self.descriptor(service, characteristic, descriptor)?;
        self.enqueue(write_pdu(WRITE_REQ, d.handle, &data),
            Op::WriteValue { service, characteristic, descriptor });
        Ok(())
    }

    pub fn read_handle(&mut self, handle: u16) {
        self.enqueue(read_request(handle), Op::ReadHandle { handle });
    }

    pub fn write_handle(&mut self, handle: u16, data: Vec<u8>, without_response: bool)
        -> Result<()>
    {
        check_value_len(&data)?;
        let opcode = if without_response { WRITE_CMD } else { WRITE_REQ };
        self.enqueue(write_pdu(opcode, handle, &data),
            Op::WriteHandle { handle, without_response });
        Ok(())
    }

    /// Handles an inbound ATT PDU.
    pub fn on_data(&mut self, data: &[u8]) {
        if self.ended {
            return;
        }
        let opcode = match data.first() {
            Some(&v) => v,
            None => return,
        };
        match opcode {
            HANDLE_NOTIFY | HANDLE_IND => self.on_handle_value(opcode, data),
            MTU_REQ => {
                // The peer is a client too: answer and adopt the smaller MTU.
                if let Some(client_mtu) = read_u16_le(data, 1) {
                    self.mtu = self.preferred_mtu.min(client_mtu).max(DEFAULT_MTU);
                    let mut r = vec![MTU_RESP];
                    r.extend_from_slice(&self.preferred_mtu.to_le_bytes());
                    self.send_pdu(r);
                    self.events.push(GattEvent::Mtu(self.mtu));
                }
            }
            WRITE_CMD | HANDLE_CNF => {}
            v if is_request(v) => {
                debug!("rejecting server request 0x{:02x} on {}", v, self.handle);
                self.send_pdu(vec![ERROR_RESP, v, 0x00, 0x00, ECODE_REQ_NOT_SUPP]);
            }
            _ => self.on_response(data),
        }
    }

    fn on_handle_value(&mut self, opcode: u8, data: &[u8]) {
        let handle = match read_u16_le(data, 1) {
            Some(v) => v,
            None => {
                warn!("malformed handle value PDU: {}", Hex(data));
                return;
            }
        };
        let value = data[3..].to_vec();
        if opcode == HANDLE_IND {
            self.send_pdu(vec![HANDLE_CNF]);
        }
        let owner = self.characteristics.iter()
            .flat_map(|(s, cs)| cs.iter().map(move |c| (*s, c)))
            .find(|(_, c)| c.value_handle == handle)
            .map(|(s, c)| (s, c.uuid));
        if let Some((service, characteristic)) = owner {
            self.events.push(GattEvent::Read {
                service,
                characteristic,
                result: Ok(value.clone()),
                is_notification: true,
            });
        }
        self.events.push(GattEvent::HandleNotify { handle, data: value });
    }

    fn on_response(&mut self, data: &[u8]) {
        let tr = match self.current.take() {
            Some(v) => v,
            None => {
                warn!("unexpected ATT PDU on {}: {}", self.handle, Hex(data));
                return;
            }
        };
        let req_opcode = tr.pdu[0];
        let step = if data[0] == ERROR_RESP {
            if data.len() < 5 || data[1] != req_opcode {
                warn!("mismatched ATT error response on {}: {}", self.handle, Hex(data));
                self.current = Some(tr);
                return;
            }
            let handle = read_u16_le(data, 2).unwrap_or(0);
            self.on_error(tr.op, req_opcode, handle, data[4])
        } else if data[0] == req_opcode + 1 {
            self.on_success(tr.op, data)
        } else {
            warn!("unexpected ATT response 0x{:02x} to 0x{:02x} on {}", data[0], req_opcode,
                self.handle);
            self.current = Some(tr);
            return;
        };
        match step {
            Step::Done(event) => {
                self.events.extend(event);
                self.send_next();
            }
            Step::Next(pdu, op) => {
                self.send_pdu(pdu.clone());
                self.current = Some(Transaction { pdu, op });
            }
        }
    }

    fn on_success(&mut self, op: Op, data: &[u8]) -> Step {
        match op {
            Op::ExchangeMtu { mtu } => {
                let server_mtu = read_u16_le(data, 1).unwrap_or(DEFAULT_MTU);
                self.mtu = mtu.min(server_mtu).max(DEFAULT_MTU);
                debug!("negotiated MTU {} on {}", self.mtu, self.handle);
                Step::Done(Some(GattEvent::Mtu(self.mtu)))
            }
            Op::DiscoverServices { filter, mut found } => {
                let mut last_end = 0xffff;
                for e in entries(data) {
                    if let (Some(start_handle), Some(end_handle), Some(uuid)) =
                        (read_u16_le(e, 0), read_u16_le(e, 2), Uuid::from_le_slice(&e[4.min(e.len())..]))
                    {
                        found.push(ServiceInfo { uuid, start_handle, end_handle });
                        last_end = end_handle;
                    }
                }
                if last_end < 0xffff {
                    let pdu = read_by_group_request(last_end + 1, 0xffff, PRIMARY_SERVICE_UUID);
                    Step::Next(pdu, Op::DiscoverServices { filter, found })
                } else {
                    self.finish(Op::DiscoverServices { filter, found })
                }
            }
            Op::DiscoverIncludedServices { service, filter, mut found } => {
                let mut last = service.end_handle;
                for e in entries(data) {
                    let handle = match read_u16_le(e, 0) {
                        Some(v) => v,
                        None => continue,
                    };
                    last = handle;
                    let uuid = Uuid::from_le_slice(&e[6.min(e.len())..])
                        .or_else(|| {
                            let start = read_u16_le(e, 2)?;
                            self.services.iter().find(|s| s.start_handle == start).map(|s| s.uuid)
                        });
                    match uuid {
                        Some(uuid) => found.push(uuid),
                        None => debug!("included service at 0x{:04x} has no known UUID", handle),
                    }
                }
                if last < service.end_handle {
                    let pdu = read_by_type_request(last + 1, service.end_handle, INCLUDE_UUID);
                    Step::Next(pdu, Op::DiscoverIncludedServices { service, filter, found })
                } else {
                    self.finish(Op::DiscoverIncludedServices { service, filter, found })
                }
            }
            Op::DiscoverCharacteristics { service, filter, mut found } => {
                let mut last = service.end_handle;
                for e in entries(data) {
                    if let (Some(start_handle), Some(&props), Some(value_handle), Some(uuid)) =
                        (read_u16_le(e, 0), e.get(2), read_u16_le(e, 3),
                            Uuid::from_le_slice(&e[5.min(e.len())..]))
                    {
                        found.push(CharacteristicInfo {
                            uuid,
                            properties: Properties::from_bits_truncate(props),
                            start_handle,
                            value_handle,
                            end_handle: service.end_handle,
                        });
                        last = start_handle;
                    }
                }
                if last < service.end_handle {
                    let pdu = read_by_type_request(last + 1, service.end_handle, CHARACTERISTIC_UUID);
                    Step::Next(pdu, Op::DiscoverCharacteristics { service, filter, found })
                } else {
                    self.finish(Op::DiscoverCharacteristics { service, filter, found })
                }
            }
            Op::DiscoverDescriptors { service, characteristic, mut found } => {
                let uuid_len = match data.get(1) {
                    Some(1) => 2,
                    Some(2) => 16,
                    _ => {
                        warn!("malformed find information response: {}", Hex(data));
                        return self.finish(Op::DiscoverDescriptors { service, characteristic, found });
                    }
                };
                let mut last = characteristic.end_handle;
                for e in data[2..].chunks_exact(2 + uuid_len) {
                    if let (Some(handle), Some(uuid)) = (read_u16_le(e, 0), Uuid::from_le_slice(&e[2..])) {
                        found.push(DescriptorInfo { uuid, handle });
                        last = handle;
                    }
                }
                if last < characteristic.end_handle {
                    let pdu = find_info_request(last + 1, characteristic.end_handle);
                    Step::Next(pdu, Op::DiscoverDescriptors { service, characteristic, found })
                } else {
                    self.finish(Op::DiscoverDescriptors { service, characteristic, found })
                }
            }
            Op::Read { service, characteristic, mut value } => {
                let chunk = &data[1..];
                value.extend_from_slice(chunk);
                if chunk.len() == self.mtu as usize - 1 && value.len() < MAX_ATTRIBUTE_VALUE_LEN {
                    let mut pdu = vec![READ_BLOB_REQ];
                    pdu.extend_from_slice(&characteristic.value_handle.to_le_bytes());
                    pdu.extend_from_slice(&(value.len() as u16).to_le_bytes());
                    Step::Next(pdu, Op::Read { service, characteristic, value })
                } else {
                    self.finish(Op::Read { service, characteristic, value })
                }
            }
            Op::Write { service, characteristic } => Step::Done(Some(GattEvent::Write {
                service,
                characteristic,
                result: Ok(()),
            })),
            Op::LongWrite { service, characteristic, data: value, offset } => {
                let offset = offset + self.mtu as usize - 5;
                if offset < value.len() {
                    let pdu = self.prepare_write_request(characteristic.value_handle, offset, &value);
                    Step::Next(pdu, Op::LongWrite { service, characteristic, data: value, offset })
                } else if data[0] == EXECUTE_WRITE_REQ + 1 {
                    Step::Done(Some(GattEvent::Write {
                        service,
                        characteristic: characteristic.uuid,
                        result: Ok(()),
                    }))
                } else {
                    Step::Next(vec![EXECUTE_WRITE_REQ, 0x01],
                        Op::LongWrite { service, characteristic, data: value, offset })
                }
            }
            Op::CancelPreparedWrites => Step::Done(None),
            Op::ReadConfig { service, characteristic, config, enable } => {
                let entry = entries(data).next()
                    .and_then(|e| Some((read_u16_le(e, 0)?, read_u16_le(e, 2).unwrap_or(0))));
                let (handle, mut value) = match entry {
                    Some(v) => v,
                    None => {
                        let result = Err(Error::new(ErrorKind::Protocol,
                            "malformed configuration descriptor read"));
                        return Step::Done(Some(config_event(config, service,
                            characteristic.uuid, result)));
                    }
                };
                let bit = match config {
                    Config::Server => 0x0001,
                    Config::Client if characteristic.properties.is_notify() => 0x0001,
                    Config::Client if characteristic.properties.is_indicate() => 0x0002,
                    Config::Client => 0x0000,
                };
                if enable {
                    value |= bit;
                } else {
                    value &= !bit;
                }
                Step::Next(write_pdu(WRITE_REQ, handle, &value.to_le_bytes()), Op::WriteConfig {
                    service,
                    characteristic: characteristic.uuid,
                    config,
                    enable,
                })
            }
            Op::WriteConfig { service, characteristic, config, enable } =>
                Step::Done(Some(config_event(config, service, characteristic, Ok(enable)))),
            Op::ReadValue { service, characteristic, descriptor } =>
                Step::Done(Some(GattEvent::ValueRead {
                    service,
                    characteristic,
                    descriptor,
                    result: Ok(data[1..].to_vec()),
                })),
            Op::WriteValue { service, characteristic, descriptor } =>
                Step::Done(Some(GattEvent::ValueWrite {
                    service,
                    characteristic,
                    descriptor,
                    result: Ok(()),
                })),
            Op::ReadHandle { handle } => Step::Done(Some(GattEvent::HandleRead {
                handle,
                result: Ok(data[1..].to_vec()),
            })),
            Op::WriteHandle { handle, .. } => Step::Done(Some(GattEvent::HandleWrite {
                handle,
                result: Ok(()),
            })),
            Op::WriteCommand { .. } => Step::Done(None),
        }
    }

    fn on_error(&mut self, op: Op, req_opcode: u8, handle: u16, code: u8) -> Step {
        let err = || Error::from_att_code(req_opcode, handle, code);
        match op {
            Op::ExchangeMtu { .. } => {
                debug!("MTU exchange rejected on {}, keeping {}", self.handle, self.mtu);
                Step::Done(Some(GattEvent::Mtu(self.mtu)))
            }
            op @ Op::DiscoverServices { .. }
            | op @ Op::DiscoverIncludedServices { .. }
            | op @ Op::DiscoverCharacteristics { .. }
            | op @ Op::DiscoverDescriptors { .. } if code == ECODE_ATTR_NOT_FOUND => self.finish(op),
            Op::DiscoverServices { .. } => Step::Done(Some(GattEvent::ServicesDiscovered(Err(err())))),
            Op::DiscoverIncludedServices { service, .. } =>
                Step::Done(Some(GattEvent::IncludedServicesDiscovered {
                    service: service.uuid,
                    result: Err(err()),
                })),
            Op::DiscoverCharacteristics { service, .. } =>
                Step::Done(Some(GattEvent::CharacteristicsDiscovered {
                    service: service.uuid,
                    result: Err(err()),
                })),
            Op::DiscoverDescriptors { service, characteristic, .. } =>
                Step::Done(Some(GattEvent::DescriptorsDiscovered {
                    service,
                    characteristic: characteristic.uuid,
                    result: Err(err()),
                })),
            op @ Op::Read { .. } if req_opcode == READ_BLOB_REQ
                && (code == ECODE_ATTR_NOT_LONG || code == ECODE_INVALID_OFFSET) => self.finish(op),
            Op::Read { service, characteristic, .. } => Step::Done(Some(GattEvent::Read {
                service,
                characteristic: characteristic.uuid,
                result: Err(err()),
                is_notification: false,
            })),
            Op::Write { service, characteristic }
            | Op::WriteCommand { service, characteristic } => Step::Done(Some(GattEvent::Write {
                service,
                characteristic,
                result: Err(err()),
            })),
            Op::LongWrite { service, characteristic, .. } => {
                if req_opcode == PREPARE_WRITE_REQ {
                    self.queue.push_front(Transaction {
                        pdu: vec![EXECUTE_WRITE_REQ, 0x00],
                        op: Op::CancelPreparedWrites,
                    });
                }
                Step::Done(Some(GattEvent::Write {
                    service,
                    characteristic: characteristic.uuid,
                    result: Err(err()),
                }))
            }
            Op::CancelPreparedWrites => Step::Done(None),
            Op::ReadConfig { service, characteristic, config, .. } =>
                Step::Done(Some(config_event(config, service, characteristic.uuid, Err(err())))),
            Op::WriteConfig { service, characteristic, config, .. } =>
                Step::Done(Some(config_event(config, service, characteristic, Err(err())))),
            Op::ReadValue { service, characteristic, descriptor } =>
                Step::Done(Some(GattEvent::ValueRead {
                    service,
                    characteristic,
                    descriptor,
                    result: Err(err()),
                })),
            Op::WriteValue { service, characteristic, descriptor } =>
                Step::Done(Some(GattEvent::ValueWrite {
                    service,
                    characteristic,
                    descriptor,
                    result: Err(err()),
                })),
            Op::ReadHandle { handle } => Step::Done(Some(GattEvent::HandleRead {
                handle,
                result: Err(err()),
            })),
            Op::WriteHandle { handle, .. } => Step::Done(Some(GattEvent::HandleWrite {
                handle,
                result: Err(err()),
            })),
        }
    }

    /// Completes a multi-step operation with what was gathered so far.
    fn finish(&mut self, op: Op) -> Step {
        let event = match op {
            Op::DiscoverServices { filter, found } => {
                self.add_services(&found);
                GattEvent::ServicesDiscovered(Ok(filtered(found, &filter, |s| s.uuid)))
            }
            Op::DiscoverIncludedServices { service, filter, found } =>
                GattEvent::IncludedServicesDiscovered {
                    service: service.uuid,
                    result: Ok(filtered(found, &filter, |u| *u)),
                },
            Op::DiscoverCharacteristics { service, filter, mut found } => {
                for i in 1..found.len() {
                    found[i - 1].end_handle = found[i].start_handle.saturating_sub(1);
                }
                self.add_characteristics(service.uuid, &found);
                GattEvent::CharacteristicsDiscovered {
                    service: service.uuid,
                    result: Ok(filtered(found, &filter, |c| c.uuid)),
                }
            }
            Op::DiscoverDescriptors { service, characteristic, found } => {
                self.add_descriptors(service, characteristic.uuid, &found);
                GattEvent::DescriptorsDiscovered {
                    service,
                    characteristic: characteristic.uuid,
                    result: Ok(found),
                }
            }
            Op::Read { service, characteristic, value } => GattEvent::Read {
                service,
                characteristic: characteristic.uuid,
                result: Ok(value),
                is_notification: false,
            },
            _ => return Step::Done(None),
        };
        Step::Done(Some(event))
    }

    fn configure(&mut self, service: Uuid, characteristic: Uuid, config: Config, enable: bool)
        -> Result<()>
    {
        let c = self.characteristic(service, characteristic)?;
        let descriptor_uuid = match config {
            Config::Server => SERVER_CHARACTERISTIC_CONFIG_UUID,
            Config::Client => CLIENT_CHARACTERISTIC_CONFIG_UUID,
        };
        self.enqueue(read_by_type_request(c.start_handle, c.end_handle, descriptor_uuid),
            Op::ReadConfig {
                service,
                characteristic: c,
                config,
                enable,
            });
        Ok(())
    }

    fn service(&self, uuid: Uuid) -> Result<ServiceInfo> {
        self.services.iter().find(|s| s.uuid == uuid).copied()
            .ok_or_else(|| Error::new(ErrorKind::UnknownService,
                format!("unknown service {} on {}", uuid, self.handle)))
    }

    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<CharacteristicInfo> {
        self.service(service)?;
        self.characteristics.get(&service)
            .and_then(|cs| cs.iter().find(|c| c.uuid == uuid))
            .copied()
            .ok_or_else(|| Error::new(ErrorKind::UnknownCharacteristic,
                format!("unknown characteristic {} of service {}", uuid, service)))
    }

    fn descriptor(&self, service: Uuid, characteristic: Uuid, uuid: Uuid)
        -> Result<DescriptorInfo>
    {
        self.characteristic(service, characteristic)?;
        self.descriptors.get(&(service, characteristic))
            .and_then(|ds| ds.iter().find(|d| d.uuid == uuid))
            .copied()
            .ok_or_else(|| Error::new(ErrorKind::UnknownDescriptor,
                format!("unknown descriptor {} of characteristic {}", uuid, characteristic)))
    }

    fn prepare_write_request(&self, handle: u16, offset: usize, data: &[u8]) -> Vec<u8> {
        let end = (offset + self.mtu as usize - 5).min(data.len());
        let mut pdu = vec![PREPARE_WRITE_REQ];
        pdu.extend_from_slice(&handle.to_le_bytes());
        pdu.extend_from_slice(&(offset as u16).to_le_bytes());
        pdu.extend_from_slice(&data[offset..end]);
        pdu
    }

    fn enqueue(&mut self, pdu: Vec<u8>, op: Op) {
        if self.ended {
            debug!("dropping ATT request on ended session {}", self.handle);
            return;
        }
        let duplicate = !op.is_command()
            && self.current.iter().chain(self.queue.iter())
                .any(|t| t.pdu == pdu && t.op == op);
        if duplicate {
            trace!("ATT request already pending on {}: {}", self.handle, Hex(&pdu));
            return;
        }
        self.queue.push_back(Transaction { pdu, op });
        if self.current.is_none() {
            self.send_next();
        }
    }

    fn send_next(&mut self) {
        while let Some(tr) = self.queue.pop_front() {
            self.send_pdu(tr.pdu.clone());
            if !tr.op.is_command() {
                self.current = Some(tr);
                return;
            }
            let event = match tr.op {
                Op::WriteCommand { service, characteristic } =>
                    GattEvent::Write { service, characteristic, result: Ok(()) },
                Op::WriteHandle { handle, .. } => GattEvent::HandleWrite { handle, result: Ok(()) },
                _ => continue,
            };
            self.events.push(event);
        }
    }

    fn send_pdu(&mut self, pdu: Vec<u8>) {
        trace!("ATT out on {}: {}", self.handle, Hex(&pdu));
        self.outbox.push(pdu);
    }
}

fn config_event(config: Config, service: Uuid, characteristic: Uuid, result: Result<bool>)
    -> GattEvent
{
    match config {
        Config::Server => GattEvent::Broadcast { service, characteristic, result },
        Config::Client => GattEvent::Notify { service, characteristic, result },
    }
}

fn is_request(opcode: u8) -> bool {
    match opcode {
        0x04 | 0x06 | 0x08 | 0x0a | 0x0c | 0x0e | 0x10 | 0x12 | 0x16 | 0x18 | 0x20 => true,
        _ => false,
    }
}

fn check_value_len(data: &[u8]) -> Result<()> {
    if data.len() > MAX_ATTRIBUTE_VALUE_LEN {
        return Err(Error::new(ErrorKind::InvalidParameters,
            format!("value of {} bytes exceeds the maximum attribute length of {}",
                data.len(), MAX_ATTRIBUTE_VALUE_LEN)));
    }
    Ok(())
}

/// Iterates the fixed-length entries of a Read By Type or Read By Group Type response.
fn entries(data: &[u8]) -> impl Iterator<Item=&[u8]> {
    let len = data.get(1).copied().unwrap_or(0) as usize;
    let body = if len == 0 { &[][..] } else { data.get(2..).unwrap_or(&[]) };
    body.chunks_exact(len.max(1))
}

fn filtered<T>(items: Vec<T>, filter: &[Uuid], uuid: impl Fn(&T) -> Uuid) -> Vec<T> {
    if filter.is_empty() {
        items
    } else {
        items.into_iter().filter(|v| filter.contains(&uuid(v))).collect()
    }
}

fn merge_by_uuid<T>(list: &mut Vec<T>, item: T, uuid: impl Fn(&T) -> Uuid) {
    match list.iter_mut().find(|v| uuid(v) == uuid(&item)) {
        Some(v) => *v = item,
        None => list.push(item),
    }
}

fn read_by_group_request(start: u16, end: u16, group_type: u16) -> Vec<u8> {
    let mut r = vec![READ_BY_GROUP_REQ];
    r.extend_from_slice(&start.to_le_bytes());
    r.extend_from_slice(&end.to_le_bytes());
    r.extend_from_slice(&group_type.to_le_bytes());
    r
}

fn read_by_type_request(start: u16, end: u16, attr_type: u16) -> Vec<u8> {
    let mut r = vec![READ_BY_TYPE_REQ];
    r.extend_from_slice(&start.to_le_bytes());
    r.extend_from_slice(&end.to_le_bytes());
    r.extend_from_slice(&attr_type.to_le_bytes());
    r
}

fn find_info_request(start: u16, end: u16) -> Vec<u8> {
    let mut r = vec![FIND_INFO_REQ];
    r.extend_from_slice(&start.to_le_bytes());
    r.extend_from_slice(&end.to_le_bytes());
    r
}

fn read_request(handle: u16) -> Vec<u8> {
    let mut r = vec![READ_REQ];
    r.extend_from_slice(&handle.to_le_bytes());
    r
}

fn write_pdu(opcode: u8, handle: u16, data: &[u8]) -> Vec<u8> {
    let mut r = Vec::with_capacity(3 + data.len());
    r.push(opcode);
    r.extend_from_slice(&handle.to_le_bytes());
    r.extend_from_slice(data);
    r
}
