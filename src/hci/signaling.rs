use log::*;

use crate::hci::ConnectionParameters;
use crate::util::{Hex, read_u16_le};

const COMMAND_REJECT: u8 = 0x01;
const CONNECTION_PARAMETER_UPDATE_REQUEST: u8 = 0x12;
const CONNECTION_PARAMETER_UPDATE_RESPONSE: u8 = 0x13;

const REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
const PARAMETERS_ACCEPTED: u16 = 0x0000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SignalingAction {
    /// Frame to send back on the signaling channel.
    Reply(Vec<u8>),
    /// Parameters the peer asked for, to apply with a LE Connection Update.
    UpdateConnection(ConnectionParameters),
}

/// LE signaling channel of one connection.
#[derive(Debug)]
pub struct Signaling {
    handle: u16,
    ended: bool,
}

impl Signaling {
    pub fn new(handle: u16) -> Self {
        Self {
            handle,
            ended: false,
        }
    }

    pub fn end(&mut self) {
        self.ended = true;
    }

    pub fn on_data(&mut self, data: &[u8]) -> Vec<SignalingAction> {
        if self.ended || data.len() < 4 {
            return Vec::new();
        }
        let code = data[0];
        let identifier = data[1];
        let len = read_u16_le(data, 2).unwrap_or(0) as usize;
        let payload = &data[4..];
        if payload.len() < len {
            warn!("truncated signaling command on {}: {}", self.handle, Hex(data));
            return Vec::new();
        }
        let payload = &payload[..len];

        match code {
            CONNECTION_PARAMETER_UPDATE_REQUEST => {
                let field = |i| read_u16_le(payload, i);
                let params = match (field(0), field(2), field(4), field(6)) {
                    (Some(min_interval), Some(max_interval), Some(latency), Some(supervision_timeout)) =>
                        ConnectionParameters { min_interval, max_interval, latency, supervision_timeout },
                    _ => {
                        warn!("malformed connection parameter update request: {}", Hex(data));
                        return vec![SignalingAction::Reply(reject(identifier))];
                    }
                };
                debug!("connection {} parameter update request: {:?}", self.handle, params);
                let mut reply = vec![CONNECTION_PARAMETER_UPDATE_RESPONSE, identifier, 0x02, 0x00];
                reply.extend_from_slice(&PARAMETERS_ACCEPTED.to_le_bytes());
                vec![
                    SignalingAction::Reply(reply),
                    SignalingAction::UpdateConnection(params),
                ]
            }
            COMMAND_REJECT | CONNECTION_PARAMETER_UPDATE_RESPONSE => {
                debug!("ignoring signaling code 0x{:02x} on {}", code, self.handle);
                Vec::new()
            }
            _ => {
                warn!("unsupported signaling code 0x{:02x} on {}", code, self.handle);
                vec![SignalingAction::Reply(reject(identifier))]
            }
        }
    }
}

fn reject(identifier: u8) -> Vec<u8> {
    let mut r = vec![COMMAND_REJECT, identifier, 0x02, 0x00];
    r.extend_from_slice(&REJECT_NOT_UNDERSTOOD.to_le_bytes());
    r
}
