use log::*;

use crate::error::*;
use crate::hci::{SMP_CID, Transport};
use crate::hci::smp::{Smp, SmpEvent};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AclSignal {
    /// Payload for a channel other than the security channel.
    Data {
        cid: u16,
        data: Vec<u8>,
    },
    Encrypt(bool),
    EncryptFail,
    PasskeyRequested,
    Ltk([u8; 16]),
    MasterIdent {
        ediv: [u8; 2],
        rand: [u8; 8],
    },
    End,
}

/// Data channel of one connection, demultiplexed by L2CAP channel id.
#[derive(Debug)]
pub struct AclStream {
    handle: u16,
    smp: Smp,
    ended: bool,
}

impl AclStream {
    pub fn new(handle: u16, smp: Smp) -> Self {
        Self {
            handle,
            smp,
            ended: false,
        }
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn smp(&self) -> &Smp {
        &self.smp
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn write(&mut self, transport: &mut dyn Transport, cid: u16, data: Vec<u8>) {
        if self.ended {
            debug!("dropping write to cid 0x{:04x} on ended stream {}", cid, self.handle);
            return;
        }
        transport.write_acl_data(self.handle, cid, data);
    }

    /// Feeds an inbound payload. `None` signals the end of the stream.
    pub fn push(&mut self, transport: &mut dyn Transport, cid: u16, data: Option<Vec<u8>>)
        -> Option<AclSignal>
    {
        if self.ended {
            return None;
        }
        let data = match data {
            Some(v) => v,
            None => {
                self.ended = true;
                self.smp.end();
                return Some(AclSignal::End);
            }
        };
        if cid != SMP_CID {
            return Some(AclSignal::Data { cid, data });
        }
        let event = self.smp.on_data(&data);
        self.flush_smp(transport);
        match event? {
            SmpEvent::Stk(stk) => {
                transport.start_le_encryption(self.handle, [0; 8], [0; 2], stk);
                None
            }
            SmpEvent::Fail => Some(AclSignal::EncryptFail),
            SmpEvent::PasskeyRequested => Some(AclSignal::PasskeyRequested),
            SmpEvent::Ltk(ltk) => Some(AclSignal::Ltk(ltk)),
            SmpEvent::MasterIdent { ediv, rand } => Some(AclSignal::MasterIdent { ediv, rand }),
            SmpEvent::End => None,
        }
    }

    pub fn push_encrypt(&mut self, encrypt: bool) -> AclSignal {
        AclSignal::Encrypt(encrypt)
    }

    /// Starts pairing; link encryption follows once a key is derived.
    pub fn encrypt(&mut self, transport: &mut dyn Transport) {
        self.smp.send_pairing_request();
        self.flush_smp(transport);
    }

    pub fn provide_passkey(&mut self, transport: &mut dyn Transport, passkey: u32) -> Result<()> {
        self.smp.provide_passkey(passkey)?;
        self.flush_smp(transport);
        Ok(())
    }

    fn flush_smp(&mut self, transport: &mut dyn Transport) {
        for pdu in self.smp.take_outbox() {
            self.write(transport, SMP_CID, pdu);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::hci::{Address, AddressType, ATT_CID};
    use crate::hci::mock::*;
    use super::*;

    fn stream() -> AclStream {
        let smp = Smp::new(AddressType::Public, Address::new([1; 6]),
            AddressType::Public, Address::new([2; 6]), false);
        AclStream::new(0x40, smp)
    }

    #[test]
    fn routes_by_cid() {
        let mut t = MockTransport::new();
        let mut s = stream();
        assert_eq!(s.push(&mut t, ATT_CID, Some(vec![0x1b, 1, 0])),
            Some(AclSignal::Data { cid: ATT_CID, data: vec![0x1b, 1, 0] }));
        assert!(t.take().is_empty());

        assert_eq!(s.push(&mut t, SMP_CID, Some(vec![0x0b, 0x01])), None);
        assert_eq!(t.acl_writes(SMP_CID), vec![vec![0x01, 0x01, 0x00, 0x01, 0x10, 0x00, 0x01]]);
    }

    #[test]
    fn encrypt_sends_pairing_request() {
        let mut t = MockTransport::new();
        let mut s = stream();
        s.encrypt(&mut t);
        assert_eq!(t.take(), vec![Call::WriteAclData {
            handle: 0x40,
            cid: SMP_CID,
            data: vec![0x01, 0x01, 0x00, 0x01, 0x10, 0x00, 0x01],
        }]);
    }

    #[test]
    fn end_detaches() {
        let mut t = MockTransport::new();
        let mut s = stream();
        assert_eq!(s.push(&mut t, ATT_CID, None), Some(AclSignal::End));
        assert!(s.is_ended());
        assert_eq!(s.push(&mut t, ATT_CID, Some(vec![1])), None);
        assert_eq!(s.push(&mut t, SMP_CID, Some(vec![0x0b, 0x01])), None);
        s.write(&mut t, ATT_CID, vec![1]);
        assert!(t.take().is_empty());
    }

    #[test]
    fn pairing_failure_signals_encrypt_fail() {
        let mut t = MockTransport::new();
        let mut s = stream();
        s.encrypt(&mut t);
        assert_eq!(s.push(&mut t, SMP_CID, Some(vec![0x05, 0x08])), Some(AclSignal::EncryptFail));
        assert_eq!(s.push_encrypt(true), AclSignal::Encrypt(true));
    }
}
