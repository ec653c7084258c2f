//! Security Manager Protocol, LE legacy pairing as initiator.

use log::*;

use crate::error::*;
use crate::hci::{Address, AddressType};
use crate::hci::crypto;
use crate::util::Hex;

const PAIRING_REQUEST: u8 = 0x01;
const PAIRING_RESPONSE: u8 = 0x02;
const PAIRING_CONFIRM: u8 = 0x03;
const PAIRING_RANDOM: u8 = 0x04;
const PAIRING_FAILED: u8 = 0x05;
const ENCRYPT_INFO: u8 = 0x06;
const MASTER_IDENT: u8 = 0x07;
const SECURITY_REQUEST: u8 = 0x0b;

const OOB_YES: u8 = 0x01;

const IO_DISPLAY_ONLY: u8 = 0x00;
const IO_DISPLAY_YES_NO: u8 = 0x01;
const IO_KEYBOARD_ONLY: u8 = 0x02;
const IO_NO_INPUT_NO_OUTPUT: u8 = 0x03;

/// Bonding, no MITM protection.
const AUTH_REQ: u8 = 0x01;
const MAX_KEY_SIZE: u8 = 16;

const FAILED_CONFIRM_VALUE: u8 = 0x04;
const FAILED_AUTH_REQUIREMENTS: u8 = 0x03;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthType {
    Legacy,
    SecureConnections,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssociationModel {
    JustWorks,
    PasskeyEntry,
    OutOfBand,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum PairingState {
    Idle,
    Requested,
    Responded,
    Confirmed,
    Randomed,
    StkDerived,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SmpEvent {
    /// Short-term key derived, link encryption can be started with it.
    Stk([u8; 16]),
    Fail,
    /// The passkey association model was selected and a passkey must be supplied.
    PasskeyRequested,
    Ltk([u8; 16]),
    MasterIdent {
        ediv: [u8; 2],
        rand: [u8; 8],
    },
    End,
}

/// Pairing session of one connection.
///
/// PDUs to send are queued and must be drained with [`take_outbox`](#method.take_outbox)
/// after each call.
#[derive(Debug)]
pub struct Smp {
    iat: u8,
    ia: [u8; 6],
    rat: u8,
    ra: [u8; 6],
    passkey_entry: bool,
    state: PairingState,
    preq: [u8; 7],
    pres: [u8; 7],
    key_size: u8,
    auth_type: Option<AuthType>,
    model: Option<AssociationModel>,
    tk: Option<[u8; 16]>,
    r: [u8; 16],
    pcnf: Option<[u8; 16]>,
    recovery_attempted: bool,
    outbox: Vec<Vec<u8>>,
}

impl Smp {
    /// `passkey_entry` announces keyboard input capability to the peer.
    pub fn new(local_address_type: AddressType, local_address: Address,
        remote_address_type: AddressType, remote_address: Address, passkey_entry: bool) -> Self
    {
        Self {
            iat: local_address_type.as_u8(),
            ia: local_address.to_le_bytes(),
            rat: remote_address_type.as_u8(),
            ra: remote_address.to_le_bytes(),
            passkey_entry,
            state: PairingState::Idle,
            preq: [0; 7],
            pres: [0; 7],
            key_size: MAX_KEY_SIZE,
            auth_type: None,
            model: None,
            tk: None,
            r: [0; 16],
            pcnf: None,
            recovery_attempted: false,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn auth_type(&self) -> Option<AuthType> {
        self.auth_type
    }

    pub fn association_model(&self) -> Option<AssociationModel> {
        self.model
    }

    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::replace(&mut self.outbox, Vec::new())
    }

    pub fn send_pairing_request(&mut self) {
        self.auth_type = None;
        self.model = None;
        self.tk = None;
        self.pcnf = None;
        self.key_size = MAX_KEY_SIZE;

        self.preq = [
            PAIRING_REQUEST,
            if self.passkey_entry { IO_KEYBOARD_ONLY } else { IO_DISPLAY_YES_NO },
            0x00, // OOB data not present
            AUTH_REQ,
            MAX_KEY_SIZE,
            0x00, // initiator key distribution: none
            0x01, // responder key distribution: EncKey
        ];
        self.state = PairingState::Requested;
        self.write(self.preq.to_vec());
    }

    /// Handles a PDU received on the security channel.
    pub fn on_data(&mut self, data: &[u8]) -> Option<SmpEvent> {
        let code = *data.first()?;
        match code {
            PAIRING_RESPONSE => self.on_pairing_response(data),
            PAIRING_CONFIRM => self.on_pairing_confirm(data),
            PAIRING_RANDOM => self.on_pairing_random(data),
            PAIRING_FAILED => self.on_pairing_failed(data),
            ENCRYPT_INFO => self.on_encrypt_info(data),
            MASTER_IDENT => self.on_master_ident(data),
            SECURITY_REQUEST => {
                debug!("security request from peer");
                self.send_pairing_request();
                None
            }
            _ => {
                warn!("unknown SMP code 0x{:02x}: {}", code, Hex(data));
                None
            }
        }
    }

    /// Continues a passkey entry pairing.
    pub fn provide_passkey(&mut self, passkey: u32) -> Result<()> {
        if self.state != PairingState::Responded
            || self.model != Some(AssociationModel::PasskeyEntry)
            || self.tk.is_some()
        {
            return Err(Error::new(ErrorKind::Protocol, "no passkey is awaited"));
        }
        if passkey > 999_999 {
            return Err(Error::new(ErrorKind::InvalidParameters,
                format!("passkey {} is out of range", passkey)));
        }
        let mut tk = [0; 16];
        tk[..4].copy_from_slice(&passkey.to_le_bytes());
        self.send_confirm(tk);
        Ok(())
    }

    /// Ends the session when the link goes away.
    pub fn end(&mut self) -> SmpEvent {
        self.outbox.clear();
        SmpEvent::End
    }

    fn on_pairing_response(&mut self, data: &[u8]) -> Option<SmpEvent> {
        if self.state != PairingState::Requested {
            warn!("unexpected pairing response in state {:?}", self.state);
            return None;
        }
        if data.len() < 7 {
            warn!("pairing response too short: {}", Hex(data));
            return None;
        }
        self.pres.copy_from_slice(&data[..7]);
        self.state = PairingState::Responded;
        self.key_size = self.preq[4].min(self.pres[4]);

        let (auth_type, model) = identify_authentication_method(&self.preq, &self.pres);
        self.auth_type = Some(auth_type);
        self.model = model;

        match (auth_type, model) {
            (AuthType::SecureConnections, _) => {
                warn!("LE Secure Connections pairing is not supported");
                None
            }
            (AuthType::Legacy, Some(AssociationModel::JustWorks)) => {
                self.send_confirm([0; 16]);
                None
            }
            (AuthType::Legacy, Some(AssociationModel::PasskeyEntry)) => {
                if self.passkey_entry {
                    Some(SmpEvent::PasskeyRequested)
                } else {
                    warn!("passkey entry pairing selected but no passkey handler is set");
                    None
                }
            }
            (AuthType::Legacy, Some(AssociationModel::OutOfBand)) => {
                warn!("out of band pairing is not supported");
                None
            }
            (AuthType::Legacy, None) => None,
        }
    }

    fn send_confirm(&mut self, tk: [u8; 16]) {
        self.r = crypto::r();
        let confirm = crypto::c1(&tk, &self.r, &self.pres, &self.preq,
            self.iat, &self.ia, self.rat, &self.ra);
        self.tk = Some(tk);
        self.write(pdu(PAIRING_CONFIRM, &confirm));
    }

    fn on_pairing_confirm(&mut self, data: &[u8]) -> Option<SmpEvent> {
        if self.tk.is_none() {
            warn!("pairing confirm received before local confirm was sent");
            return None;
        }
        let mut pcnf = [0; 16];
        if !copy_value(&mut pcnf, data) {
            warn!("pairing confirm too short: {}", Hex(data));
            return None;
        }
        self.pcnf = Some(pcnf);
        self.state = PairingState::Confirmed;

        let r = self.r;
        self.write(pdu(PAIRING_RANDOM, &r));
        self.state = PairingState::Randomed;
        None
    }

    fn on_pairing_random(&mut self, data: &[u8]) -> Option<SmpEvent> {
        if self.state != PairingState::Randomed {
            warn!("unexpected pairing random in state {:?}", self.state);
            return None;
        }
        let (tk, pcnf) = match (self.tk, self.pcnf) {
            (Some(tk), Some(pcnf)) => (tk, pcnf),
            _ => {
                warn!("pairing random received before pairing confirm");
                return None;
            }
        };
        let mut peer_r = [0; 16];
        if !copy_value(&mut peer_r, data) {
            warn!("pairing random too short: {}", Hex(data));
            return None;
        }

        let expected = crypto::c1(&tk, &peer_r, &self.pres, &self.preq,
            self.iat, &self.ia, self.rat, &self.ra);
        if expected == pcnf {
            let stk = crypto::s1(&tk, &peer_r, &self.r);
            self.state = PairingState::StkDerived;
            Some(SmpEvent::Stk(crypto::mask_key(&stk, self.key_size)))
        } else {
            warn!("pairing confirm value mismatch");
            self.write(vec![PAIRING_RANDOM, PAIRING_CONFIRM]);
            self.state = PairingState::Failed;
            Some(SmpEvent::Fail)
        }
    }

    fn on_pairing_failed(&mut self, data: &[u8]) -> Option<SmpEvent> {
        let reason = data.get(1).copied().unwrap_or(0);
        if reason == FAILED_AUTH_REQUIREMENTS && !self.recovery_attempted {
            debug!("pairing failed on authentication requirements, retrying once");
            self.recovery_attempted = true;
            self.send_pairing_request();
            return None;
        }
        if reason == FAILED_CONFIRM_VALUE {
            debug!("peer rejected our confirm value");
        }
        warn!("pairing failed, reason 0x{:02x}", reason);
        self.state = PairingState::Failed;
        Some(SmpEvent::Fail)
    }

    fn on_encrypt_info(&mut self, data: &[u8]) -> Option<SmpEvent> {
        let mut ltk = [0; 16];
        if !copy_value(&mut ltk, data) {
            warn!("encryption information too short: {}", Hex(data));
            return None;
        }
        Some(SmpEvent::Ltk(crypto::mask_key(&ltk, self.key_size)))
    }

    fn on_master_ident(&mut self, data: &[u8]) -> Option<SmpEvent> {
        if data.len() < 11 {
            warn!("master identification too short: {}", Hex(data));
            return None;
        }
        let mut ediv = [0; 2];
        ediv.copy_from_slice(&data[1..3]);
        let mut rand = [0; 8];
        rand.copy_from_slice(&data[3..11]);
        Some(SmpEvent::MasterIdent { ediv, rand })
    }

    fn write(&mut self, data: Vec<u8>) {
        self.outbox.push(data);
    }
}

/// Selects the authentication type and, for legacy pairing, the association model.
pub fn identify_authentication_method(preq: &[u8; 7], pres: &[u8; 7])
    -> (AuthType, Option<AssociationModel>)
{
    let mitm = |v: &[u8; 7]| (v[3] >> 2) & 1 == 1;
    let lesc = |v: &[u8; 7]| (v[3] >> 3) & 1 == 1;

    if lesc(preq) && lesc(pres) {
        return (AuthType::SecureConnections, None);
    }

    let model = if preq[2] == OOB_YES && pres[2] == OOB_YES {
        AssociationModel::OutOfBand
    } else if !mitm(preq) && !mitm(pres) {
        AssociationModel::JustWorks
    } else {
        io_capabilities_model(preq[1], pres[1])
    };
    (AuthType::Legacy, Some(model))
}

fn io_capabilities_model(req_io: u8, res_io: u8) -> AssociationModel {
    if req_io == IO_NO_INPUT_NO_OUTPUT || res_io == IO_NO_INPUT_NO_OUTPUT {
        AssociationModel::JustWorks
    } else if req_io == IO_DISPLAY_ONLY && res_io == IO_DISPLAY_ONLY {
        AssociationModel::JustWorks
    } else if req_io == IO_DISPLAY_YES_NO || res_io == IO_DISPLAY_YES_NO {
        AssociationModel::JustWorks
    } else {
        AssociationModel::PasskeyEntry
    }
}

fn pdu(code: u8, value: &[u8; 16]) -> Vec<u8> {
    let mut r = Vec::with_capacity(17);
    r.push(code);
    r.extend_from_slice(value);
    r
}

fn copy_value(dst: &mut [u8; 16], data: &[u8]) -> bool {
    match data.get(1..17) {
        Some(v) => {
            dst.copy_from_slice(v);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn smp(passkey_entry: bool) -> Smp {
        Smp::new(AddressType::Public, Address::new([0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6]),
            AddressType::Random, Address::new([0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6]),
            passkey_entry)
    }

    /// Plays the responder side of legacy pairing with the given TK.
    struct Peer {
        tk: [u8; 16],
        r: [u8; 16],
        pres: [u8; 7],
    }

    impl Peer {
        fn confirm(&self, initiator: &Smp) -> Vec<u8> {
            pdu(PAIRING_CONFIRM, &crypto::c1(&self.tk, &self.r, &self.pres, &initiator.preq,
                initiator.iat, &initiator.ia, initiator.rat, &initiator.ra))
        }
    }

    #[test]
    fn pairing_request_layout() {
        let mut s = smp(false);
        s.send_pairing_request();
        assert_eq!(s.take_outbox(), vec![vec![0x01, 0x01, 0x00, 0x01, 0x10, 0x00, 0x01]]);
        assert_eq!(s.state(), PairingState::Requested);

        let mut s = smp(true);
        s.send_pairing_request();
        assert_eq!(s.take_outbox()[0][1], IO_KEYBOARD_ONLY);
    }

    #[test]
    fn association_models() {
        let req = |io: u8, oob: u8, auth: u8| [0x01, io, oob, auth, 16, 0, 1];
        let res = |io: u8, oob: u8, auth: u8| [0x02, io, oob, auth, 16, 0, 1];

        assert_eq!(identify_authentication_method(&req(1, 0, 0x01), &res(4, 0, 0x01)),
            (AuthType::Legacy, Some(AssociationModel::JustWorks)));
        assert_eq!(identify_authentication_method(&req(1, 1, 0x05), &res(4, 1, 0x05)),
            (AuthType::Legacy, Some(AssociationModel::OutOfBand)));
        assert_eq!(identify_authentication_method(&req(2, 0, 0x01), &res(4, 0, 0x05)),
            (AuthType::Legacy, Some(AssociationModel::PasskeyEntry)));
        assert_eq!(identify_authentication_method(&req(2, 0, 0x01), &res(3, 0, 0x05)),
            (AuthType::Legacy, Some(AssociationModel::JustWorks)));
        assert_eq!(identify_authentication_method(&req(0, 0, 0x05), &res(0, 0, 0x05)),
            (AuthType::Legacy, Some(AssociationModel::JustWorks)));
        assert_eq!(identify_authentication_method(&req(2, 0, 0x05), &res(1, 0, 0x05)),
            (AuthType::Legacy, Some(AssociationModel::JustWorks)));
        assert_eq!(identify_authentication_method(&req(2, 0, 0x09), &res(2, 0, 0x0d)),
            (AuthType::SecureConnections, None));
    }

    #[test]
    fn just_works() {
        let mut s = smp(false);
        s.send_pairing_request();
        s.take_outbox();

        let peer = Peer { tk: [0; 16], r: [0x55; 16], pres: [0x02, 0x03, 0x00, 0x01, 0x10, 0x00, 0x01] };
        assert_eq!(s.on_data(&peer.pres), None);
        assert_eq!(s.association_model(), Some(AssociationModel::JustWorks));
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][0], PAIRING_CONFIRM);
        assert_eq!(out[0].len(), 17);

        assert_eq!(s.on_data(&peer.confirm(&s)), None);
        let out = s.take_outbox();
        assert_eq!(out, vec![pdu(PAIRING_RANDOM, &s.r)]);
        assert_eq!(s.state(), PairingState::Randomed);

        let ev = s.on_data(&pdu(PAIRING_RANDOM, &peer.r));
        assert_eq!(ev, Some(SmpEvent::Stk(crypto::s1(&[0; 16], &peer.r, &s.r))));
        assert_eq!(s.state(), PairingState::StkDerived);
    }

    #[test]
    fn passkey_entry() {
        let mut s = smp(true);
        s.send_pairing_request();
        s.take_outbox();

        let mut tk = [0; 16];
        tk[..4].copy_from_slice(&123456u32.to_le_bytes());
        let peer = Peer { tk, r: [0x11; 16], pres: [0x02, 0x00, 0x00, 0x05, 0x07, 0x00, 0x01] };

        assert_eq!(s.on_data(&peer.pres), Some(SmpEvent::PasskeyRequested));
        assert!(s.take_outbox().is_empty());
        assert!(s.provide_passkey(1_000_000).is_err());
        s.provide_passkey(123456).unwrap();
        assert!(s.provide_passkey(123456).is_err());
        assert_eq!(s.take_outbox().len(), 1);

        s.on_data(&peer.confirm(&s));
        s.take_outbox();
        match s.on_data(&pdu(PAIRING_RANDOM, &peer.r)) {
            Some(SmpEvent::Stk(stk)) => {
                let full = crypto::s1(&tk, &peer.r, &s.r);
                assert_eq!(stk[..7], full[..7]);
                assert_eq!(stk[7..], [0; 9]);
            }
            ev => panic!("{:?}", ev),
        }

        assert_eq!(s.on_data(&pdu(PAIRING_RANDOM, &peer.r)), None);
        assert_eq!(s.state(), PairingState::StkDerived);
    }

    #[test]
    fn confirm_mismatch() {
        let mut s = smp(false);
        s.send_pairing_request();
        s.on_data(&[0x02, 0x03, 0x00, 0x01, 0x10, 0x00, 0x01]);
        s.on_data(&pdu(PAIRING_CONFIRM, &[0xee; 16]));
        s.take_outbox();

        assert_eq!(s.on_data(&pdu(PAIRING_RANDOM, &[0x01; 16])), Some(SmpEvent::Fail));
        assert_eq!(s.take_outbox(), vec![vec![0x04, 0x03]]);
        assert_eq!(s.state(), PairingState::Failed);
    }

    #[test]
    fn auth_requirements_failure_retried_once() {
        let mut s = smp(false);
        s.send_pairing_request();
        s.take_outbox();

        assert_eq!(s.on_data(&[PAIRING_FAILED, FAILED_AUTH_REQUIREMENTS]), None);
        assert_eq!(s.take_outbox().len(), 1);
        assert_eq!(s.on_data(&[PAIRING_FAILED, FAILED_AUTH_REQUIREMENTS]), Some(SmpEvent::Fail));
        assert!(s.take_outbox().is_empty());
    }

    #[test]
    fn security_request_starts_pairing() {
        let mut s = smp(false);
        assert_eq!(s.on_data(&[SECURITY_REQUEST, 0x01]), None);
        assert_eq!(s.take_outbox()[0][0], PAIRING_REQUEST);
    }

    #[test]
    fn key_distribution() {
        let mut s = smp(false);
        s.send_pairing_request();
        s.on_data(&[0x02, 0x03, 0x00, 0x01, 0x08, 0x00, 0x01]);

        let mut ei = vec![ENCRYPT_INFO];
        ei.extend_from_slice(&[0xab; 16]);
        let mut exp = [0; 16];
        exp[..8].copy_from_slice(&[0xab; 8]);
        assert_eq!(s.on_data(&ei), Some(SmpEvent::Ltk(exp)));

        let mi = [MASTER_IDENT, 0x01, 0x02, 1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(s.on_data(&mi), Some(SmpEvent::MasterIdent {
            ediv: [0x01, 0x02],
            rand: [1, 2, 3, 4, 5, 6, 7, 8],
        }));
    }

    #[test]
    fn malformed_pdus_are_ignored() {
        let mut s = smp(false);
        assert_eq!(s.on_data(&[]), None);
        assert_eq!(s.on_data(&[0x7f]), None);
        assert_eq!(s.on_data(&[PAIRING_RANDOM, 1, 2]), None);
        assert_eq!(s.on_data(&[PAIRING_RESPONSE, 1]), None);
        assert_eq!(s.on_data(&[MASTER_IDENT, 1]), None);
        assert_eq!(s.state(), PairingState::Idle);
    }
}
