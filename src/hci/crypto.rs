//! LE legacy pairing cryptographic toolbox.
//!
//! All values are little-endian, in the order they travel over the security channel.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::cipher::generic_array::GenericArray;
use rand::Rng;

/// Security function `e`: AES-128 of `data` with `key`.
pub fn e(key: &[u8; 16], data: &[u8; 16]) -> [u8; 16] {
    let mut k = *key;
    k.reverse();
    let mut block = *data;
    block.reverse();

    let cipher = Aes128::new(GenericArray::from_slice(&k));
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);

    let mut r: [u8; 16] = block.into();
    r.reverse();
    r
}

/// Random 128-bit pairing nonce.
pub fn r() -> [u8; 16] {
    let mut r = [0; 16];
    rand::thread_rng().fill(&mut r);
    r
}

/// Confirm value generation function `c1`.
///
/// `preq` and `pres` are the full 7-octet pairing request and response PDUs.
#[allow(clippy::too_many_arguments)]
pub fn c1(k: &[u8; 16], r: &[u8; 16], pres: &[u8], preq: &[u8], iat: u8, ia: &[u8; 6],
    rat: u8, ra: &[u8; 6]) -> [u8; 16]
{
    let mut p1 = [0; 16];
    p1[0] = iat;
    p1[1] = rat;
    copy_pdu(&mut p1[2..9], preq);
    copy_pdu(&mut p1[9..16], pres);

    let mut p2 = [0; 16];
    p2[..6].copy_from_slice(ra);
    p2[6..12].copy_from_slice(ia);

    let res = e(k, &xor(r, &p1));
    e(k, &xor(&res, &p2))
}

/// Key generation function `s1`.
pub fn s1(k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    let mut r = [0; 16];
    r[..8].copy_from_slice(&r2[..8]);
    r[8..].copy_from_slice(&r1[..8]);
    e(k, &r)
}

/// Keeps the first `key_size` octets of `key` and zeroes the rest.
pub fn mask_key(key: &[u8; 16], key_size: u8) -> [u8; 16] {
    let n = (key_size as usize).min(16);
    let mut r = [0; 16];
    r[..n].copy_from_slice(&key[..n]);
    r
}

fn copy_pdu(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn xor(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut r = [0; 16];
    for ((r, a), b) in r.iter_mut().zip(a).zip(b) {
        *r = a ^ b;
    }
    r
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use super::*;

    fn rev<const N: usize>(mut v: [u8; N]) -> [u8; N] {
        v.reverse();
        v
    }

    #[test]
    fn c1_vector() {
        let k = [0; 16];
        let r = rev(hex!("5783D52156AD6F0E6388274EC6702EE0"));
        let preq = rev(hex!("07071000000101"));
        let pres = rev(hex!("05000800000302"));
        let ia = rev(hex!("A1A2A3A4A5A6"));
        let ra = rev(hex!("B1B2B3B4B5B6"));

        let act = c1(&k, &r, &pres, &preq, 1, &ia, 0, &ra);
        assert_eq!(act, rev(hex!("1e1e3fef878988ead2a74dc5bef13b86")));
    }

    #[test]
    fn s1_vector() {
        let k = [0; 16];
        let r1 = rev(hex!("000F0E0D0C0B0A091122334455667788"));
        let r2 = rev(hex!("010203040506070899AABBCCDDEEFF00"));

        assert_eq!(s1(&k, &r1, &r2), rev(hex!("9a1fe1f0e8b0f49b5b4216ae796da062")));
    }

    #[test]
    fn key_masking() {
        let key = [0xff; 16];
        assert_eq!(mask_key(&key, 16), key);
        assert_eq!(mask_key(&key, 7), hex!("ffffffffffffff000000000000000000"));
        assert_eq!(mask_key(&key, 0), [0; 16]);
    }

    #[test]
    fn random_nonces_differ() {
        assert_ne!(r(), r());
    }
}
