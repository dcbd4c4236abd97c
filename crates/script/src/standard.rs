//! Standard script classification and relay policy templates.

use crate::interpreter::{is_push_only, push_only_items};
use crate::sigops::legacy_sigops;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    P2Wpkh,
    P2Wsh,
    Multisig,
    NullData,
    NonStandard,
}

const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;
const OP_3: u8 = 0x53;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Largest OP_RETURN payload relayed by default.
pub const MAX_OP_RETURN_RELAY: usize = 83;
/// Largest scriptSig a standard input may carry.
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;
/// Sigop allowance for a standard P2SH redeem script.
pub const MAX_P2SH_SIGOPS: u32 = 15;

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2wpkh(script) {
        ScriptType::P2Wpkh
    } else if is_p2wsh(script) {
        ScriptType::P2Wsh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else if is_null_data(script) {
        ScriptType::NullData
    } else if is_standard_multisig(script) {
        ScriptType::Multisig
    } else {
        ScriptType::NonStandard
    }
}

/// Output template standardness: the relay policy side of rule 3.
pub fn is_standard_output(script: &[u8]) -> bool {
    classify_script_pubkey(script) != ScriptType::NonStandard
}

/// Input standardness relative to the output being spent: push-only,
/// bounded scriptSig, and a bounded redeem script for P2SH.
pub fn are_inputs_standard(script_sig: &[u8], prev_script_pubkey: &[u8]) -> bool {
    if script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
        return false;
    }
    if !is_push_only(script_sig) {
        return false;
    }
    if is_p2sh(prev_script_pubkey) {
        let Some(items) = push_only_items(script_sig) else {
            return false;
        };
        let Some(redeem) = items.last() else {
            return false;
        };
        if legacy_sigops(redeem, true) > MAX_P2SH_SIGOPS {
            return false;
        }
    }
    true
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2wpkh(script: &[u8]) -> bool {
    script.len() == 22 && script[0] == OP_0 && script[1] == 0x14
}

fn is_p2wsh(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_0 && script[1] == 0x20
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

fn is_null_data(script: &[u8]) -> bool {
    if script.first() != Some(&OP_RETURN) {
        return false;
    }
    if script.len() > MAX_OP_RETURN_RELAY {
        return false;
    }
    is_push_only(&script[1..])
}

/// Bare multisig up to 3-of-3 with well-formed key pushes.
fn is_standard_multisig(script: &[u8]) -> bool {
    if script.len() < 3 || script[script.len() - 1] != OP_CHECKMULTISIG {
        return false;
    }
    let m_op = script[0];
    let n_op = script[script.len() - 2];
    if !(OP_1..=OP_3).contains(&m_op) || !(OP_1..=OP_3).contains(&n_op) {
        return false;
    }
    let m = (m_op - OP_1 + 1) as usize;
    let n = (n_op - OP_1 + 1) as usize;
    if m > n {
        return false;
    }

    let mut cursor = 1usize;
    let mut keys = 0usize;
    while cursor < script.len() - 2 {
        let len = script[cursor] as usize;
        if !(33..=65).contains(&len) {
            return false;
        }
        cursor += 1;
        if cursor + len > script.len() - 2 {
            return false;
        }
        cursor += len;
        keys += 1;
    }
    keys == n
}

/// Extracts the hash160 a P2PKH or P2SH output pays, used by the address
/// indexes.
pub fn extract_address_hash(script: &[u8]) -> Option<(ScriptType, [u8; 20])> {
    if is_p2pkh(script) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        return Some((ScriptType::P2Pkh, hash));
    }
    if is_p2sh(script) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        return Some((ScriptType::P2Sh, hash));
    }
    None
}

/// Unspendable outputs need no coin entry and are skipped on disconnect.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
        || script.len() > smartd_consensus::constants::MAX_SCRIPT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh(tag: u8) -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn classifies_common_templates() {
        assert_eq!(classify_script_pubkey(&p2pkh(1)), ScriptType::P2Pkh);

        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[2u8; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(classify_script_pubkey(&p2sh), ScriptType::P2Sh);

        let mut p2pk = vec![33u8];
        p2pk.extend_from_slice(&[3u8; 33]);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(classify_script_pubkey(&p2pk), ScriptType::P2Pk);

        let nulldata = vec![OP_RETURN, 0x04, 0xde, 0xad, 0xbe, 0xef];
        assert_eq!(classify_script_pubkey(&nulldata), ScriptType::NullData);

        let mut p2wpkh = vec![OP_0, 0x14];
        p2wpkh.extend_from_slice(&[4u8; 20]);
        assert_eq!(classify_script_pubkey(&p2wpkh), ScriptType::P2Wpkh);

        let mut p2wsh = vec![OP_0, 0x20];
        p2wsh.extend_from_slice(&[5u8; 32]);
        assert_eq!(classify_script_pubkey(&p2wsh), ScriptType::P2Wsh);

        assert_eq!(classify_script_pubkey(&[0x99]), ScriptType::NonStandard);
    }

    #[test]
    fn oversized_op_return_is_nonstandard() {
        let mut script = vec![OP_RETURN, 0x4c, 90];
        script.extend_from_slice(&[0u8; 90]);
        assert_eq!(classify_script_pubkey(&script), ScriptType::NonStandard);
    }

    #[test]
    fn bare_multisig_within_limits() {
        let mut script = vec![OP_1];
        script.push(33);
        script.extend_from_slice(&[2u8; 33]);
        script.push(33);
        script.extend_from_slice(&[3u8; 33]);
        script.push(OP_1 + 1);
        script.push(OP_CHECKMULTISIG);
        assert_eq!(classify_script_pubkey(&script), ScriptType::Multisig);
    }

    #[test]
    fn extracts_p2pkh_hash() {
        let (kind, hash) = extract_address_hash(&p2pkh(7)).expect("address");
        assert_eq!(kind, ScriptType::P2Pkh);
        assert_eq!(hash, [7u8; 20]);
    }

    #[test]
    fn nonstandard_scriptsig_rejected() {
        let prev = p2pkh(1);
        assert!(are_inputs_standard(&[0x01, 0xaa], &prev));
        // OP_DUP is not a push.
        assert!(!are_inputs_standard(&[OP_DUP], &prev));
    }
}
