//! AddressCodec: base58check validation and script-to-address derivation
//! for standard P2PKH/P2SH outputs.

use ripemd160::{Digest as RipemdDigest, Ripemd160};
use sha2::{Digest, Sha256};

/// Version byte table for a chain's P2PKH/P2SH address encoding.
#[derive(Debug, Clone, Copy)]
pub struct Network {
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
}

impl Network {
    pub const MAINNET: Network = Network {
        p2pkh_version: 0x00,
        p2sh_version: 0x05,
    };

    pub const TESTNET: Network = Network {
        p2pkh_version: 0x6f,
        p2sh_version: 0xc4,
    };

    pub fn from_chain_name(chain: &str) -> Network {
        match chain {
            "mainnet" => Network::MAINNET,
            _ => Network::TESTNET,
        }
    }

    fn recognized_versions(&self) -> [u8; 2] {
        [self.p2pkh_version, self.p2sh_version]
    }
}

fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

fn hash160(data: &[u8]) -> Vec<u8> {
    let sha = Sha256::digest(data);
    Ripemd160::digest(&sha).to_vec()
}

fn encode_versioned_hash(version: u8, hash: &[u8]) -> String {
    let mut payload = vec![version];
    payload.extend_from_slice(hash);
    let checksum = sha256d(&payload);
    payload.extend_from_slice(&checksum[0..4]);
    bs58::encode(payload).into_string()
}

/// Validate a base58check address string against this network's
/// recognized P2PKH/P2SH version bytes.
///
/// Mirrors the original's length pre-filter (`25 < len < 36`) before
/// attempting the more expensive base58 decode + checksum verification.
pub fn is_valid_address(network: Network, address: &str) -> bool {
    if address.len() <= 25 || address.len() >= 36 {
        return false;
    }

    let decoded = match bs58::decode(address).into_vec() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    if decoded.len() < 5 {
        return false;
    }

    let (payload, checksum) = decoded.split_at(decoded.len() - 4);
    if sha256d(payload)[0..4] != *checksum {
        return false;
    }

    network.recognized_versions().contains(&payload[0])
}

/// Derive the paying address from a locking script, returning `None` for
/// non-standard scripts (including empty scripts).
pub fn address_from_script(network: Network, script: &[u8]) -> Option<String> {
    if script.is_empty() {
        return None;
    }

    if is_p2pkh_script(script) {
        let hash = &script[3..23];
        return Some(encode_versioned_hash(network.p2pkh_version, hash));
    }

    if is_p2sh_script(script) {
        let hash = &script[2..22];
        return Some(encode_versioned_hash(network.p2sh_version, hash));
    }

    None
}

fn is_p2pkh_script(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == 0x76 // OP_DUP
        && script[1] == 0xa9 // OP_HASH160
        && script[2] == 0x14 // push 20 bytes
        && script[23] == 0x88 // OP_EQUALVERIFY
        && script[24] == 0xac // OP_CHECKSIG
}

fn is_p2sh_script(script: &[u8]) -> bool {
    script.len() == 23
        && script[0] == 0xa9 // OP_HASH160
        && script[1] == 0x14 // push 20 bytes
        && script[22] == 0x87 // OP_EQUAL
}

/// Hash a raw public key with sha256+ripemd160 (the payload that goes into
/// `encode_versioned_hash` for a P2PKH address derived directly from a
/// pubkey rather than from a script).
pub fn compute_pubkey_hash(pubkey: &[u8]) -> Vec<u8> {
    hash160(pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_script_roundtrips_through_address() {
        let hash = vec![0u8; 20];
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&hash);
        script.push(0x88);
        script.push(0xac);

        let addr = address_from_script(Network::TESTNET, &script).unwrap();
        assert!(is_valid_address(Network::TESTNET, &addr));
    }

    #[test]
    fn p2sh_script_roundtrips_through_address() {
        let hash = vec![1u8; 20];
        let mut script = vec![0xa9, 0x14];
        script.extend_from_slice(&hash);
        script.push(0x87);

        let addr = address_from_script(Network::TESTNET, &script).unwrap();
        assert!(is_valid_address(Network::TESTNET, &addr));
    }

    #[test]
    fn nonstandard_script_has_no_address() {
        assert!(address_from_script(Network::TESTNET, &[0x6a, 0x01, 0x02]).is_none());
        assert!(address_from_script(Network::TESTNET, &[]).is_none());
    }

    #[test]
    fn invalid_checksum_is_rejected() {
        let hash = vec![3u8; 20];
        let mut valid = encode_versioned_hash(Network::TESTNET.p2pkh_version, &hash);
        assert!(is_valid_address(Network::TESTNET, &valid));

        // Flip the last character to corrupt the checksum.
        let last = valid.pop().unwrap();
        let replacement = if last == '1' { '2' } else { '1' };
        valid.push(replacement);
        assert!(!is_valid_address(Network::TESTNET, &valid));
    }

    #[test]
    fn mainnet_address_rejected_against_testnet_network() {
        let hash = vec![2u8; 20];
        let mainnet_addr = encode_versioned_hash(Network::MAINNET.p2pkh_version, &hash);
        assert!(!is_valid_address(Network::TESTNET, &mainnet_addr));
        assert!(is_valid_address(Network::MAINNET, &mainnet_addr));
    }
}
