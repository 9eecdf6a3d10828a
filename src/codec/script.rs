use super::CodecError;
use crate::wallet::ScriptHash;

use bech32::Hrp;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a serialized block header.
pub const HEADER_SIZE: usize = 80;

/// Currency parameters needed to render addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
	/// Base58 version byte for pay-to-pubkey-hash addresses
	pub pubkey_hash_version: u8,
	/// Base58 version byte for pay-to-script-hash addresses
	pub script_hash_version: u8,
	/// Human readable part for segwit addresses
	pub bech32_hrp: String,
}

impl Default for NetworkParams {
	fn default() -> Self {
		Self {
			pubkey_hash_version: 0x00,
			script_hash_version: 0x05,
			bech32_hrp: "bc".to_string(),
		}
	}
}

/// Electrum scripthash: sha256 of the locking script, byte-reversed.
pub fn script_hash(script: &[u8]) -> ScriptHash {
	let mut digest = Sha256::digest(script).to_vec();
	digest.reverse();
	ScriptHash::new(hex::encode(digest))
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
	let sha = Sha256::digest(data);
	Ripemd160::digest(sha).into()
}

/// OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
	let mut script = Vec::with_capacity(25);
	script.extend_from_slice(&[0x76, 0xa9, 0x14]);
	script.extend_from_slice(pubkey_hash);
	script.extend_from_slice(&[0x88, 0xac]);
	script
}

/// OP_0 <20-byte program>
pub fn p2wpkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
	let mut script = Vec::with_capacity(22);
	script.extend_from_slice(&[0x00, 0x14]);
	script.extend_from_slice(pubkey_hash);
	script
}

/// OP_HASH160 <hash> OP_EQUAL
pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
	let mut script = Vec::with_capacity(23);
	script.extend_from_slice(&[0xa9, 0x14]);
	script.extend_from_slice(script_hash);
	script.push(0x87);
	script
}

pub fn encode_base58check(version: u8, hash: &[u8; 20]) -> String {
	let mut payload = Vec::with_capacity(21);
	payload.push(version);
	payload.extend_from_slice(hash);
	bs58::encode(payload).with_check().into_string()
}

pub fn encode_segwit_v0(hrp: &str, program: &[u8]) -> Result<String, CodecError> {
	let hrp = Hrp::parse(hrp)
		.map_err(|e| CodecError::AddressEncoding(format!("Invalid HRP {}: {}", hrp, e)))?;
	bech32::segwit::encode_v0(hrp, program)
		.map_err(|e| CodecError::AddressEncoding(format!("Failed to encode segwit address: {}", e)))
}

/// Reads the block timestamp (bytes 68..72, little endian) out of a hex
/// encoded header.
pub fn header_timestamp(header_hex: &str) -> Result<u32, CodecError> {
	let bytes = hex::decode(header_hex)?;
	if bytes.len() < HEADER_SIZE {
		return Err(CodecError::InvalidHeader(format!(
			"expected {} bytes, got {}",
			HEADER_SIZE,
			bytes.len()
		)));
	}
	let mut raw = [0u8; 4];
	raw.copy_from_slice(&bytes[68..72]);
	Ok(u32::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_script_hash_matches_electrum_docs() {
		// Example from the Electrum protocol documentation
		let script = hex::decode("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac").unwrap();
		assert_eq!(
			script_hash(&script).as_str(),
			"8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161"
		);
	}

	#[test]
	fn test_p2pkh_address_roundtrip_known_vector() {
		let hash: [u8; 20] = hex::decode("62e907b15cbf27d5425399ebf6f0fb50ebb88f18")
			.unwrap()
			.try_into()
			.unwrap();
		assert_eq!(
			encode_base58check(0x00, &hash),
			"1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"
		);
		assert_eq!(
			hex::encode(p2pkh_script(&hash)),
			"76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac"
		);
	}

	#[test]
	fn test_segwit_address_known_vector() {
		let program = hex::decode("751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
		assert_eq!(
			encode_segwit_v0("bc", &program).unwrap(),
			"bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
		);
	}

	#[test]
	fn test_header_timestamp() {
		// Bitcoin genesis block header
		let genesis = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
		assert_eq!(header_timestamp(genesis).unwrap(), 1231006505);
		assert!(header_timestamp("00").is_err());
	}
}
