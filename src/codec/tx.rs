use super::{CodecError, script_hash};
use crate::wallet::{OutPoint, ParsedTx, TxOutput, Txid};

use sha2::{Digest, Sha256};

/// Transaction codec interface consumed by the sync engine.
///
/// Implementations are injected at construction time so the engine stays
/// independent of any one currency's serialization rules.
pub trait TxCodec: Send + Sync {
	/// Extract the spent outpoints and the (scripthash, value) outputs.
	fn parse(&self, raw: &[u8]) -> Result<ParsedTx, CodecError>;

	/// Compute the transaction id of a raw transaction.
	fn txid(&self, raw: &[u8]) -> Result<Txid, CodecError>;
}

/// Codec for Bitcoin-style transactions, with or without segwit data.
#[derive(Debug, Clone, Default)]
pub struct BitcoinTxCodec;

struct Reader<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
		let end = self
			.pos
			.checked_add(n)
			.filter(|end| *end <= self.data.len())
			.ok_or(CodecError::UnexpectedEnd(self.pos))?;
		let slice = &self.data[self.pos..end];
		self.pos = end;
		Ok(slice)
	}

	fn peek(&self, offset: usize) -> Option<u8> {
		self.data.get(self.pos + offset).copied()
	}

	fn u8(&mut self) -> Result<u8, CodecError> {
		Ok(self.take(1)?[0])
	}

	fn u32_le(&mut self) -> Result<u32, CodecError> {
		let mut raw = [0u8; 4];
		raw.copy_from_slice(self.take(4)?);
		Ok(u32::from_le_bytes(raw))
	}

	fn u64_le(&mut self) -> Result<u64, CodecError> {
		let mut raw = [0u8; 8];
		raw.copy_from_slice(self.take(8)?);
		Ok(u64::from_le_bytes(raw))
	}

	fn varint(&mut self) -> Result<u64, CodecError> {
		match self.u8()? {
			0xfd => {
				let mut raw = [0u8; 2];
				raw.copy_from_slice(self.take(2)?);
				Ok(u16::from_le_bytes(raw) as u64)
			}
			0xfe => Ok(self.u32_le()? as u64),
			0xff => self.u64_le(),
			n => Ok(n as u64),
		}
	}

	fn var_bytes(&mut self) -> Result<&'a [u8], CodecError> {
		let len = self.varint()?;
		let len = usize::try_from(len).map_err(|_| CodecError::UnexpectedEnd(self.pos))?;
		self.take(len)
	}
}

/// Byte ranges of the parts that make up the legacy serialization.
struct Layout {
	parsed: ParsedTx,
	io_start: usize,
	io_end: usize,
	locktime_start: usize,
}

impl BitcoinTxCodec {
	pub fn new() -> Self {
		Self
	}

	fn layout(raw: &[u8]) -> Result<Layout, CodecError> {
		let mut reader = Reader::new(raw);
		reader.u32_le()?; // version

		let segwit = reader.peek(0) == Some(0x00) && reader.peek(1) == Some(0x01);
		if segwit {
			reader.take(2)?;
		}

		let io_start = reader.pos;
		let input_count = reader.varint()?;
		let mut inputs = Vec::new();
		for _ in 0..input_count {
			let mut prev_hash = reader.take(32)?.to_vec();
			prev_hash.reverse();
			let index = reader.u32_le()?;
			reader.var_bytes()?; // script_sig
			reader.u32_le()?; // sequence
			inputs.push(OutPoint {
				txid: Txid::new(hex::encode(prev_hash)),
				index,
			});
		}

		let output_count = reader.varint()?;
		let mut outputs = Vec::new();
		for _ in 0..output_count {
			let value = reader.u64_le()?;
			let script = reader.var_bytes()?;
			outputs.push(TxOutput {
				script_hash: script_hash(script),
				value,
			});
		}
		let io_end = reader.pos;

		if segwit {
			for _ in 0..input_count {
				let items = reader.varint()?;
				for _ in 0..items {
					reader.var_bytes()?;
				}
			}
		}

		let locktime_start = reader.pos;
		reader.u32_le()?;
		if reader.pos != raw.len() {
			return Err(CodecError::TrailingBytes(raw.len() - reader.pos));
		}

		Ok(Layout {
			parsed: ParsedTx { inputs, outputs },
			io_start,
			io_end,
			locktime_start,
		})
	}
}

impl TxCodec for BitcoinTxCodec {
	fn parse(&self, raw: &[u8]) -> Result<ParsedTx, CodecError> {
		Ok(Self::layout(raw)?.parsed)
	}

	fn txid(&self, raw: &[u8]) -> Result<Txid, CodecError> {
		let layout = Self::layout(raw)?;
		let mut stripped = Vec::with_capacity(raw.len());
		stripped.extend_from_slice(&raw[..4]);
		stripped.extend_from_slice(&raw[layout.io_start..layout.io_end]);
		stripped.extend_from_slice(&raw[layout.locktime_start..]);

		let mut hash = Sha256::digest(Sha256::digest(&stripped)).to_vec();
		hash.reverse();
		Ok(Txid::new(hex::encode(hash)))
	}
}

/// Serialize a minimal legacy transaction. Used to build fixtures.
#[cfg(test)]
pub(crate) fn build_raw_tx(inputs: &[(Txid, u32)], outputs: &[(Vec<u8>, u64)]) -> Vec<u8> {
	let mut raw = Vec::new();
	raw.extend_from_slice(&1u32.to_le_bytes());
	raw.push(inputs.len() as u8);
	for (txid, index) in inputs {
		let mut hash = hex::decode(txid.as_str()).expect("fixture txid");
		hash.reverse();
		raw.extend_from_slice(&hash);
		raw.extend_from_slice(&index.to_le_bytes());
		raw.push(0);
		raw.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
	}
	raw.push(outputs.len() as u8);
	for (script, value) in outputs {
		raw.extend_from_slice(&value.to_le_bytes());
		raw.push(script.len() as u8);
		raw.extend_from_slice(script);
	}
	raw.extend_from_slice(&0u32.to_le_bytes());
	raw
}
