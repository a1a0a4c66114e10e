//! Core chain types: headers, transactions, blocks and their identities

use std::{fmt, str::FromStr};

use crate::crypto::{sha256d, sha256d_pair};
use crate::hash::{BlockHash, TxHash};

/// Identity of a connected peer, assigned by the transport layer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// A block hash together with its height
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct HashHeight {
    #[n(0)]
    pub hash: BlockHash,
    #[n(1)]
    pub height: u64,
}

impl HashHeight {
    pub fn new(hash: BlockHash, height: u64) -> Self {
        Self { hash, height }
    }
}

impl fmt::Display for HashHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashHeightParseError {
    #[error("expected '<height>-<hash>'")]
    Format,
    #[error("bad height: {0}")]
    Height(#[from] std::num::ParseIntError),
    #[error("bad hash: {0}")]
    Hash(#[from] hex::FromHexError),
}

impl FromStr for HashHeight {
    type Err = HashHeightParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (height, hash) = s.split_once('-').ok_or(HashHeightParseError::Format)?;
        Ok(Self {
            height: height.parse()?,
            hash: hash.parse()?,
        })
    }
}

/// Cumulative proof of work, saturating at `u128::MAX`
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ChainWork(pub u128);

impl ChainWork {
    pub const ZERO: ChainWork = ChainWork(0);

    /// Expected number of hashes needed to meet the compact target `bits`,
    /// approximated as 2^256 / target and never less than one.
    pub fn from_bits(bits: u32) -> ChainWork {
        let exponent = (bits >> 24) as i32;
        let mantissa = (bits & 0x007f_ffff) as u128;
        if mantissa == 0 || bits & 0x0080_0000 != 0 {
            return ChainWork(1);
        }

        // target = mantissa * 2^(8 * (exponent - 3)), so work = 2^shift / mantissa
        let shift = 280 - 8 * exponent;
        if shift <= 0 {
            return ChainWork(1);
        }
        let work = if shift < 128 {
            (1u128 << shift) / mantissa
        } else {
            let base = (1u128 << 127) / mantissa;
            let extra = (shift - 127) as u32;
            if extra >= base.leading_zeros() {
                u128::MAX
            } else {
                base << extra
            }
        };
        ChainWork(work.max(1))
    }

    pub fn saturating_add(self, other: ChainWork) -> ChainWork {
        ChainWork(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: ChainWork) -> ChainWork {
        ChainWork(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A 256-bit target, stored big-endian so array ordering is numeric ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target([u8; 32]);

impl Target {
    /// Expand a compact target. Returns `None` for negative or overflowing encodings.
    pub fn from_compact(bits: u32) -> Option<Target> {
        let exponent = (bits >> 24) as usize;
        let mut mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 {
            return None;
        }

        let mut bytes = [0u8; 32];
        if exponent <= 3 {
            mantissa >>= 8 * (3 - exponent) as u32;
            let m = mantissa.to_be_bytes();
            bytes[29..].copy_from_slice(&m[1..]);
        } else {
            let m = mantissa.to_be_bytes();
            for (i, byte) in m[1..].iter().enumerate() {
                // Most significant mantissa byte sits at 256^(exponent - 1)
                let power = exponent - 1 - i;
                if power > 31 {
                    if *byte != 0 {
                        return None;
                    }
                    continue;
                }
                bytes[31 - power] = *byte;
            }
        }
        Some(Target(bytes))
    }

    /// True if `hash`, read as a little-endian number, does not exceed this target
    pub fn is_met_by(&self, hash: &BlockHash) -> bool {
        let mut value = hash.into_inner();
        value.reverse();
        value <= self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Fixed 80-byte block header
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct BlockHeader {
    #[n(0)]
    pub version: i32,
    #[n(1)]
    pub previous_hash: BlockHash,
    #[n(2)]
    pub merkle_root: TxHash,
    #[n(3)]
    pub time: u32,
    #[n(4)]
    pub bits: u32,
    #[n(5)]
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_hash.as_ref());
        out[36..68].copy_from_slice(self.merkle_root.as_ref());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> BlockHash {
        sha256d(&self.serialize())
    }

    /// Work contributed by this header alone
    pub fn work(&self) -> ChainWork {
        ChainWork::from_bits(self.bits)
    }

    pub fn target(&self) -> Option<Target> {
        Target::from_compact(self.bits)
    }
}

/// Reference to a transaction output
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct OutPoint {
    #[n(0)]
    pub txid: TxHash,
    #[n(1)]
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: TxHash, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The outpoint spent by a coinbase input
    pub fn null() -> Self {
        Self {
            txid: TxHash::default(),
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.vout == u32::MAX && self.txid.is_zero()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct TxIn {
    #[n(0)]
    pub previous_output: OutPoint,
    #[b(1)]
    pub script_sig: Vec<u8>,
    #[n(2)]
    pub sequence: u32,
    #[n(3)]
    pub witness: Vec<Vec<u8>>,
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct TxOut {
    #[n(0)]
    pub value: u64,
    #[b(1)]
    pub script_pubkey: Vec<u8>,
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct Transaction {
    #[n(0)]
    pub version: i32,
    #[n(1)]
    pub inputs: Vec<TxIn>,
    #[n(2)]
    pub outputs: Vec<TxOut>,
    #[n(3)]
    pub lock_time: u32,
}

impl Transaction {
    /// Identity over the witness-free serialisation
    pub fn txid(&self) -> TxHash {
        sha256d(&self.serialize(false))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().fold(0u64, |acc, out| acc.saturating_add(out.value))
    }

    pub fn serialize(&self, with_witness: bool) -> Vec<u8> {
        let with_witness = with_witness && self.has_witness();
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_le_bytes());
        if with_witness {
            // Segregated witness marker and flag
            buf.extend_from_slice(&[0x00, 0x01]);
        }
        write_compact_size(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(input.previous_output.txid.as_ref());
            buf.extend_from_slice(&input.previous_output.vout.to_le_bytes());
            write_bytes(&mut buf, &input.script_sig);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_bytes(&mut buf, &output.script_pubkey);
        }
        if with_witness {
            for input in &self.inputs {
                write_compact_size(&mut buf, input.witness.len() as u64);
                for item in &input.witness {
                    write_bytes(&mut buf, item);
                }
            }
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }
}

/// A full block: header plus ordered transactions
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct Block {
    #[n(0)]
    pub header: BlockHeader,
    #[n(1)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Pairwise double-SHA-256 merkle root over the transaction ids,
    /// duplicating the last entry of odd-length levels.
    pub fn compute_merkle_root(&self) -> TxHash {
        self.merkle_root_and_mutation().0
    }

    /// Merkle root, plus whether any level pairs two identical hashes.
    ///
    /// Such a pair means a different transaction list hashes to the same
    /// root (the odd-leaf duplication can be spelled out explicitly), so a
    /// body with this flag set says nothing about its header.
    pub fn merkle_root_and_mutation(&self) -> (TxHash, bool) {
        let mut level: Vec<TxHash> = self.transactions.iter().map(Transaction::txid).collect();
        if level.is_empty() {
            return (TxHash::default(), false);
        }
        let mut mutated = false;
        while level.len() > 1 {
            mutated |= level.chunks_exact(2).any(|pair| pair[0] == pair[1]);
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => sha256d_pair(left, right),
                    [single] => sha256d_pair(single, single),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
        }
        (level[0], mutated)
    }

    /// Serialised size in bytes, witness data included
    pub fn size(&self) -> usize {
        let mut count = Vec::new();
        write_compact_size(&mut count, self.transactions.len() as u64);
        BlockHeader::SIZE
            + count.len()
            + self.transactions.iter().map(|tx| tx.serialize(true).len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: vec![0x51],
                sequence: u32::MAX,
                witness: vec![],
            }],
            outputs: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn hash_height_display_and_parse() {
        let hh = HashHeight::new(BlockHash::new([7u8; 32]), 42);
        let text = hh.to_string();
        assert!(text.starts_with("42-0707"));
        assert_eq!(text.parse::<HashHeight>().unwrap(), hh);
        assert!("nonsense".parse::<HashHeight>().is_err());
    }

    #[test]
    fn work_from_known_targets() {
        // Mainnet minimum difficulty is roughly 2^32 hashes
        assert_eq!(ChainWork::from_bits(0x1d00ffff), ChainWork((1u128 << 48) / 0xffff));
        // Regtest easy target gives a tiny but non-zero work
        assert_eq!(ChainWork::from_bits(0x207fffff), ChainWork(2));
        // Harder target gives more work
        assert!(ChainWork::from_bits(0x1c00ffff) > ChainWork::from_bits(0x1d00ffff));
        // Absurdly hard targets saturate rather than overflow
        assert_eq!(ChainWork::from_bits(0x0100_0001), ChainWork(u128::MAX));
    }

    #[test]
    fn compact_target_expansion() {
        let target = Target::from_compact(0x1d00ffff).unwrap();
        let mut expected = [0u8; 32];
        expected[4] = 0xff;
        expected[5] = 0xff;
        assert_eq!(target, Target(expected));

        assert!(Target::from_compact(0x1d80ffff).is_none());
        assert!(Target::from_compact(0x2300ffff).is_none());
    }

    #[test]
    fn easy_target_is_met_by_small_hash() {
        let target = Target::from_compact(0x207fffff).unwrap();
        let mut small = [0u8; 32];
        small[0] = 0xff;
        assert!(target.is_met_by(&BlockHash::new(small)));
        assert!(!target.is_met_by(&BlockHash::new([0xff; 32])));
    }

    #[test]
    fn header_serialises_to_eighty_bytes() {
        let header = BlockHeader {
            version: 1,
            previous_hash: BlockHash::default(),
            merkle_root: TxHash::new([3u8; 32]),
            time: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
        };
        let bytes = header.serialize();
        assert_eq!(bytes.len(), 80);
        assert_eq!(&bytes[68..72], &1_231_006_505u32.to_le_bytes());
        assert_eq!(header.hash(), crate::crypto::sha256d(&bytes));
    }

    #[test]
    fn merkle_root_of_single_transaction_is_its_txid() {
        let tx = coinbase(50);
        let block = Block {
            header: BlockHeader {
                version: 1,
                previous_hash: BlockHash::default(),
                merkle_root: tx.txid(),
                time: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![tx.clone()],
        };
        assert_eq!(block.compute_merkle_root(), tx.txid());
        assert!(tx.is_coinbase());
    }

    #[test]
    fn merkle_root_duplicates_odd_leaf() {
        let txs = vec![coinbase(1), coinbase(2), coinbase(3)];
        let ids: Vec<TxHash> = txs.iter().map(Transaction::txid).collect();
        let block = Block {
            header: BlockHeader {
                version: 1,
                previous_hash: BlockHash::default(),
                merkle_root: TxHash::default(),
                time: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: txs,
        };
        let left = sha256d_pair(&ids[0], &ids[1]);
        let right = sha256d_pair(&ids[2], &ids[2]);
        assert_eq!(block.compute_merkle_root(), sha256d_pair(&left, &right));
    }

    #[test]
    fn repeated_last_transaction_keeps_root_but_is_flagged() {
        let txs = vec![coinbase(1), coinbase(2), coinbase(3)];
        let header = BlockHeader {
            version: 1,
            previous_hash: BlockHash::default(),
            merkle_root: TxHash::default(),
            time: 0,
            bits: 0x207fffff,
            nonce: 0,
        };
        let honest = Block {
            header: header.clone(),
            transactions: txs.clone(),
        };
        let mut padded = txs;
        padded.push(padded[2].clone());
        let mutated = Block {
            header,
            transactions: padded,
        };

        let (root, flagged) = honest.merkle_root_and_mutation();
        assert!(!flagged);
        assert_eq!(mutated.merkle_root_and_mutation(), (root, true));
    }

    #[test]
    fn witness_does_not_change_txid() {
        let mut tx = coinbase(5);
        let plain = tx.txid();
        tx.inputs[0].witness = vec![vec![0u8; 32]];
        assert_eq!(tx.txid(), plain);
        assert!(tx.serialize(true).len() > tx.serialize(false).len());
    }
}
