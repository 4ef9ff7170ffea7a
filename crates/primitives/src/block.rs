use crate::{header::sha256d, BlockHash, Header, SealedHeader};
use derive_more::{AsRef, Deref};
use serde::{Deserialize, Serialize};

/// A reference to a transaction output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Hash of the transaction holding the output.
    pub hash: BlockHash,
    /// Output index within that transaction.
    pub index: u32,
}

/// A transaction input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxInput {
    /// The previous output being spent.
    pub prevout: OutPoint,
    /// Unlocking script.
    pub script: Vec<u8>,
    /// Input sequence number.
    pub sequence: u32,
}

/// A transaction output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    /// Locking script.
    pub script: Vec<u8>,
}

/// A Bitcoin transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction version.
    pub version: u32,
    /// Spent outputs.
    pub inputs: Vec<TxInput>,
    /// Created outputs.
    pub outputs: Vec<TxOutput>,
    /// Earliest block or time the transaction may confirm.
    pub locktime: u32,
}

impl Transaction {
    /// Computes the transaction hash over a canonical field serialization.
    pub fn hash(&self) -> BlockHash {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.version.to_le_bytes());
        for input in &self.inputs {
            buf.extend_from_slice(input.prevout.hash.as_bytes());
            buf.extend_from_slice(&input.prevout.index.to_le_bytes());
            buf.extend_from_slice(&input.script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            buf.extend_from_slice(&output.script);
        }
        buf.extend_from_slice(&self.locktime.to_le_bytes());
        sha256d(&buf)
    }

    /// Heuristic serialized size in bytes.
    pub fn size(&self) -> usize {
        let inputs = self.inputs.iter().map(|i| 40 + i.script.len()).sum::<usize>();
        let outputs = self.outputs.iter().map(|o| 8 + o.script.len()).sum::<usize>();
        8 + inputs + outputs
    }

    /// Returns true for a coinbase transaction (single null-prevout input).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 &&
            self.inputs[0].prevout.hash.is_zero() &&
            self.inputs[0].prevout.index == u32::MAX
    }
}

/// A full block: header plus transaction sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The block header.
    pub header: Header,
    /// The transactions in merkle order.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Seals the block, memoizing the header hash and serialized size.
    pub fn seal(self) -> SealedBlock {
        let Self { header, transactions } = self;
        let header = header.seal();
        let size = 80 + transactions.iter().map(Transaction::size).sum::<usize>();
        SealedBlock { header, transactions, size }
    }
}

/// A [`Block`] sealed at a precalculated header hash and serialized size.
///
/// Blocks travel the pipeline behind [`std::sync::Arc`] so arbitrary handlers
/// may outlive the receive call; the memoized hash avoids recomputation on
/// every tracker lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, AsRef, Deref, Serialize, Deserialize)]
pub struct SealedBlock {
    /// The sealed header.
    #[as_ref]
    #[deref]
    header: SealedHeader,
    /// The transactions in merkle order.
    transactions: Vec<Transaction>,
    /// Cached serialized size in bytes.
    size: usize,
}

impl SealedBlock {
    /// Returns the sealed header.
    #[inline]
    pub const fn sealed_header(&self) -> &SealedHeader {
        &self.header
    }

    /// Returns the memoized block hash.
    #[inline]
    pub const fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// The block transactions.
    #[inline]
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Cached serialized size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Splits into the sealed header and the transactions.
    pub fn split(self) -> (SealedHeader, Vec<Transaction>) {
        (self.header, self.transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint { hash: BlockHash::zero(), index: u32::MAX },
                script: vec![0x51],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { value, script: vec![0x51] }],
            locktime: 0,
        }
    }

    #[test]
    fn sealed_block_caches_hash_and_size() {
        let block = Block {
            header: Header { version: 2, ..Default::default() },
            transactions: vec![coinbase(50), Transaction::default()],
        };
        let expected = block.header.hash_slow();
        let sealed = block.clone().seal();
        assert_eq!(sealed.hash(), expected);
        assert_eq!(sealed.size(), 80 + block.transactions.iter().map(Transaction::size).sum::<usize>());
    }

    #[test]
    fn coinbase_detection() {
        assert!(coinbase(50).is_coinbase());
        assert!(!Transaction::default().is_coinbase());
    }

    #[test]
    fn distinct_transactions_hash_distinctly() {
        let a = coinbase(50);
        let b = coinbase(25);
        assert_ne!(a.hash(), b.hash());
    }
}
