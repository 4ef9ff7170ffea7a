//! Standard Bitcoin P2P message values.
//!
//! These are typed values only; the wire codec lives with the networking
//! framework. Constants are the protocol's, bit-exact.

use rbit_primitives::{BlockHash, BlockNumber, SealedBlock, SealedHeader};
use std::sync::Arc;

/// Maximum headers per `headers` message.
pub const MAX_GET_HEADERS: usize = 2000;

/// Maximum inventory items per `getblocks` response.
pub const MAX_GET_BLOCKS: usize = 500;

/// Maximum items per `inv`/`getdata` message.
pub const MAX_INVENTORY: usize = 50_000;

/// Inventory item type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InvType {
    /// A transaction.
    Tx = 1,
    /// A block.
    Block = 2,
    /// A filtered block.
    FilteredBlock = 3,
    /// A transaction with witness data (BIP144).
    WitnessTx = 0x4000_0001,
    /// A block with witness data (BIP144).
    WitnessBlock = 0x4000_0002,
}

impl InvType {
    /// The block item type for a channel, honoring its witness configuration.
    pub const fn block_type(witness: bool) -> Self {
        if witness {
            Self::WitnessBlock
        } else {
            Self::Block
        }
    }
}

/// A single inventory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    /// Item type.
    pub kind: InvType,
    /// Item hash.
    pub hash: BlockHash,
}

/// `getheaders`: request headers following the locator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetHeaders {
    /// Block locator, newest first.
    pub locator: Vec<BlockHash>,
    /// Hash at which to stop; zero requests the maximum batch.
    pub stop_hash: BlockHash,
}

impl GetHeaders {
    /// Creates a request with a zero stop hash.
    pub fn new(locator: Vec<BlockHash>) -> Self {
        Self { locator, stop_hash: BlockHash::zero() }
    }
}

/// `headers`: a batch of headers, oldest first.
#[derive(Debug, Clone, Default)]
pub struct HeadersMessage {
    /// The headers, oldest first.
    pub headers: Vec<Arc<SealedHeader>>,
}

/// `getblocks`: request block inventory following the locator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetBlocks {
    /// Block locator, newest first.
    pub locator: Vec<BlockHash>,
    /// Hash at which to stop; zero requests the maximum batch.
    pub stop_hash: BlockHash,
}

/// `inv`: announced inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Announced items.
    pub items: Vec<InvItem>,
}

/// `getdata`: request announced or tracked items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetData {
    /// Requested items.
    pub items: Vec<InvItem>,
}

/// `block`: a full block.
#[derive(Debug, Clone)]
pub struct BlockMessage {
    /// The block.
    pub block: Arc<SealedBlock>,
}

impl BlockMessage {
    /// Serialized size of the carried block, cached at seal time.
    pub fn cached_size(&self) -> usize {
        self.block.size()
    }
}

/// `notfound`: requested items the peer does not have.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotFound {
    /// The missing items.
    pub items: Vec<InvItem>,
}

/// `sendheaders`: ask the peer to announce via `headers` instead of `inv`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendHeaders;

/// An outbound message.
#[derive(Debug, Clone)]
pub enum Message {
    /// `getheaders`.
    GetHeaders(GetHeaders),
    /// `headers`.
    Headers(HeadersMessage),
    /// `getblocks`.
    GetBlocks(GetBlocks),
    /// `inv`.
    Inv(Inventory),
    /// `getdata`.
    GetData(GetData),
    /// `block`.
    Block(BlockMessage),
    /// `notfound`.
    NotFound(NotFound),
    /// `sendheaders`.
    SendHeaders(SendHeaders),
}

/// Block locator heights for a chain top: the last ten heights step by one,
/// then the step doubles back to genesis.
pub fn locator_heights(top: BlockNumber) -> Vec<BlockNumber> {
    let mut heights = Vec::new();
    let mut height = top as i64;
    let mut step = 1i64;
    while height > 0 {
        heights.push(height as BlockNumber);
        if heights.len() >= 10 {
            step *= 2;
        }
        height -= step;
    }
    heights.push(0);
    heights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_steps_then_doubles() {
        let heights = locator_heights(100);
        // Last ten by one.
        assert_eq!(&heights[..10], &[100, 99, 98, 97, 96, 95, 94, 93, 92, 91]);
        // Then doubling gaps.
        assert_eq!(&heights[10..13], &[89, 85, 77]);
        // Genesis is always terminal.
        assert_eq!(heights.last(), Some(&0));
    }

    #[test]
    fn locator_of_low_top_is_dense() {
        assert_eq!(locator_heights(2), vec![2, 1, 0]);
        assert_eq!(locator_heights(0), vec![0]);
    }

    #[test]
    fn witness_type_selection() {
        assert_eq!(InvType::block_type(true), InvType::WitnessBlock);
        assert_eq!(InvType::block_type(false), InvType::Block);
    }
}
