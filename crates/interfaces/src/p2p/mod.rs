//! Typed peer-to-peer message values and the channel interface.

mod channel;
mod messages;

pub use channel::{Channel, ChannelId, InboundMessage, MessageKind, Subscription};
pub use messages::{
    locator_heights, BlockMessage, GetBlocks, GetData, GetHeaders, HeadersMessage, InvItem,
    InvType, Inventory, Message, NotFound, SendHeaders, MAX_GET_BLOCKS, MAX_GET_HEADERS,
    MAX_INVENTORY,
};
