#![warn(missing_docs, unreachable_pub, unused_crate_dependencies)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Per-channel inbound protocols of the rbit node core.
//!
//! One instance of each protocol runs per peer connection, on that
//! connection's task. Protocols never touch chaser state directly: headers
//! are handed to the node through [`rbit_chasers::NodeHandle::organize`],
//! download maps move through `get_hashes`/`put_hashes`, and progress flows
//! back as chase events.

pub mod block_in;
pub mod header_in;

pub use block_in::BlockInProtocol;
pub use header_in::HeaderInProtocol;
