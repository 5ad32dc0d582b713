//! Byte relay between an established client and its data center.

pub mod relay;

pub use relay::{relay, RelayEnd, RELAY_BUFFER_SIZE};
