//! Types shared between the pong server and its clients.
//!
//! Both transports speak single-line text messages. The game channel (UDP)
//! uses colon-delimited tags such as `BALL:1.00;-2.50`, the chat channel
//! (TCP) uses pipe-delimited tags such as `CHAT|ana|hello`. The [`codec`]
//! module is the only place that knows either convention.

pub mod chat_log;
pub mod codec;
pub mod math;

pub use chat_log::ChatLog;
pub use codec::{decode, decode_line, encode, encode_line, DecodeError, Message};
pub use math::Vector2;

/// Default UDP port of the game channel.
pub const DEFAULT_GAME_PORT: u16 = 5001;
/// Default TCP port of the chat relay.
pub const DEFAULT_CHAT_PORT: u16 = 5556;
/// Largest datagram the game channel expects to receive.
pub const MAX_DATAGRAM_SIZE: usize = 2048;
