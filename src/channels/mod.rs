//! Chat transport: the channel trait, outbound hygiene, and the
//! Telegram implementation.

pub mod channel;
pub mod telegram;

pub use channel::{
    ButtonPress, Channel, ChannelEvent, Choice, EventStream, IncomingMessage, MESSAGE_MAX,
    MessageRef, Outbox, OutgoingMessage, TextFormat,
};
pub use telegram::TelegramChannel;
