//! kemchat shared library: ids, limits and API contracts exchanged between
//! the chat client and the server that relays wrapped keys and ciphertext.

pub mod api;
pub mod constants;
pub mod error;
pub mod ids;
