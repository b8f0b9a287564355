//! Request and response bodies. Binary fields (keys, artifacts, ciphertext)
//! travel as standard base64 strings.

pub mod auth;
pub mod conversation;
pub mod message;
