//! Framed manifest protocol spoken with the model runtime process.
//!
//! ```text
//! |--------------------------------------------------------------|---------------|
//! | Header                                                       | Body          |
//! |--------------------------------------------------------------|---------------|
//! | MAGIC              | VERSION (byte) | LENGTH of body (u32 BE)| JSON (string) |
//! |--------------------|----------------|------------------------|---------------|
//! | 0xAB | 0xE9 | 0xA0 | 0x01           | (4 bytes)              | ...           |
//! |--------------------|----------------|------------------------|---------------|
//! ```
//!
//! Messages strictly alternate request/response on a single connection;
//! there is no pipelining.

mod codec;
mod manifest;

pub use codec::{HEADER_SIZE, MAGIC, PROTOCOL_VERSION, decode_header, encode_header, read_message, write_message};
pub use manifest::{Content, HeaderEntry, RequestManifest, ResponseManifest};

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("bad magic bytes: {found:02X?}")]
    BadMagic { found: [u8; 3] },
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("I/O error on runtime socket")]
    Io(#[from] std::io::Error),
    #[error("malformed manifest body")]
    Decode(#[from] serde_json::Error),
}
