use byteorder::{BigEndian, ByteOrder as _};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::IpcError;

pub const MAGIC: [u8; 3] = [0xAB, 0xE9, 0xA0];
pub const PROTOCOL_VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 8;

/// Builds the 8-byte frame header for a body of `len` bytes.
pub fn encode_header(len: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..3].copy_from_slice(&MAGIC);
    header[3] = PROTOCOL_VERSION;
    BigEndian::write_u32(&mut header[4..], len);
    header
}

/// Validates magic and version, returning the body length.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<u32, IpcError> {
    if header[..3] != MAGIC {
        return Err(IpcError::BadMagic {
            found: [header[0], header[1], header[2]],
        });
    }
    if header[3] != PROTOCOL_VERSION {
        return Err(IpcError::UnsupportedVersion(header[3]));
    }
    Ok(BigEndian::read_u32(&header[4..]))
}

/// Writes one framed message: header first, then the body.
///
/// `write_all` retries partial writes until the frame is complete.
pub async fn write_message<W>(writer: &mut W, body: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| {
        IpcError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "message body exceeds the u32 length field",
        ))
    })?;
    writer.write_all(&encode_header(len)).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly one framed message and returns its body.
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = decode_header(&header)?;

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
