//! Fragment framing for the peer transport.
//!
//! A logical message is carried as one or more fragments, each framed on the wire as a
//! fixed header followed by a size limited chunk of the encoded payload:
//!
//! ```text
//! | u32 data len | u64 fragment id | u8 flags | data... |
//! ```
//!
//! The receiving side feeds frames into the `FragmentReassembler` which hands back the
//! whole payload once the terminal fragment arrives.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The maximum number of payload bytes carried by a single fragment.
pub const MAX_FRAGMENT_DATA: usize = 32 * 1024;
/// The wire length of a frame header.
const HEADER_LEN: usize = 13;
/// Flag bit marking the first fragment of a message.
const FLAG_FIRST: u8 = 0b01;
/// Flag bit marking the terminal fragment of a message.
const FLAG_LAST: u8 = 0b10;

/// A single fragment read off the wire.
pub struct Frame {
    /// The fragment ID shared by all fragments of one message.
    pub fragment_id: u64,
    /// A bool indicating if this is the first fragment of its message.
    pub first: bool,
    /// A bool indicating if this is the terminal fragment of its message.
    pub last: bool,
    /// The payload chunk.
    pub data: Vec<u8>,
}

/// Write the given encoded message to the writer as a sequence of fragments.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, fragment_id: u64, payload: &[u8]) -> Result<()> {
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(MAX_FRAGMENT_DATA).collect()
    };
    let terminal = chunks.len() - 1;
    for (idx, chunk) in chunks.into_iter().enumerate() {
        let mut flags = 0u8;
        if idx == 0 {
            flags |= FLAG_FIRST;
        }
        if idx == terminal {
            flags |= FLAG_LAST;
        }
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&(chunk.len() as u32).to_be_bytes());
        header[4..12].copy_from_slice(&fragment_id.to_be_bytes());
        header[12] = flags;
        writer.write_all(&header).await.context("error writing fragment header")?;
        writer.write_all(chunk).await.context("error writing fragment data")?;
    }
    writer.flush().await.context("error flushing fragment data")?;
    Ok(())
}

/// Read a single fragment frame from the reader.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.context("error reading fragment header")?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAGMENT_DATA {
        bail!("fragment data length {} exceeds the fragment limit of {}", len, MAX_FRAGMENT_DATA);
    }
    let fragment_id = u64::from_be_bytes([header[4], header[5], header[6], header[7], header[8], header[9], header[10], header[11]]);
    let flags = header[12];
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.context("error reading fragment data")?;
    Ok(Frame {
        fragment_id,
        first: flags & FLAG_FIRST != 0,
        last: flags & FLAG_LAST != 0,
        data,
    })
}
