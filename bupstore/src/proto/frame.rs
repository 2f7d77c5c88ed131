//! Low-level framing primitives for the control channel and the binary payloads
//! embedded in it (spec.md §4.8). Generic over `tokio::io::{AsyncRead, AsyncWrite}` so
//! the same code drives stdio pipes, a TCP stream, or (in tests) an in-memory duplex
//! pipe.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};

use shared::Hash;

use crate::error::{Result, StoreError};

/// One `receive-objects-v2` record, decoded off the wire (spec.md §4.8).
pub enum ObjectFrame {
    /// `sha | crc32 | deflated bytes`, as received.
    Object { sha: Hash, crc32: u32, deflated: Vec<u8> },
    /// `n == 0xFFFFFFFF`: the server keeps the pack open across further commands.
    Suspend,
    /// `n == 0`: end of stream.
    End,
}

/// Reads one line from the control channel, stripping the trailing `\n` (and a `\r`
/// before it, for transports that insert one). `Ok(None)` means EOF.
pub async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<control channel>"), e))?;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer
        .write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<control channel>"), e))?;
    writer.flush().await.map_err(|e| StoreError::io(std::path::Path::new("<control channel>"), e))
}

pub async fn write_ok<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    write_line(writer, "ok").await
}

pub async fn write_error<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> Result<()> {
    write_line(writer, &format!("error {message}")).await
}

/// `index <name>.idx` index-suggestion line, emitted mid-`receive-objects-v2` (spec.md
/// §4.8, "index suggestion").
pub async fn write_index_suggestion<W: AsyncWrite + Unpin>(writer: &mut W, idx_name: &str) -> Result<()> {
    write_line(writer, &format!("index {idx_name}")).await
}

async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<binary channel>"), e))?;
    Ok(u32::from_le_bytes(buf))
}

async fn write_u32<W: AsyncWrite + Unpin>(writer: &mut W, value: u32) -> Result<()> {
    writer
        .write_all(&value.to_le_bytes())
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<binary channel>"), e))
}

/// Reads one `receive-objects-v2` record (spec.md §4.8's literal framing):
/// `u32 n` then, if `n` is neither `0` nor `0xFFFFFFFF`, `20-byte sha | u32 crc32 |
/// (n - 24) bytes of deflated object`.
pub async fn read_object_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ObjectFrame> {
    use tokio::io::AsyncReadExt;

    let n = read_u32(reader).await?;
    if n == shared::FRAME_END {
        return Ok(ObjectFrame::End);
    }
    if n == shared::FRAME_SUSPEND {
        return Ok(ObjectFrame::Suspend);
    }
    if (n as u64) < 24 {
        return Err(StoreError::Protocol(format!("object frame too short: {n} bytes")));
    }

    let mut sha = [0u8; shared::HASH_SIZE];
    reader
        .read_exact(&mut sha)
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<binary channel>"), e))?;
    let crc32 = read_u32(reader).await?;

    let deflated_len = n as usize - 24;
    let mut deflated = vec![0u8; deflated_len];
    reader
        .read_exact(&mut deflated)
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<binary channel>"), e))?;

    Ok(ObjectFrame::Object { sha, crc32, deflated })
}

pub async fn write_object_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sha: &Hash,
    crc32: u32,
    deflated: &[u8],
) -> Result<()> {
    let n = (24 + deflated.len()) as u32;
    write_u32(writer, n).await?;
    writer
        .write_all(sha)
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<binary channel>"), e))?;
    write_u32(writer, crc32).await?;
    writer
        .write_all(deflated)
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<binary channel>"), e))
}

pub async fn write_end_frame<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    write_u32(writer, shared::FRAME_END).await
}

pub async fn write_suspend_frame<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    write_u32(writer, shared::FRAME_SUSPEND).await
}

/// One `cat`-style record: `u32 length | length bytes`, terminated by a zero-length
/// record (spec.md §4.8, "`cat` framing").
pub async fn write_cat_record<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    write_u32(writer, bytes.len() as u32).await?;
    writer
        .write_all(bytes)
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<binary channel>"), e))
}

pub async fn write_cat_end<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    write_u32(writer, 0).await
}

/// Reads one `cat`-style record on the client side. `Ok(None)` is the zero-length
/// terminator.
pub async fn read_cat_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    use tokio::io::AsyncReadExt;
    let len = read_u32(reader).await? as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| StoreError::io(std::path::Path::new("<binary channel>"), e))?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn object_frame_round_trips() {
        let mut buf = Vec::new();
        let sha = [7u8; shared::HASH_SIZE];
        write_object_frame(&mut buf, &sha, 12345, b"deflated-bytes").await.unwrap();
        write_end_frame(&mut buf).await.unwrap();

        let mut reader = BufReader::new(&buf[..]);
        match read_object_frame(&mut reader).await.unwrap() {
            ObjectFrame::Object { sha: got_sha, crc32, deflated } => {
                assert_eq!(got_sha, sha);
                assert_eq!(crc32, 12345);
                assert_eq!(deflated, b"deflated-bytes");
            }
            _ => panic!("expected an object frame"),
        }
        assert!(matches!(read_object_frame(&mut reader).await.unwrap(), ObjectFrame::End));
    }

    #[tokio::test]
    async fn cat_records_round_trip_with_terminator() {
        let mut buf = Vec::new();
        write_cat_record(&mut buf, b"hello").await.unwrap();
        write_cat_record(&mut buf, b"world").await.unwrap();
        write_cat_end(&mut buf).await.unwrap();

        let mut reader = BufReader::new(&buf[..]);
        assert_eq!(read_cat_record(&mut reader).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_cat_record(&mut reader).await.unwrap(), Some(b"world".to_vec()));
        assert_eq!(read_cat_record(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn control_lines_strip_newline() {
        let mut reader = BufReader::new(&b"hello world\r\n"[..]);
        assert_eq!(read_line(&mut reader).await.unwrap(), Some("hello world".to_string()));
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }
}
