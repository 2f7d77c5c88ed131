//! Driver-side encoder for the control protocol (spec.md §4.8): the matching half of
//! [`crate::proto::session::ServerSession`]'s dispatch loop, used by
//! [`crate::repo::RemoteRepository`].

use tokio::io::{AsyncBufReadExt, AsyncWrite};

use shared::{Hash, ObjectKind};

use crate::error::{Result, StoreError};
use crate::proto::frame;

/// Reads response lines until `ok` (success) or `error <msg>` (failure), collecting
/// anything else (data lines a given command documents) into the returned `Vec`.
///
/// Takes the caller's own buffered stream directly rather than wrapping a fresh
/// `BufReader` around it: a `BufReader` recreated per call fills its buffer with
/// whatever the transport currently has available (routinely more than one line once a
/// real pipe or socket coalesces writes) and silently drops the unread remainder when
/// it's dropped at the end of the call. Every function below takes the same
/// `AsyncBufReadExt` stream for exactly this reason.
async fn read_until_ok<S: AsyncBufReadExt + Unpin>(stream: &mut S) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    loop {
        let line = frame::read_line(stream)
            .await?
            .ok_or_else(|| StoreError::Protocol("connection closed before ok/error".into()))?;
        if line == "ok" {
            return Ok(lines);
        }
        if let Some(msg) = line.strip_prefix("error ") {
            return Err(StoreError::Protocol(msg.to_string()));
        }
        lines.push(line);
    }
}

pub async fn init_dir<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S, path: &str) -> Result<()> {
    frame::write_line(stream, &format!("init-dir {path}")).await?;
    read_until_ok(stream).await?;
    Ok(())
}

pub async fn set_dir<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S, path: &str) -> Result<()> {
    frame::write_line(stream, &format!("set-dir {path}")).await?;
    read_until_ok(stream).await?;
    Ok(())
}

pub async fn quit<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    frame::write_line(stream, "quit").await
}

pub async fn read_ref<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S, name: &str) -> Result<Option<Hash>> {
    frame::write_line(stream, &format!("read-ref {name}")).await?;
    let lines = read_until_ok(stream).await?;
    match lines.first().map(String::as_str) {
        None | Some("none") => Ok(None),
        Some(hex_str) => {
            let bytes = hex::decode(hex_str)
                .map_err(|_| StoreError::Protocol(format!("malformed ref hash: {hex_str}")))?;
            if bytes.len() != shared::HASH_SIZE {
                return Err(StoreError::Protocol("ref hash has the wrong length".into()));
            }
            let mut hash = [0u8; shared::HASH_SIZE];
            hash.copy_from_slice(&bytes);
            Ok(Some(hash))
        }
    }
}

pub async fn update_ref<S: AsyncBufReadExt + AsyncWrite + Unpin>(
    stream: &mut S,
    name: &str,
    expected: Option<Hash>,
    new: Hash,
) -> Result<()> {
    let old_hex = expected.map(hex::encode).unwrap_or_else(|| hex::encode(shared::ZERO_HASH));
    frame::write_line(stream, &format!("update-ref {name}")).await?;
    frame::write_line(stream, &hex::encode(new)).await?;
    frame::write_line(stream, &old_hex).await?;
    read_until_ok(stream).await?;
    Ok(())
}

pub async fn list_refs<S: AsyncBufReadExt + AsyncWrite + Unpin>(
    stream: &mut S,
    prefix: Option<&str>,
) -> Result<Vec<(String, Hash)>> {
    match prefix {
        Some(p) => frame::write_line(stream, &format!("list-refs {p}")).await?,
        None => frame::write_line(stream, "list-refs").await?,
    }
    let lines = read_until_ok(stream).await?;
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        let (name, hex_str) = line
            .split_once(' ')
            .ok_or_else(|| StoreError::Protocol(format!("malformed list-refs line: {line}")))?;
        let bytes = hex::decode(hex_str)
            .map_err(|_| StoreError::Protocol(format!("malformed ref hash: {hex_str}")))?;
        if bytes.len() != shared::HASH_SIZE {
            return Err(StoreError::Protocol("ref hash has the wrong length".into()));
        }
        let mut hash = [0u8; shared::HASH_SIZE];
        hash.copy_from_slice(&bytes);
        out.push((name.to_string(), hash));
    }
    Ok(out)
}

pub async fn list_indexes<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S) -> Result<Vec<String>> {
    frame::write_line(stream, "list-indexes").await?;
    let mut names = Vec::new();
    loop {
        match frame::read_cat_record(stream).await? {
            Some(bytes) => names.push(String::from_utf8_lossy(&bytes).into_owned()),
            None => break,
        }
    }
    read_until_ok(stream).await?;
    Ok(names)
}

pub async fn send_index<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S, name: &str) -> Result<Vec<u8>> {
    frame::write_line(stream, &format!("send-index {name}")).await?;
    let mut bytes = Vec::new();
    loop {
        match frame::read_cat_record(stream).await? {
            Some(chunk) => bytes.extend_from_slice(&chunk),
            None => break,
        }
    }
    read_until_ok(stream).await?;
    Ok(bytes)
}

/// `cat <id>` (spec.md §4.8): fetches one object's bytes by hex hash or ref name,
/// concatenating the (possibly multi-record) reply.
pub async fn cat<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S, id: &str) -> Result<Vec<u8>> {
    frame::write_line(stream, &format!("cat {id}")).await?;
    let mut bytes = Vec::new();
    loop {
        match frame::read_cat_record(stream).await {
            Ok(Some(chunk)) => bytes.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => return Err(e),
        }
    }
    read_until_ok(stream).await?;
    Ok(bytes)
}

pub async fn rev_parse<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S, id: &str) -> Result<Hash> {
    frame::write_line(stream, &format!("rev-parse {id}")).await?;
    let lines = read_until_ok(stream).await?;
    let hex_str = lines.first().ok_or_else(|| StoreError::Protocol("rev-parse returned nothing".into()))?;
    let bytes = hex::decode(hex_str).map_err(|_| StoreError::Protocol("malformed rev-parse reply".into()))?;
    if bytes.len() != shared::HASH_SIZE {
        return Err(StoreError::Protocol("rev-parse hash has the wrong length".into()));
    }
    let mut hash = [0u8; shared::HASH_SIZE];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Sends the `receive-objects-v2` command line, entering the framed-object phase.
pub async fn begin_receive_objects<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    frame::write_line(stream, "receive-objects-v2").await
}

/// Sends one object record, then opportunistically checks for an index suggestion
/// queued right behind it, using a short non-blocking peek so a server with nothing
/// queued doesn't stall the caller (spec.md §5, "index suggestions... observed only at
/// well-defined drain points"). Returns every suggestion name found (ordinarily at most
/// one, since the server emits at most one suggestion per duplicate object, but nothing
/// bounds how many duplicates a caller might stream through `send_object` before the
/// caller's next drain point).
pub async fn send_object<S: AsyncBufReadExt + AsyncWrite + Unpin>(
    stream: &mut S,
    kind: ObjectKind,
    hash: &Hash,
    payload: &[u8],
) -> Result<Vec<String>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    let mut compressed = Vec::new();
    {
        let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
        encoder
            .write_all(&[kind as u8])
            .and_then(|_| encoder.write_all(payload))
            .map_err(|e| StoreError::io(std::path::Path::new("<object encode>"), e))?;
        encoder.finish().map_err(|e| StoreError::io(std::path::Path::new("<object encode>"), e))?;
    }
    let crc32 = crc32fast::hash(&compressed);
    frame::write_object_frame(stream, hash, crc32, &compressed).await?;
    drain_suggestions(stream).await
}

/// Drains any `index <name>` suggestion lines the server has queued right now,
/// without blocking if there are none (the client's proactive drain point, spec.md
/// §5).
pub async fn drain_suggestions<S: AsyncBufReadExt + Unpin>(reader: &mut S) -> Result<Vec<String>> {
    let mut suggestions = Vec::new();
    loop {
        let mut peek = [0u8; 1];
        match tokio::time::timeout(std::time::Duration::from_millis(0), reader.fill_buf()).await {
            Ok(Ok(buf)) if !buf.is_empty() => {
                peek[0] = buf[0];
            }
            _ => break,
        }
        if peek[0] != b'i' {
            break;
        }
        match frame::read_line(reader).await? {
            Some(line) => match line.strip_prefix("index ") {
                Some(name) => suggestions.push(name.to_string()),
                None => break,
            },
            None => break,
        }
    }
    Ok(suggestions)
}

/// Sends the zero-length terminator and reads back the server's reply: the idx name
/// it finalized (or `none`), followed by `ok`.
pub async fn end_receive_objects<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S) -> Result<Option<String>> {
    frame::write_end_frame(stream).await?;
    let lines = read_until_ok(stream).await?;
    match lines.first().map(String::as_str) {
        None | Some("none") => Ok(None),
        Some(name) => Ok(Some(name.to_string())),
    }
}

/// Sends the suspend marker, keeping the server's pack writer open across further
/// commands on the same connection (spec.md §4.8).
pub async fn suspend_receive_objects<S: AsyncBufReadExt + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    frame::write_suspend_frame(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, BufReader};

    #[tokio::test]
    async fn read_ref_parses_none_and_hash() {
        let (client, mut server) = duplex(4096);
        let mut client = BufReader::new(client);

        tokio::spawn(async move {
            let mut reader = BufReader::new(&mut server);
            let _ = frame::read_line(&mut reader).await.unwrap();
            frame::write_line(&mut server, "none").await.unwrap();
            frame::write_ok(&mut server).await.unwrap();
        });

        let result = read_ref(&mut client, "missing").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn cat_concatenates_records() {
        let (client, mut server) = duplex(4096);
        let mut client = BufReader::new(client);

        tokio::spawn(async move {
            let mut reader = BufReader::new(&mut server);
            let _ = frame::read_line(&mut reader).await.unwrap();
            frame::write_cat_record(&mut server, b"hel").await.unwrap();
            frame::write_cat_record(&mut server, b"lo").await.unwrap();
            frame::write_cat_end(&mut server).await.unwrap();
            frame::write_ok(&mut server).await.unwrap();
        });

        let bytes = cat(&mut client, "deadbeef").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn update_ref_surfaces_server_error() {
        let (client, mut server) = duplex(4096);
        let mut client = BufReader::new(client);

        tokio::spawn(async move {
            let mut reader = BufReader::new(&mut server);
            let _ = frame::read_line(&mut reader).await.unwrap();
            let _ = frame::read_line(&mut reader).await.unwrap();
            let _ = frame::read_line(&mut reader).await.unwrap();
            frame::write_error(&mut server, "compare-and-set failed").await.unwrap();
        });

        let err = update_ref(&mut client, "x", Some([1u8; shared::HASH_SIZE]), [2u8; shared::HASH_SIZE])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn send_object_surfaces_a_queued_suggestion() {
        let (client, mut server) = duplex(4096);
        let mut client = BufReader::new(client);

        // The two directions of a duplex pipe are independent: queuing the suggestion
        // on the server's outbound side before the client even writes its object frame
        // reproduces "the server emitted a suggestion already sitting in the pipe when
        // the client gets around to peeking for it" deterministically, with no races.
        frame::write_index_suggestion(&mut server, "pack-deadbeef.idx").await.unwrap();

        let hash = [9u8; shared::HASH_SIZE];
        let suggestions = send_object(&mut client, ObjectKind::Blob, &hash, b"payload").await.unwrap();
        assert_eq!(suggestions, vec!["pack-deadbeef.idx".to_string()]);
    }

    #[tokio::test]
    async fn send_object_returns_nothing_when_no_suggestion_is_queued() {
        let (client, _server) = duplex(4096);
        let mut client = BufReader::new(client);

        let hash = [9u8; shared::HASH_SIZE];
        let suggestions = send_object(&mut client, ObjectKind::Blob, &hash, b"payload").await.unwrap();
        assert!(suggestions.is_empty());
    }
}
