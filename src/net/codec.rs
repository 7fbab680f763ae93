//! Framing primitives: big-endian word I/O over TCP, the nonblocking
//! magic probe that gates new connections, vectored batch writes, and
//! cursor-style parsing of UDP frames.

use crate::errors::{EtError, Result};
use crate::net::types::MAGIC;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::IoSlice;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

/// How long a fresh connection gets to produce the three magic words
/// before it is written off as a port scan.
pub const MAGIC_PROBE_DEADLINE: Duration = Duration::from_millis(100);

pub async fn read_word<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).await.map_err(|_| EtError::Read)?;
    Ok(BigEndian::read_u32(&buf))
}

pub async fn read_words<R: AsyncRead + Unpin>(r: &mut R, n: usize) -> Result<Vec<u32>> {
    let mut buf = vec![0u8; n * 4];
    r.read_exact(&mut buf).await.map_err(|_| EtError::Read)?;
    Ok(buf.chunks_exact(4).map(BigEndian::read_u32).collect())
}

pub async fn read_bytes<R: AsyncRead + Unpin>(r: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).await.map_err(|_| EtError::Read)?;
    Ok(buf)
}

pub async fn read_exact<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).await.map_err(|_| EtError::Read)?;
    Ok(())
}

/// Read a length-prefixed C string; the length includes the trailing NUL.
pub async fn read_cstr<R: AsyncRead + Unpin>(r: &mut R, max: usize) -> Result<String> {
    let len = read_word(r).await? as usize;
    if len == 0 || len > max {
        return Err(EtError::BadArg);
    }
    let mut buf = read_bytes(r, len).await?;
    if buf.pop() != Some(0) {
        return Err(EtError::BadArg);
    }
    String::from_utf8(buf).map_err(|_| EtError::BadArg)
}

pub async fn write_all<W: AsyncWrite + Unpin>(w: &mut W, buf: &[u8]) -> Result<()> {
    w.write_all(buf).await.map_err(|_| EtError::Write)?;
    Ok(())
}

pub async fn write_words<W: AsyncWrite + Unpin>(w: &mut W, words: &[u32]) -> Result<()> {
    let mut buf = Vec::with_capacity(words.len() * 4);
    for &word in words {
        WriteBytesExt::write_u32::<BigEndian>(&mut buf, word).map_err(|_| EtError::Write)?;
    }
    write_all(w, &buf).await
}

/// Append one big-endian word to an outgoing frame.
pub fn put_word(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

/// Append a C string: length word (including the NUL), bytes, NUL.
pub fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    put_word(buf, s.len() as u32 + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Read the three-word magic gate under the probe deadline. Anything
/// else (wrong words, short read, silence) is a `Timeout`/`Read` and
/// the caller drops the connection without a reply.
pub async fn read_magic_probe<R: AsyncRead + Unpin>(r: &mut R) -> Result<()> {
    let words = tokio::time::timeout(MAGIC_PROBE_DEADLINE, read_words(r, 3))
        .await
        .map_err(|_| EtError::Timeout)??;
    if words != MAGIC {
        return Err(EtError::Read);
    }
    Ok(())
}

/// Write a multi-part frame with vectored I/O, at most `max_chunk`
/// slices per syscall, resuming after partial writes.
pub async fn write_vectored_all<W: AsyncWrite + Unpin>(
    w: &mut W,
    parts: &[&[u8]],
    max_chunk: usize,
) -> Result<()> {
    let max_chunk = max_chunk.max(1);
    let mut idx = 0;
    let mut off = 0;

    while idx < parts.len() {
        if parts[idx].len() == off {
            idx += 1;
            off = 0;
            continue;
        }
        let mut slices: Vec<IoSlice> = Vec::with_capacity(max_chunk);
        slices.push(IoSlice::new(&parts[idx][off..]));
        for part in parts[idx + 1..].iter().take(max_chunk - 1) {
            if !part.is_empty() {
                slices.push(IoSlice::new(part));
            }
        }

        let mut written = w.write_vectored(&slices).await.map_err(|_| EtError::Write)?;
        if written == 0 {
            return Err(EtError::Write);
        }
        while written > 0 {
            let remaining = parts[idx].len() - off;
            if written >= remaining {
                written -= remaining;
                idx += 1;
                off = 0;
                while idx < parts.len() && parts[idx].is_empty() {
                    idx += 1;
                }
                if idx == parts.len() {
                    break;
                }
            } else {
                off += written;
                written = 0;
            }
        }
    }
    Ok(())
}

/// Hand every datagram already queued on the socket to `f`, without
/// blocking. Returns how many were drained.
pub fn drain_datagrams(
    socket: &UdpSocket,
    buf: &mut [u8],
    mut f: impl FnMut(&[u8], std::net::SocketAddr),
) -> usize {
    let mut count = 0;
    while let Ok((len, from)) = socket.try_recv_from(buf) {
        f(&buf[..len], from);
        count += 1;
    }
    count
}

/// Cursor over a received datagram; every accessor fails cleanly on a
/// truncated or malformed frame.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> FrameReader<'a> {
        FrameReader { buf, pos: 0 }
    }

    pub fn word(&mut self) -> Result<u32> {
        if self.pos + 4 > self.buf.len() {
            return Err(EtError::BadArg);
        }
        let v = BigEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    /// Raw (unswapped) word, for fields carried in network order already.
    pub fn raw_word(&mut self) -> Result<[u8; 4]> {
        if self.pos + 4 > self.buf.len() {
            return Err(EtError::BadArg);
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(b)
    }

    /// Length-prefixed C string (length includes the NUL); a zero length
    /// yields an empty string, matching the legacy frames.
    pub fn cstr(&mut self, max: usize) -> Result<String> {
        let len = self.word()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        if len > max || self.pos + len > self.buf.len() {
            return Err(EtError::BadArg);
        }
        let bytes = &self.buf[self.pos..self.pos + len - 1];
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| EtError::BadArg)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstr_round_trip_through_frame_reader() {
        let mut buf = Vec::new();
        put_word(&mut buf, 7);
        put_cstr(&mut buf, "hello");
        put_cstr(&mut buf, "");

        let mut rd = FrameReader::new(&buf);
        assert_eq!(rd.word().unwrap(), 7);
        assert_eq!(rd.cstr(64).unwrap(), "hello");
        assert_eq!(rd.cstr(64).unwrap(), "");
        assert_eq!(rd.remaining(), 0);
    }

    #[test]
    fn frame_reader_rejects_truncation() {
        let mut buf = Vec::new();
        put_word(&mut buf, 10);
        let mut rd = FrameReader::new(&buf);
        // Length says 10 bytes follow but the frame ends here.
        assert!(rd.cstr(64).is_err());
    }

    #[tokio::test]
    async fn vectored_write_preserves_part_order() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let parts: Vec<&[u8]> = vec![b"ab", b"", b"cdef", b"g"];
        tokio::spawn(async move {
            write_vectored_all(&mut a, &parts, 2).await.unwrap();
        });
        let got = read_bytes(&mut b, 7).await.unwrap();
        assert_eq!(&got, b"abcdefg");
    }

    #[tokio::test]
    async fn magic_probe_times_out_on_silence() {
        let (_a, mut b) = tokio::io::duplex(64);
        assert_eq!(read_magic_probe(&mut b).await.unwrap_err(), EtError::Timeout);
    }
}
