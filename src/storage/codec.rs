//! Blob layouts for quantized entries and raw vectors.
//!
//! Entry batch:
//! ```text
//! [num_entries: u32][m: u32]
//! For each entry: [id: u32][cell: u32][word_len: u16][word bytes][u16 * m]
//! ```
//!
//! Vector batch:
//! ```text
//! [num_vectors: u32][dim: u32]
//! For each vector: [id: u32][word_len: u16][word bytes][f32 * dim]
//! ```
//!
//! Assignment manifest: `[n: u32]` then `[id: u32][cell: u32]` pairs.
//! Tombstone list: `[n: u32]` then `[id: u32]` values.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WordPqError};
use crate::types::{CellId, QuantizedEntry, VectorId, WordVector};

pub fn encode_entries(entries: &[QuantizedEntry]) -> Result<Bytes> {
    let m = entries.first().map(|e| e.codes.len()).unwrap_or(0);
    let mut buf = BytesMut::new();
    buf.put_u32_le(entries.len() as u32);
    buf.put_u32_le(m as u32);
    for entry in entries {
        if entry.codes.len() != m {
            return Err(WordPqError::DimensionMismatch {
                expected: m,
                actual: entry.codes.len(),
            });
        }
        buf.put_u32_le(entry.id);
        buf.put_u32_le(entry.cell);
        put_word(&mut buf, &entry.word)?;
        for &code in &entry.codes {
            buf.put_u16_le(code);
        }
    }
    Ok(buf.freeze())
}

pub fn decode_entries(data: &[u8]) -> Result<Vec<QuantizedEntry>> {
    let mut buf = data;
    let n = take_u32(&mut buf, "entry count")? as usize;
    let m = take_u32(&mut buf, "code length")? as usize;

    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let id = take_u32(&mut buf, "entry id")?;
        let cell = take_u32(&mut buf, "entry cell")?;
        let word = take_word(&mut buf)?;
        ensure(&buf, m * 2, "entry codes")?;
        let codes = (0..m).map(|_| buf.get_u16_le()).collect();
        entries.push(QuantizedEntry {
            id,
            word,
            cell,
            codes,
        });
    }
    Ok(entries)
}

pub fn encode_vectors(vectors: &[WordVector]) -> Result<Bytes> {
    let dim = vectors.first().map(|v| v.dim()).unwrap_or(0);
    let mut buf = BytesMut::new();
    buf.put_u32_le(vectors.len() as u32);
    buf.put_u32_le(dim as u32);
    for v in vectors {
        if v.dim() != dim {
            return Err(WordPqError::DimensionMismatch {
                expected: dim,
                actual: v.dim(),
            });
        }
        buf.put_u32_le(v.id);
        put_word(&mut buf, &v.word)?;
        for &x in &v.values {
            buf.put_f32_le(x);
        }
    }
    Ok(buf.freeze())
}

pub fn decode_vectors(data: &[u8]) -> Result<Vec<WordVector>> {
    let mut buf = data;
    let n = take_u32(&mut buf, "vector count")? as usize;
    let dim = take_u32(&mut buf, "vector dim")? as usize;

    let mut vectors = Vec::with_capacity(n);
    for _ in 0..n {
        let id = take_u32(&mut buf, "vector id")?;
        let word = take_word(&mut buf)?;
        ensure(&buf, dim * 4, "vector values")?;
        let values = (0..dim).map(|_| buf.get_f32_le()).collect();
        vectors.push(WordVector { id, word, values });
    }
    Ok(vectors)
}

pub fn encode_assignments(pairs: &[(VectorId, CellId)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + pairs.len() * 8);
    buf.put_u32_le(pairs.len() as u32);
    for &(id, cell) in pairs {
        buf.put_u32_le(id);
        buf.put_u32_le(cell);
    }
    buf.freeze()
}

pub fn decode_assignments(data: &[u8]) -> Result<Vec<(VectorId, CellId)>> {
    let mut buf = data;
    let n = take_u32(&mut buf, "assignment count")? as usize;
    let mut pairs = Vec::with_capacity(n.min(buf.remaining() / 8));
    for _ in 0..n {
        let id = take_u32(&mut buf, "assignment id")?;
        let cell = take_u32(&mut buf, "assignment cell")?;
        pairs.push((id, cell));
    }
    Ok(pairs)
}

pub fn encode_ids(ids: &[VectorId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + ids.len() * 4);
    buf.put_u32_le(ids.len() as u32);
    for &id in ids {
        buf.put_u32_le(id);
    }
    buf.freeze()
}

pub fn decode_ids(data: &[u8]) -> Result<Vec<VectorId>> {
    let mut buf = data;
    let n = take_u32(&mut buf, "id count")? as usize;
    let mut ids = Vec::with_capacity(n.min(buf.remaining() / 4));
    for _ in 0..n {
        ids.push(take_u32(&mut buf, "id")?);
    }
    Ok(ids)
}

fn put_word(buf: &mut BytesMut, word: &str) -> Result<()> {
    let len = u16::try_from(word.len())
        .map_err(|_| WordPqError::Serialization(format!("word too long: {} bytes", word.len())))?;
    buf.put_u16_le(len);
    buf.put_slice(word.as_bytes());
    Ok(())
}

fn take_word(buf: &mut &[u8]) -> Result<String> {
    ensure(buf, 2, "word length")?;
    let len = buf.get_u16_le() as usize;
    ensure(buf, len, "word")?;
    let word = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(word)
}

fn take_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    ensure(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

fn ensure(buf: &&[u8], needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(WordPqError::Serialization(format!(
            "blob truncated at {what}"
        )));
    }
    Ok(())
}
