//! Bencode decoding and encoding (BEP 3).
//!
//! `.torrent` files and the fast-resume blob are bencoded. Dictionary
//! keys are raw byte strings kept in sorted order so re-encoding is
//! canonical, which the info-hash computation depends on.

use std::collections::BTreeMap;

use crate::error::{DownloadError, Result};

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    /// Decodes a complete bencoded document, rejecting trailing bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder { data, pos: 0, depth: 0 };
        let value = dec.value()?;
        if dec.pos != data.len() {
            return Err(bad("trailing bytes after document"));
        }
        Ok(value)
    }

    /// Decodes the next value from `data`, returning it with the number
    /// of bytes consumed.
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize)> {
        let mut dec = Decoder { data, pos: 0, depth: 0 };
        let value = dec.value()?;
        Ok((value, dec.pos))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(map) => {
                out.push(b'd');
                for (key, value) in map {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn str(s: &str) -> Self {
        Bencode::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Dictionary lookup by string key.
    pub fn get(&self, key: &str) -> Option<&Bencode> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }
}

fn bad(message: impl Into<String>) -> DownloadError {
    DownloadError::CorruptTorrent {
        url: String::new(),
        message: message.into(),
    }
}

/// Nesting cap so a hostile document cannot overflow the stack.
const MAX_DEPTH: usize = 64;

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| bad("unexpected end of data"))
    }

    fn value(&mut self) -> Result<Bencode> {
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(Bencode::Bytes(self.bytes()?)),
            other => Err(bad(format!("unexpected byte {:#04x}", other))),
        }
    }

    fn int(&mut self) -> Result<Bencode> {
        self.pos += 1; // 'i'
        let end = self.find(b'e')?;
        let text = std::str::from_utf8(&self.data[self.pos..end])
            .map_err(|_| bad("non-ascii integer"))?;
        if text.is_empty() || text == "-" || (text.starts_with('0') && text.len() > 1) {
            return Err(bad("malformed integer"));
        }
        let n: i64 = text.parse().map_err(|_| bad("integer out of range"))?;
        self.pos = end + 1;
        Ok(Bencode::Int(n))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let colon = self.find(b':')?;
        let len_text = std::str::from_utf8(&self.data[self.pos..colon])
            .map_err(|_| bad("non-ascii length"))?;
        let len: usize = len_text.parse().map_err(|_| bad("malformed string length"))?;
        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| bad("string length past end of data"))?;
        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(bad("nesting too deep"));
        }
        Ok(())
    }

    fn list(&mut self) -> Result<Bencode> {
        self.enter()?;
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.pos += 1;
        self.depth -= 1;
        Ok(Bencode::List(items))
    }

    fn dict(&mut self) -> Result<Bencode> {
        self.enter()?;
        self.pos += 1; // 'd'
        let mut map = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        while self.peek()? != b'e' {
            if !matches!(self.peek()?, b'0'..=b'9') {
                return Err(bad("dictionary key must be a string"));
            }
            let key = self.bytes()?;
            if let Some(prev) = &last_key {
                if *prev >= key {
                    return Err(bad("dictionary keys out of order"));
                }
            }
            let value = self.value()?;
            last_key = Some(key.clone());
            map.insert(key, value);
        }
        self.pos += 1;
        self.depth -= 1;
        Ok(Bencode::Dict(map))
    }

    fn find(&self, byte: u8) -> Result<usize> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == byte)
            .map(|i| self.pos + i)
            .ok_or_else(|| bad("unexpected end of data"))
    }
}

/// Locates the raw byte span of the `info` dictionary inside a bencoded
/// torrent document. The SHA-1 of exactly these bytes is the info-hash.
pub fn info_dict_span(data: &[u8]) -> Result<&[u8]> {
    if data.first() != Some(&b'd') {
        return Err(bad("document is not a dictionary"));
    }
    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        let (key, key_len) = {
            let mut dec = Decoder { data: &data[pos..], pos: 0, depth: 0 };
            let key = dec.bytes()?;
            (key, dec.pos)
        };
        pos += key_len;
        let (_, value_len) = Bencode::decode_prefix(&data[pos..])?;
        if key == b"info" {
            return Ok(&data[pos..pos + value_len]);
        }
        pos += value_len;
    }
    Err(bad("missing info dictionary"))
}
