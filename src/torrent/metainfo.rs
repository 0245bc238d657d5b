//! `.torrent` metainfo parsing.

use sha1::{Digest, Sha1};
use std::path::PathBuf;

use super::bencode::{info_dict_span, Bencode};
use crate::error::{DownloadError, Result};
use crate::protocol::InfoHash;

/// Upper bound on accepted `.torrent` files. Anything larger is treated
/// as a server error page, not a real torrent.
pub const MAX_METAINFO_SIZE: usize = 1024 * 1024;

/// Cheap pre-parse check on a fetched body. Every bencoded torrent is a
/// dictionary, so the first byte must be `d`; HTML error pages and
/// redirect stubs fail here before the full decode runs.
pub fn looks_like_torrent(body: &[u8]) -> bool {
    !body.is_empty() && body[0] == b'd' && body.len() <= MAX_METAINFO_SIZE
}

/// Parsed torrent metainfo, trimmed to what the transfer engine needs.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the raw bencoded info dictionary.
    pub info_hash: InfoHash,
    /// Suggested name for the file or containing directory.
    pub name: String,
    /// Bytes per piece (last piece may be shorter).
    pub piece_length: u64,
    /// SHA-1 hash per piece.
    pub pieces: Vec<[u8; 20]>,
    /// Files with their byte offsets in the concatenated stream.
    pub files: Vec<TorrentFile>,
    /// Sum of all file lengths.
    pub total_size: u64,
    /// Single-file torrents place the file directly in the download dir.
    pub is_single_file: bool,
    /// Tracker URLs, primary announce first, then flattened announce-list
    /// tiers with duplicates removed.
    pub trackers: Vec<String>,
    /// Web seed URLs (BEP 19).
    pub webseeds: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TorrentFile {
    /// Relative path inside the download directory.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset in the concatenated piece stream.
    pub offset: u64,
}

impl Metainfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_METAINFO_SIZE {
            return Err(corrupt("torrent file too large"));
        }
        let root = Bencode::decode(data)?;
        if root.as_dict().is_none() {
            return Err(corrupt("root is not a dictionary"));
        }

        let info_bytes = info_dict_span(data)?;
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let digest: [u8; 20] = hasher.finalize().into();
        let info_hash = InfoHash(digest);

        let info = root.get("info").ok_or_else(|| corrupt("missing info"))?;
        let name = info
            .get("name")
            .and_then(Bencode::as_str)
            .ok_or_else(|| corrupt("missing name"))?
            .to_string();
        let piece_length = info
            .get("piece length")
            .and_then(Bencode::as_int)
            .filter(|&n| n > 0)
            .ok_or_else(|| corrupt("missing or invalid piece length"))?
            as u64;

        let pieces_raw = info
            .get("pieces")
            .and_then(Bencode::as_bytes)
            .ok_or_else(|| corrupt("missing pieces"))?;
        if pieces_raw.is_empty() || pieces_raw.len() % 20 != 0 {
            return Err(corrupt("pieces length is not a multiple of 20"));
        }
        let pieces: Vec<[u8; 20]> = pieces_raw
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let (files, is_single_file) = parse_files(info, &name)?;
        let total_size: u64 = files.iter().map(|f| f.length).sum();

        let expected_pieces = total_size.div_ceil(piece_length) as usize;
        if pieces.len() != expected_pieces {
            return Err(corrupt("piece count does not match total size"));
        }

        let trackers = parse_trackers(&root);
        let webseeds = parse_webseeds(&root);

        Ok(Metainfo {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            total_size,
            is_single_file,
            trackers,
            webseeds,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Length of the given piece, accounting for the short last piece.
    pub fn piece_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        (self.total_size - start).min(self.piece_length)
    }

    /// The files overlapping a piece, as `(file index, offset in file,
    /// length)` triples in stream order.
    pub fn files_in_piece(&self, index: usize) -> Vec<(usize, u64, u64)> {
        let piece_start = index as u64 * self.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut out = Vec::new();
        for (i, file) in self.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if file_end <= piece_start || file.offset >= piece_end {
                continue;
            }
            let start = piece_start.max(file.offset);
            let end = piece_end.min(file_end);
            out.push((i, start - file.offset, end - start));
        }
        out
    }
}

fn corrupt(message: impl Into<String>) -> DownloadError {
    DownloadError::CorruptTorrent {
        url: String::new(),
        message: message.into(),
    }
}

fn parse_files(info: &Bencode, name: &str) -> Result<(Vec<TorrentFile>, bool)> {
    if let Some(length) = info.get("length").and_then(Bencode::as_int) {
        if length < 0 {
            return Err(corrupt("negative file length"));
        }
        let file = TorrentFile {
            path: PathBuf::from(name),
            length: length as u64,
            offset: 0,
        };
        return Ok((vec![file], true));
    }

    let entries = info
        .get("files")
        .and_then(Bencode::as_list)
        .ok_or_else(|| corrupt("missing length and files"))?;
    let mut files = Vec::with_capacity(entries.len());
    let mut offset = 0u64;
    for entry in entries {
        let length = entry
            .get("length")
            .and_then(Bencode::as_int)
            .filter(|&n| n >= 0)
            .ok_or_else(|| corrupt("file entry missing length"))? as u64;
        let components = entry
            .get("path")
            .and_then(Bencode::as_list)
            .ok_or_else(|| corrupt("file entry missing path"))?;
        let mut path = PathBuf::from(name);
        for component in components {
            let part = component
                .as_str()
                .ok_or_else(|| corrupt("non-utf8 path component"))?;
            // Refuse components that would escape the download directory.
            if part.is_empty() || part == ".." || part.contains('/') || part.contains('\\') {
                return Err(corrupt("unsafe path component"));
            }
            path.push(part);
        }
        files.push(TorrentFile {
            path,
            length,
            offset,
        });
        offset += length;
    }
    if files.is_empty() {
        return Err(corrupt("empty files list"));
    }
    Ok((files, false))
}

fn parse_trackers(root: &Bencode) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(announce) = root.get("announce").and_then(Bencode::as_str) {
        out.push(announce.to_string());
    }
    if let Some(tiers) = root.get("announce-list").and_then(Bencode::as_list) {
        for tier in tiers {
            if let Some(urls) = tier.as_list() {
                for url in urls {
                    if let Some(url) = url.as_str() {
                        if !out.iter().any(|t| t == url) {
                            out.push(url.to_string());
                        }
                    }
                }
            }
        }
    }
    out
}

fn parse_webseeds(root: &Bencode) -> Vec<String> {
    match root.get("url-list") {
        Some(Bencode::Bytes(b)) => std::str::from_utf8(b)
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        Some(Bencode::List(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_file_torrent() {
        let content = vec![7u8; 40_000];
        let doc = test_data::single_file_torrent("episode.mp4", &content, 16384, None);
        let meta = Metainfo::parse(&doc).unwrap();
        assert_eq!(meta.name, "episode.mp4");
        assert!(meta.is_single_file);
        assert_eq!(meta.total_size, 40_000);
        assert_eq!(meta.num_pieces(), 3);
        assert_eq!(meta.piece_size(0), 16384);
        assert_eq!(meta.piece_size(2), 40_000 - 2 * 16384);
        assert_eq!(meta.trackers.len(), 1);
    }

    #[test]
    fn info_hash_is_stable_across_reencodings() {
        let content = vec![1u8; 100];
        let a = test_data::single_file_torrent("x", &content, 64, None);
        let b = test_data::single_file_torrent("x", &content, 64, Some("http://seed/"));
        let ma = Metainfo::parse(&a).unwrap();
        let mb = Metainfo::parse(&b).unwrap();
        // url-list sits outside the info dict and must not affect the hash
        assert_eq!(ma.info_hash, mb.info_hash);
    }

    #[test]
    fn rejects_error_pages() {
        assert!(!looks_like_torrent(b"<html>not found</html>"));
        assert!(!looks_like_torrent(b""));
        assert!(looks_like_torrent(b"d4:infod..."));
        assert!(Metainfo::parse(b"<html></html>").is_err());
    }

    #[test]
    fn rejects_escaping_paths() {
        // multi-file torrent with a ".." path component
        let doc = b"d4:infod5:filesld6:lengthi5e4:pathl2:..4:evileee4:name4:test12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(Metainfo::parse(doc).is_err());
    }

    #[test]
    fn files_in_piece_spans_boundaries() {
        let content = vec![0u8; 100];
        let doc = test_data::single_file_torrent("f", &content, 30, None);
        let meta = Metainfo::parse(&doc).unwrap();
        assert_eq!(meta.num_pieces(), 4);
        let spans = meta.files_in_piece(3);
        assert_eq!(spans, vec![(0, 90, 10)]);
    }
}
