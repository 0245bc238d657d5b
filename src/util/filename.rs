//! Filename handling
//!
//! Sanitization of server-supplied names, collision-free allocation in a
//! target directory, and a move that falls back to copy-then-delete when
//! `rename` fails (cross-volume moves, or "file in use" on some platforms).

use crate::error::{DownloadError, Result};
use std::path::{Path, PathBuf};

/// Characters never allowed in a short filename, across platforms.
const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Sanitize a basename: strip path separators, reserved characters and
/// control characters. Returns `"download"` when nothing survives.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !RESERVED.contains(c) && !c.is_control())
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parse a filename out of a Content-Disposition header value.
pub fn from_content_disposition(header: &str) -> Option<String> {
    if let Some(start) = header.find("filename=") {
        let rest = &header[start + 9..];
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"')?;
            return Some(sanitize(&stripped[..end]));
        } else {
            let end = rest.find(';').unwrap_or(rest.len());
            return Some(sanitize(rest[..end].trim()));
        }
    }

    if let Some(start) = header.find("filename*=") {
        let rest = &header[start + 10..];
        if let Some(quote_start) = rest.find("''") {
            let encoded = &rest[quote_start + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(&encoded[..end]) {
                return Some(sanitize(&decoded));
            }
        }
    }

    None
}

/// Derive a filename from the last path segment of a URL.
pub fn from_url(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| sanitize(&d))
                .unwrap_or_else(|_| sanitize(s))
        })
}

/// First path in `dir` with the given basename that does not exist yet.
///
/// Collisions get a numeric suffix before the extension: `ep.mp3`,
/// `ep.1.mp3`, `ep.2.mp3`, ...
pub fn next_free_filename(dir: &Path, basename: &str) -> PathBuf {
    let candidate = dir.join(basename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match basename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (basename.to_string(), None),
    };

    let mut count = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{}.{}.{}", stem, count, ext),
            None => format!("{}.{}", stem, count),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        count += 1;
    }
}

/// Move `src` to `dst`, falling back to copy-then-delete when `rename`
/// fails (cross-volume move, or a "file in use" rename error).
pub async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::write(parent, e.to_string()))?;
    }

    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                "rename {:?} -> {:?} failed ({}), copying instead",
                src,
                dst,
                rename_err
            );
            tokio::fs::copy(src, dst)
                .await
                .map_err(|e| DownloadError::write(dst, e.to_string()))?;
            tokio::fs::remove_file(src)
                .await
                .map_err(|e| DownloadError::write(src, e.to_string()))?;
            Ok(())
        }
    }
}

/// Move `src` into `dir` under `basename`, resolving name collisions.
/// Returns the final path.
pub async fn move_to_dir(src: &Path, dir: &Path, basename: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::write(dir, e.to_string()))?;
    let dst = next_free_filename(dir, basename);
    move_file(src, &dst).await?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_strips_reserved_characters() {
        assert_eq!(sanitize("a/b\\c:d.mp3"), "abcd.mp3");
        assert_eq!(sanitize("ep?*<>|.mp3"), "ep.mp3");
        assert_eq!(sanitize("  spaced  "), "spaced");
        assert_eq!(sanitize("///"), "download");
    }

    #[test]
    fn content_disposition_parsing() {
        assert_eq!(
            from_content_disposition("attachment; filename=\"test.zip\""),
            Some("test.zip".to_string())
        );
        assert_eq!(
            from_content_disposition("attachment; filename=test.zip"),
            Some("test.zip".to_string())
        );
        assert_eq!(
            from_content_disposition("attachment; filename*=UTF-8''na%C3%AFve.mp3"),
            Some("naïve.mp3".to_string())
        );
        assert_eq!(from_content_disposition("inline"), None);
    }

    #[test]
    fn filename_from_url() {
        assert_eq!(
            from_url("https://example.com/path/ep%20one.mp3"),
            Some("ep one.mp3".to_string())
        );
        assert_eq!(from_url("https://example.com/"), None);
    }

    #[test]
    fn collision_free_allocation_is_pairwise_distinct() {
        let dir = tempdir().unwrap();
        let mut allocated = Vec::new();
        for _ in 0..5 {
            let path = next_free_filename(dir.path(), "ep.mp3");
            std::fs::write(&path, b"x").unwrap();
            allocated.push(path);
        }
        let mut unique = allocated.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
        assert_eq!(allocated[0].file_name().unwrap(), "ep.mp3");
        assert_eq!(allocated[1].file_name().unwrap(), "ep.1.mp3");
        assert_eq!(allocated[4].file_name().unwrap(), "ep.4.mp3");
    }

    #[test]
    fn collision_suffix_without_extension() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("data"), b"x").unwrap();
        let next = next_free_filename(dir.path(), "data");
        assert_eq!(next.file_name().unwrap(), "data.1");
    }

    #[tokio::test]
    async fn move_to_dir_resolves_collisions() {
        let dir = tempdir().unwrap();
        let src1 = dir.path().join("incoming1");
        let src2 = dir.path().join("incoming2");
        std::fs::write(&src1, b"one").unwrap();
        std::fs::write(&src2, b"two").unwrap();

        let target = dir.path().join("library");
        let first = move_to_dir(&src1, &target, "ep.mp3").await.unwrap();
        let second = move_to_dir(&src2, &target, "ep.mp3").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
        assert!(!src1.exists());
    }
}
