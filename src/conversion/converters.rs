//! Converter definitions.
//!
//! Converters are described by INI files in a definitions directory,
//! one file per platform family. A `[DEFAULT]` section carries values
//! shared by every converter in the file; each other section defines a
//! converter named after the section header. Parameters are a template
//! whose `{input}`, `{output}` and `{ssize}` placeholders are filled in
//! per task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{DownloadError, Result};

/// One converter definition.
#[derive(Debug, Clone)]
pub struct ConverterInfo {
    /// Stable lookup key: the display name lowercased with every
    /// non-word character stripped ("Apple iPad!" becomes "appleipad").
    pub identifier: String,
    pub name: String,
    pub executable: String,
    /// Whitespace-separated argument template.
    pub parameters: String,
    /// Extension for the output file, without the dot.
    pub extension: Option<String>,
    /// Target screen size substituted for `{ssize}`.
    pub screen_size: Option<(u32, u32)>,
    /// Target bitrate substituted for `{bitrate}`.
    pub bitrate: Option<String>,
    pub media_type: Option<String>,
    /// Platform gate: the converter is loaded only on this platform
    /// ("linux", "osx" or "windows").
    pub only_on: Option<String>,
}

impl ConverterInfo {
    /// Expands the parameter template into argv entries. Placeholders
    /// are substituted per token so paths with spaces stay one
    /// argument.
    pub fn build_arguments(
        &self,
        input: &Path,
        output: &Path,
        ssize: &str,
    ) -> Vec<String> {
        let bitrate = self.bitrate.as_deref().unwrap_or("");
        self.parameters
            .split_whitespace()
            .map(|token| {
                token
                    .replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{ssize}", ssize)
                    .replace("{bitrate}", bitrate)
            })
            .collect()
    }

    /// Output filename for a given source, swapping in the converter's
    /// extension and appending the identifier.
    pub fn output_name_for(&self, input: &Path) -> String {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        match &self.extension {
            Some(ext) => format!("{}.{}.{}", stem, self.identifier, ext),
            None => format!("{}.{}", stem, self.identifier),
        }
    }
}

/// Derives the lookup identifier from a display name.
pub fn identifier_for(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// Platform name as converter definitions spell it.
fn current_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "osx",
        other => other,
    }
}

/// Parses a "WxH" screen size.
fn parse_screen_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Scales a source video into a target box, preserving aspect ratio and
/// never upscaling. Both output dimensions are floored to even numbers,
/// which every H.264 encoder requires. Integer arithmetic keeps the
/// choice of limiting axis exact at the box boundaries.
pub fn scaled_size(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (sw, sh) = source;
    let (tw, th) = target;
    if sw == 0 || sh == 0 {
        return (tw & !1, th & !1);
    }
    if sw <= tw && sh <= th {
        return (sw & !1, sh & !1);
    }
    let (sw, sh, tw, th) = (sw as u64, sh as u64, tw as u64, th as u64);
    // scale = min(tw/sw, th/sh); width limits when tw*sh <= th*sw
    let (w, h) = if tw * sh <= th * sw {
        (tw, sh * tw / sw)
    } else {
        (sw * th / sh, th)
    };
    ((w as u32) & !1, (h as u32) & !1)
}

/// All converters known to the manager.
#[derive(Debug, Default)]
pub struct ConverterRegistry {
    converters: Vec<ConverterInfo>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `.conv` file in a directory. Files that fail to
    /// parse are skipped with a log line; a bad definition must not
    /// take down the rest.
    pub fn load_from_dir(dir: &Path) -> Self {
        let mut registry = Self::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), "cannot read converter dir: {err}");
                return registry;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "conv").unwrap_or(false) {
                match std::fs::read_to_string(&path) {
                    Ok(text) => registry.load_definitions(&text),
                    Err(err) => {
                        tracing::warn!(file = %path.display(), "skipping converter file: {err}");
                    }
                }
            }
        }
        registry
    }

    /// Parses one definitions file and adds its converters.
    pub fn load_definitions(&mut self, text: &str) {
        let sections = parse_ini(text);
        let defaults = sections
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("DEFAULT"))
            .map(|(_, options)| options.clone())
            .unwrap_or_default();

        for (name, options) in sections {
            if name.eq_ignore_ascii_case("DEFAULT") {
                continue;
            }
            let mut merged = defaults.clone();
            merged.extend(options);

            if let Some(only_on) = merged.get("only_on") {
                if !only_on.eq_ignore_ascii_case(current_platform()) {
                    continue;
                }
            }

            let executable = match merged.get("executable") {
                Some(e) => e.clone(),
                None => {
                    tracing::warn!(converter = %name, "definition has no executable, skipped");
                    continue;
                }
            };
            let parameters = match merged.get("parameters") {
                Some(p) => p.clone(),
                None => {
                    tracing::warn!(converter = %name, "definition has no parameters, skipped");
                    continue;
                }
            };
            self.converters.push(ConverterInfo {
                identifier: identifier_for(&name),
                name,
                executable,
                parameters,
                extension: merged.get("extension").cloned(),
                screen_size: merged.get("ssize").and_then(|v| parse_screen_size(v)),
                bitrate: merged.get("bitrate").cloned(),
                media_type: merged.get("mediatype").cloned(),
                only_on: merged.get("only_on").cloned(),
            });
        }
    }

    pub fn add(&mut self, converter: ConverterInfo) {
        self.converters.push(converter);
    }

    pub fn converters(&self) -> &[ConverterInfo] {
        &self.converters
    }

    pub fn get(&self, identifier: &str) -> Result<&ConverterInfo> {
        self.converters
            .iter()
            .find(|c| c.identifier == identifier)
            .ok_or_else(|| DownloadError::ConverterNotFound {
                name: identifier.to_string(),
            })
    }

    /// Resolves a converter's executable against the configured search
    /// directories, falling back to PATH lookup by bare name.
    pub fn resolve_executable(
        &self,
        info: &ConverterInfo,
        search_dirs: &[PathBuf],
    ) -> PathBuf {
        resolve_binary(&info.executable, search_dirs)
    }
}

/// Resolves a binary name against the configured search directories,
/// falling back to PATH lookup by bare name.
pub fn resolve_binary(name: &str, search_dirs: &[PathBuf]) -> PathBuf {
    for dir in search_dirs {
        let candidate = dir.join(name);
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from(name)
}

/// Minimal INI reader: `[section]` headers, `key = value` or
/// `key: value` pairs, `#`/`;` comments. Returns sections in file
/// order.
fn parse_ini(text: &str) -> Vec<(String, HashMap<String, String>)> {
    let mut sections: Vec<(String, HashMap<String, String>)> = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_string();
            sections.push((name, HashMap::new()));
            continue;
        }
        let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
            continue;
        };
        if let Some((_, options)) = sections.last_mut() {
            options.insert(
                key.trim().to_lowercase(),
                value.trim().to_string(),
            );
        }
    }
    sections
}
