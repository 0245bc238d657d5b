//! Source media probing.
//!
//! Before a conversion starts, the source is probed with an
//! ffmpeg-style tool. The tool prints its findings as an
//! indentation-structured report on stderr; the parser rebuilds that
//! tree and pulls out the duration and the video dimensions. A report
//! that cannot be parsed aborts the conversion.

use std::path::Path;
use std::process::Stdio;

use regex::Regex;
use tokio::process::Command;

use crate::error::{DownloadError, Result};

/// What the engine needs to know about a conversion source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    /// Playback length in seconds.
    pub duration_secs: Option<f64>,
    /// Video width and height; `None` for audio-only sources.
    pub dimensions: Option<(u32, u32)>,
    /// Whether any video stream was reported.
    pub has_video: bool,
}

/// One node of the indentation tree: a line and the lines nested under
/// it.
#[derive(Debug)]
struct ReportNode {
    text: String,
    children: Vec<ReportNode>,
}

/// Rebuilds the report tree from indentation. Each line becomes a child
/// of the closest preceding line with smaller indentation.
fn build_tree(text: &str) -> Vec<ReportNode> {
    let mut roots: Vec<ReportNode> = Vec::new();
    // stack of (indent, child index path) flattened as raw pointers is
    // not needed; recursion by explicit stack of indents
    let mut stack: Vec<(usize, ReportNode)> = Vec::new();

    fn attach(roots: &mut Vec<ReportNode>, stack: &mut Vec<(usize, ReportNode)>, upto: usize) {
        while stack.len() > upto {
            let (_, node) = stack.pop().expect("stack length checked");
            match stack.last_mut() {
                Some((_, parent)) => parent.children.push(node),
                None => roots.push(node),
            }
        }
    }

    for raw in text.lines() {
        if raw.trim().is_empty() {
            continue;
        }
        let indent = raw.len() - raw.trim_start().len();
        let mut keep = stack.len();
        while keep > 0 && stack[keep - 1].0 >= indent {
            keep -= 1;
        }
        attach(&mut roots, &mut stack, keep);
        stack.push((
            indent,
            ReportNode {
                text: raw.trim().to_string(),
                children: Vec::new(),
            },
        ));
    }
    attach(&mut roots, &mut stack, 0);
    roots
}

fn walk<'a>(nodes: &'a [ReportNode], visit: &mut impl FnMut(&'a ReportNode)) {
    for node in nodes {
        visit(node);
        walk(&node.children, visit);
    }
}

/// Parses a probe report. Fails when no `Input #` stanza or no
/// `Duration` line is present, which means the tool did not recognise
/// the file well enough to convert it.
pub fn parse_probe_output(text: &str) -> Result<SourceInfo> {
    let tree = build_tree(text);
    let input = tree
        .iter()
        .find(|node| node.text.starts_with("Input #"))
        .ok_or_else(|| DownloadError::ProbeFailed {
            message: "no input stanza in probe report".to_string(),
        })?;

    let duration_re =
        Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("static regex");
    let video_re = Regex::new(r"Video:.*?(\d{2,5})x(\d{2,5})").expect("static regex");

    let mut info = SourceInfo::default();
    walk(std::slice::from_ref(input), &mut |node| {
        if let Some(caps) = duration_re.captures(&node.text) {
            let hours: f64 = caps[1].parse().unwrap_or(0.0);
            let minutes: f64 = caps[2].parse().unwrap_or(0.0);
            let seconds: f64 = caps[3].parse().unwrap_or(0.0);
            info.duration_secs = Some(hours * 3600.0 + minutes * 60.0 + seconds);
        }
        if node.text.contains("Video:") {
            info.has_video = true;
            if let Some(caps) = video_re.captures(&node.text) {
                let w: u32 = caps[1].parse().unwrap_or(0);
                let h: u32 = caps[2].parse().unwrap_or(0);
                if w > 0 && h > 0 {
                    info.dimensions = Some((w, h));
                }
            }
        }
    });
    if info.duration_secs.is_none() {
        return Err(DownloadError::ProbeFailed {
            message: "no duration in probe report".to_string(),
        });
    }
    Ok(info)
}

/// Runs the probe tool against a source file. ffmpeg-family tools print
/// the report on stderr and exit non-zero without an output file, so
/// the exit code is ignored and only the report matters.
pub async fn probe(executable: &Path, input: &Path) -> Result<SourceInfo> {
    let output = Command::new(executable)
        .arg("-i")
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| DownloadError::ProbeFailed {
            message: format!("cannot run {}: {}", executable.display(), e),
        })?;

    let mut report = String::from_utf8_lossy(&output.stderr).into_owned();
    if report.trim().is_empty() {
        report = String::from_utf8_lossy(&output.stdout).into_owned();
    }
    parse_probe_output(&report)
}
