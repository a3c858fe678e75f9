//! Sandbox path algebra. Pure string functions, no I/O.
//!
//! Paths are `/`-separated and relative to the sandbox root; the
//! sanitised form has no leading slash, no `.` or empty segments, and
//! resolves `..` lexically. A path that climbs above the root keeps a
//! leading `..` segment, which the filesystem rejects.

use globset::{GlobBuilder, GlobMatcher};

/// Characters never allowed in a path segment.
const INVALID_CHARS: &[char] = &['"', ':', '<', '>', '?', '|'];

/// Longest allowed path segment.
const MAX_SEGMENT_LENGTH: usize = 255;

pub fn sanitize(path: &str, allow_wildcards: bool) -> String {
    let cleaned: String = path
        .chars()
        .map(|c| if c == '\\' { '/' } else { c })
        .filter(|c| {
            !c.is_control() && !INVALID_CHARS.contains(c) && (allow_wildcards || *c != '*')
        })
        .collect();

    let mut parts: Vec<&str> = Vec::new();
    for part in cleaned.split('/') {
        if part.is_empty() || part == "." || is_all_dots(part) {
            continue;
        }
        if part == ".." {
            match parts.last() {
                Some(top) if *top != ".." => {
                    parts.pop();
                }
                _ => parts.push(".."),
            }
        } else if part.chars().count() > MAX_SEGMENT_LENGTH {
            let end = part
                .char_indices()
                .nth(MAX_SEGMENT_LENGTH)
                .map(|(i, _)| i)
                .unwrap_or(part.len());
            parts.push(&part[..end]);
        } else {
            parts.push(part);
        }
    }
    parts.join("/")
}

/// Three or more dots: not a navigable name.
fn is_all_dots(part: &str) -> bool {
    part.len() >= 3 && part.chars().all(|c| c == '.')
}

/// True if the sanitised path climbs above the root.
pub fn escapes_root(sanitized: &str) -> bool {
    sanitized == ".." || sanitized.starts_with("../")
}

pub fn combine(a: &str, b: &str) -> String {
    let a = sanitize(a, true);
    let b = sanitize(b, true);
    if a.is_empty() {
        b
    } else if b.is_empty() {
        a
    } else {
        sanitize(&format!("{a}/{b}"), true)
    }
}

/// Last segment of a path, `"root"` for the root itself.
pub fn get_name(path: &str) -> String {
    let path = sanitize(path, true);
    if path.is_empty() {
        return "root".to_string();
    }
    match path.rfind('/') {
        Some(i) => path[i + 1..].to_string(),
        None => path,
    }
}

/// Parent of a path; the root's parent is `".."`.
pub fn get_directory(path: &str) -> String {
    let path = sanitize(path, true);
    if path.is_empty() {
        return "..".to_string();
    }
    match path.rfind('/') {
        Some(i) => path[..i].to_string(),
        None => String::new(),
    }
}

/// True if `child` is `parent` or lies beneath it.
pub fn contains(parent: &str, child: &str) -> bool {
    let parent = sanitize(parent, false);
    let child = sanitize(child, false);
    if escapes_root(&child) {
        false
    } else if child == parent || parent.is_empty() {
        true
    } else {
        child.starts_with(&format!("{parent}/"))
    }
}

/// `path` relative to the mount `location`. Callers check `contains`.
pub fn to_local(path: &str, location: &str) -> String {
    let path = sanitize(path, false);
    let location = sanitize(location, false);
    if location.is_empty() {
        path
    } else if path == location {
        String::new()
    } else {
        path.strip_prefix(&format!("{location}/"))
            .unwrap_or(path.as_str())
            .to_string()
    }
}

/// Compiles one `find` segment. Only `*` is special and it never
/// crosses a `/`; every other glob metacharacter is literal.
pub fn segment_matcher(segment: &str) -> Result<GlobMatcher, globset::Error> {
    let mut pattern = String::with_capacity(segment.len());
    for (i, part) in segment.split('*').enumerate() {
        if i > 0 && !pattern.ends_with('*') {
            pattern.push('*');
        }
        pattern.push_str(&globset::escape(part));
    }
    let glob = GlobBuilder::new(&pattern).literal_separator(true).build()?;
    Ok(glob.compile_matcher())
}
