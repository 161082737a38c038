//! Utility functions for filename derivation and path manipulation

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Suffix appended to the destination path for the in-progress working file
pub const INCOMPLETE_SUFFIX: &str = ".partial";

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 100;

/// Fallback filename when every derivation strategy comes up empty
pub(crate) const FALLBACK_FILENAME: &str = "download.bin";

/// Hex-encoded SHA-256 of a URL; keys resume records together with the
/// destination path.
pub fn url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Working file path for a destination (`dest` + ".partial")
pub(crate) fn working_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_owned();
    s.push(INCOMPLETE_SUFFIX);
    PathBuf::from(s)
}

/// Derive a filename from response headers and the URL.
///
/// Priority order: `Content-Disposition` parameter, URL query `filename`/`file`,
/// last URL path segment. Returns `None` when nothing usable was found; magic
/// byte sniffing ([`filename_from_magic`]) is the caller's next step.
pub(crate) fn filename_from_headers_and_url(
    url: &str,
    content_disposition: Option<&str>,
) -> Option<String> {
    // Strategy 1: Content-Disposition header (most reliable)
    if let Some(cd) = content_disposition
        && let Some(name) = parse_content_disposition(cd)
    {
        let name = sanitize_filename(&name);
        if is_usable_name(&name) {
            return Some(name);
        }
    }

    let parsed = url::Url::parse(url).ok()?;

    // Strategy 2: URL query parameters carrying filename hints
    for key in ["filename", "file"] {
        if let Some((_, value)) = parsed.query_pairs().find(|(k, _)| k == key) {
            let name = sanitize_filename(&value);
            if is_usable_name(&name) {
                return Some(name);
            }
        }
    }

    // Strategy 3: last URL path segment
    if let Some(segment) = parsed.path_segments().and_then(|mut s| s.next_back()) {
        let name = sanitize_filename(segment);
        if is_usable_name(&name) {
            return Some(name);
        }
    }

    None
}

/// Extract the filename parameter from a Content-Disposition header value.
fn parse_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        // RFC 5987 extended form: filename*=UTF-8''name
        if let Some(rest) = part.strip_prefix("filename*=") {
            let rest = rest.trim_matches('"');
            let name = rest.rsplit("''").next().unwrap_or(rest);
            if !name.is_empty() {
                return Some(percent_decode(name));
            }
        }
        if let Some(rest) = part.strip_prefix("filename=") {
            let name = rest.trim().trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Minimal percent-decoding for filename*= values.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3])
            && let Ok(byte) = u8::from_str_radix(hex, 16)
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Refine a filename candidate using the first response bytes.
///
/// For ZIP payloads with no usable name, the first local-file-header entry
/// name is borrowed. When the candidate has no extension, one is appended
/// based on the detected signature. Falls back to `download.bin` when the
/// candidate is unusable.
pub(crate) fn filename_from_magic(header: &[u8], candidate: Option<String>) -> String {
    let mut filename = candidate.unwrap_or_default();

    // ZIP local file header carries the first entry's name at offset 30
    if !is_usable_name(&filename)
        && header.len() >= 30
        && header.starts_with(&[0x50, 0x4B, 0x03, 0x04])
    {
        let name_len = u16::from_le_bytes([header[26], header[27]]) as usize;
        let start = 30;
        let end = start + name_len;
        if name_len > 0 && end <= header.len() {
            let zip_name = String::from_utf8_lossy(&header[start..end]).into_owned();
            let base = sanitize_filename(
                Path::new(&zip_name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
                    .as_str(),
            );
            if is_usable_name(&base) {
                filename = base;
            }
        }
    }

    // Append an extension from the signature when missing
    if is_usable_name(&filename)
        && Path::new(&filename).extension().is_none()
        && let Some(ext) = extension_for_magic(header)
    {
        filename.push('.');
        filename.push_str(ext);
    }

    if !is_usable_name(&filename) {
        filename = FALLBACK_FILENAME.to_string();
        if let Some(ext) = extension_for_magic(header) {
            filename = format!("download.{ext}");
        }
    }

    filename
}

/// Map well-known file signatures to an extension.
fn extension_for_magic(header: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (&[0x50, 0x4B, 0x03, 0x04], "zip"),
        (&[0x1F, 0x8B], "gz"),
        (&[0x42, 0x5A, 0x68], "bz2"),
        (&[0xFD, b'7', b'z', b'X', b'Z', 0x00], "xz"),
        (&[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C], "7z"),
        (&[b'R', b'a', b'r', b'!', 0x1A, 0x07], "rar"),
        (&[0x89, b'P', b'N', b'G'], "png"),
        (&[0xFF, 0xD8, 0xFF], "jpg"),
        (&[b'G', b'I', b'F', b'8'], "gif"),
        (&[b'%', b'P', b'D', b'F'], "pdf"),
        (&[0x7F, b'E', b'L', b'F'], "bin"),
    ];

    for (magic, ext) in SIGNATURES {
        if header.starts_with(magic) {
            return Some(ext);
        }
    }
    // ISO 9660 / MP4 carry their signature past the start of the file
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        return Some("mp4");
    }
    None
}

/// Keep a user-supplied name but borrow the probed extension when missing.
pub(crate) fn ensure_filename_ext(filename: &str, probe_filename: &str) -> String {
    if Path::new(filename).extension().is_some() {
        return filename.to_string();
    }
    match Path::new(probe_filename).extension() {
        Some(ext) => format!("{}.{}", filename, ext.to_string_lossy()),
        None => filename.to_string(),
    }
}

fn is_usable_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != "/" && name != "_"
}

/// Remove characters that are unsafe or invalid across platforms.
pub(crate) fn sanitize_filename(name: &str) -> String {
    // Treat backslashes as separators so path prefixes are stripped uniformly
    let name = name.replace('\\', "/");
    let name = name.rsplit('/').next().unwrap_or("").trim();

    let mut cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();

    if cleaned == "/" || cleaned == "\\" {
        cleaned = "_".to_string();
    }
    cleaned
}

/// Pick a collision-free destination path, preserving the base name.
///
/// A path is taken only when neither it nor its `.partial` working file
/// exists. Collisions append `(N)` before the extension; an existing
/// `name(3).ext` continues the sequence at `(4)`.
pub(crate) fn unique_file_path(path: &Path) -> PathBuf {
    if !path.exists() && !working_path(path).exists() {
        return path.to_path_buf();
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    // Continue an existing "(N)" counter instead of nesting parentheses
    let (base, mut counter) = split_counter_suffix(stem.trim());

    for _ in 0..MAX_RENAME_ATTEMPTS {
        let name = if ext.is_empty() {
            format!("{base}({counter})")
        } else {
            format!("{base}({counter}).{ext}")
        };
        let candidate = dir.join(name);
        if !candidate.exists() && !working_path(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }

    // Exhausted the counter budget; let the caller surface the collision
    path.to_path_buf()
}

/// Split a trailing "(N)" counter off a file stem, returning the base and the
/// next counter to try.
fn split_counter_suffix(stem: &str) -> (String, u32) {
    if stem.len() > 3 && stem.ends_with(')')
        && let Some(open) = stem.rfind('(')
    {
        let digits = &stem[open + 1..stem.len() - 1];
        if let Ok(num) = digits.parse::<u32>()
            && num > 0
        {
            return (stem[..open].to_string(), num + 1);
        }
    }
    (stem.to_string(), 1)
}
