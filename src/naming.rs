//! Local file naming: collision-free working names, names derived from URLs and
//! `Content-Disposition` headers, and stripping of the working suffix.

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::DownloadError;

/// Used when neither the server nor the URL path yields a file name.
pub const FALLBACK_FILE_NAME: &str = "download";

/// Returns the working file name (`name.suffix`) for `remote_name` inside `directory`.
///
/// If `directory/remote_name` already exists, ` (n)` is inserted before the extension with
/// the smallest `n >= 1` whose `base (n).ext` is free. The extension is whatever follows
/// the last dot, so `example.tar.gz` becomes `example.tar (1).gz`.
pub fn unique_file_name(
    remote_name: &str,
    directory: &Path,
    suffix: &str,
) -> Result<String, DownloadError> {
    if remote_name.is_empty() {
        return Err(DownloadError::invalid("remote file name is empty"));
    }
    if directory.as_os_str().is_empty() {
        return Err(DownloadError::invalid("directory is empty"));
    }
    if suffix.is_empty() {
        return Err(DownloadError::invalid("downloading suffix is empty"));
    }

    if !directory.join(remote_name).exists() {
        return Ok(format!("{remote_name}.{suffix}"));
    }

    let (base, extension) = split_extension(remote_name);
    let candidate = |n: u32| match extension {
        Some(ext) => format!("{base} ({n}).{ext}"),
        None => format!("{base} ({n})"),
    };
    let mut n = 1;
    while directory.join(candidate(n)).exists() {
        n += 1;
    }
    Ok(format!("{}.{suffix}", candidate(n)))
}

/// Splits at the last dot. `None` when the name has no dot at all.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    }
}

/// Whether `path` still carries the `.suffix` working extension.
pub fn has_working_suffix(path: &Path, suffix: &str) -> bool {
    strip_working_suffix(path, suffix).is_some()
}

/// The final path of a working file: `dir/name.zip.downloading` -> `dir/name.zip`.
pub fn strip_working_suffix(path: &Path, suffix: &str) -> Option<PathBuf> {
    if suffix.is_empty() {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    let stripped = name.strip_suffix(suffix)?.strip_suffix('.')?;
    if stripped.is_empty() {
        return None;
    }
    Some(path.with_file_name(stripped))
}

/// The percent-decoded last path segment of `url`, or [`FALLBACK_FILE_NAME`].
pub fn file_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .and_then(|name| sanitize_remote_name(&name))
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// Extracts the file name from a `Content-Disposition` header value.
///
/// Handles:
/// - `attachment; filename*=UTF-8''na%C3%AFve.txt` (RFC 5987, preferred)
/// - `attachment; filename="report.pdf"`
/// - `attachment; filename=report.pdf`
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in header.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if key == "filename*" {
            // charset'language'percent-encoded
            let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
            extended = urlencoding::decode(encoded).ok().map(|v| v.into_owned());
        } else if key == "filename" {
            plain = Some(value.trim_matches('"').to_string());
        }
    }

    extended
        .or(plain)
        .and_then(|name| sanitize_remote_name(&name))
}

/// Drops any directory part a server may put into a file name.
fn sanitize_remote_name(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}
