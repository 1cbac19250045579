use std::fs;
use std::io::{self, Read};
use std::path::Path;

use chrono::{DateTime, Local};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::report::{FileMetadata, TIME_FORMAT};

const SNIFF_LEN: usize = 8192;

impl FileMetadata {
    /// Gathers every piece of metadata for a persisted sample in one pass.
    /// `original_name` is the client-supplied file name, which is recorded
    /// verbatim and used to derive the extension.
    pub fn collect(path: &Path, original_name: &str) -> io::Result<FileMetadata> {
        Ok(FileMetadata {
            filename: original_name.to_string(),
            extension: extension_of(original_name),
            mimetype: mime_type(path)?,
            size: size(path)?,
            last_modified: last_modified(path)?,
            md5_sum: md5_sum(path)?,
            sha1_sum: sha1_sum(path)?,
            sha256_sum: sha256_sum(path)?,
        })
    }
}

/// Extension of a file name including the dot (".exe"), or an empty string.
pub fn extension_of(name: &str) -> String {
    match Path::new(name).extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

/// Detects the mime type from content, not from the extension. Magic bytes
/// first; anything that is not a known binary format but decodes as UTF-8 is
/// reported as plain text.
pub fn mime_type(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let head = &buf[..filled];

    if let Some(kind) = infer::get(head) {
        return Ok(kind.mime_type().to_string());
    }

    let is_text = match std::str::from_utf8(head) {
        Ok(_) => true,
        // error_len() of None means the buffer merely cut a codepoint short.
        Err(e) => e.error_len().is_none(),
    };
    if is_text {
        Ok("text/plain; charset=utf-8".to_string())
    } else {
        Ok("application/octet-stream".to_string())
    }
}

pub fn size(path: &Path) -> io::Result<u64> {
    Ok(fs::metadata(path)?.len())
}

pub fn last_modified(path: &Path) -> io::Result<String> {
    let modified = fs::metadata(path)?.modified()?;
    let timestamp: DateTime<Local> = modified.into();
    Ok(timestamp.format(TIME_FORMAT).to_string())
}

pub fn md5_sum(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

pub fn sha1_sum(path: &Path) -> io::Result<String> {
    hex_digest::<Sha1>(path)
}

pub fn sha256_sum(path: &Path) -> io::Result<String> {
    hex_digest::<Sha256>(path)
}

fn hex_digest<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_sample() -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"this is a test!").unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn detects_plain_text() {
        let tmp = test_sample();
        let got = mime_type(tmp.path()).unwrap();
        assert_eq!(got, "text/plain; charset=utf-8");
    }

    #[test]
    fn reports_size_in_bytes() {
        let tmp = test_sample();
        assert_eq!(size(tmp.path()).unwrap(), 15);
    }

    #[test]
    fn md5_matches_known_digest() {
        let tmp = test_sample();
        let got = md5_sum(tmp.path()).unwrap();
        assert_eq!(got, "89742a09d9b41329b850b76a76b05e00");
    }

    #[test]
    fn sha1_matches_known_digest() {
        let tmp = test_sample();
        let got = sha1_sum(tmp.path()).unwrap();
        assert_eq!(got, "3aa4cb08d481cfe2b08e4a5e31777f642263d58d");
    }

    #[test]
    fn sha256_matches_known_digest() {
        let tmp = test_sample();
        let got = sha256_sum(tmp.path()).unwrap();
        assert_eq!(
            got,
            "ca7f87917e4f5029f81ec74d6711f1c587dca0fe91ec82b87bb77aeb15e6566d"
        );
    }

    #[test]
    fn extension_includes_the_dot() {
        assert_eq!(extension_of("malware.exe"), ".exe");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("noext"), "");
    }

    #[test]
    fn collect_fills_every_field() {
        let tmp = test_sample();
        let meta = FileMetadata::collect(tmp.path(), "sample.txt").unwrap();
        assert_eq!(meta.filename, "sample.txt");
        assert_eq!(meta.extension, ".txt");
        assert_eq!(meta.size, 15);
        assert_eq!(meta.mimetype, "text/plain; charset=utf-8");
        assert!(!meta.last_modified.is_empty());
        assert_eq!(meta.md5_sum, "89742a09d9b41329b850b76a76b05e00");
    }
}
