//! Content sniffing for embedded payloads.
//!
//! Two stages: a `data:<mime>;base64,<data>` URI check on the UTF-8 form of the payload, then
//! a table of magic numbers. Neither matching means the caller falls back to
//! "text" or "binary" via [`is_text`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const FALLBACK_TEXT: &str = "text";
pub const FALLBACK_BINARY: &str = "binary";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_BINARY: &str = "application/octet-stream";

/// Native executable formats. Never materialized on disk except as a hex dump in the metadata.
pub const DANGEROUS_EXTENSIONS: [&str; 3] = ["exe", "elf", "macho"];

/// Printable-or-whitespace ratio a UTF-8 payload must exceed to count as text.
pub const TEXT_PRINTABLE_RATIO: f64 = 0.8;

static DATA_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^data:(image|video|audio|application)/([a-zA-Z0-9\-+.]+);base64,(.+)$")
        .expect("valid regex")
});

/// One magic-number rule: every `(offset, bytes)` part must match.
struct Signature {
    parts: &'static [(usize, &'static [u8])],
    ext: &'static str,
    mime: &'static str,
}

impl Signature {
    fn matches(&self, data: &[u8]) -> bool {
        self.parts.iter().all(|&(offset, magic)| {
            data.get(offset..offset + magic.len())
                .is_some_and(|x| x == magic)
        })
    }
}

macro_rules! sig {
    ($ext:literal, $mime:literal, $(($offset:expr, $magic:expr)),+) => {
        Signature {
            parts: &[$(($offset, $magic as &'static [u8])),+],
            ext: $ext,
            mime: $mime,
        }
    };
}

/// Ordered most-specific-first: shared container prefixes (`RIFF`, `ftyp`) are
/// disambiguated by their form type before any generic entry can match.
static SIGNATURES: &[Signature] = &[
    // images
    sig!("png", "image/png", (0, b"\x89PNG\r\n\x1a\n")),
    sig!("jpg", "image/jpeg", (0, b"\xFF\xD8\xFF")),
    sig!("gif", "image/gif", (0, b"GIF87a")),
    sig!("gif", "image/gif", (0, b"GIF89a")),
    sig!("webp", "image/webp", (0, b"RIFF"), (8, b"WEBP")),
    sig!("avif", "image/avif", (4, b"ftypavif")),
    sig!("heic", "image/heic", (4, b"ftypheic")),
    sig!("tiff", "image/tiff", (0, b"II\x2A\x00")),
    sig!("tiff", "image/tiff", (0, b"MM\x00\x2A")),
    sig!("ico", "image/x-icon", (0, b"\x00\x00\x01\x00")),
    // documents
    sig!("pdf", "application/pdf", (0, b"%PDF")),
    sig!("doc", "application/msword", (0, b"\xD0\xCF\x11\xE0")),
    // archives
    sig!("zip", "application/zip", (0, b"PK\x03\x04")),
    sig!("7z", "application/x-7z-compressed", (0, b"7z\xBC\xAF\x27\x1C")),
    sig!("rar", "application/x-rar-compressed", (0, b"Rar!\x1A\x07\x01\x00")),
    sig!("rar", "application/x-rar-compressed", (0, b"Rar!\x1A\x07\x00")),
    sig!("gz", "application/gzip", (0, b"\x1F\x8B")),
    sig!("bz2", "application/x-bzip2", (0, b"BZh")),
    sig!("tar", "application/x-tar", (257, b"ustar")),
    // audio
    sig!("wav", "audio/wav", (0, b"RIFF"), (8, b"WAVE")),
    sig!("mp3", "audio/mpeg", (0, b"ID3")),
    sig!("mp3", "audio/mpeg", (0, b"\xFF\xFB")),
    sig!("mp3", "audio/mpeg", (0, b"\xFF\xF3")),
    sig!("flac", "audio/flac", (0, b"fLaC")),
    sig!("ogg", "audio/ogg", (0, b"OggS")),
    // video
    sig!("avi", "video/x-msvideo", (0, b"RIFF"), (8, b"AVI ")),
    sig!("mp4", "video/mp4", (4, b"ftyp")),
    sig!("webm", "video/webm", (0, b"\x1A\x45\xDF\xA3")),
    // executables
    sig!("exe", "application/x-msdownload", (0, b"MZ")),
    sig!("elf", "application/x-executable", (0, b"\x7FELF")),
    sig!("macho", "application/x-mach-binary", (0, b"\xCF\xFA\xED\xFE")),
    sig!("macho", "application/x-mach-binary", (0, b"\xCE\xFA\xED\xFE")),
    sig!("macho", "application/x-mach-binary", (0, b"\xFE\xED\xFA\xCF")),
    sig!("macho", "application/x-mach-binary", (0, b"\xFE\xED\xFA\xCE")),
    // other
    sig!("bmp", "image/bmp", (0, b"BM")),
    sig!("xml", "application/xml", (0, b"<?xml")),
    sig!("json", "application/json", (0, b"{")),
];

fn mime_extension(mime: &str) -> Option<&'static str> {
    Some(match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/svg+xml" => "svg",
        "image/avif" => "avif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" => "wav",
        "application/pdf" => "pdf",
        "application/json" => "json",
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub ext: String,
    pub mime: String,
    /// Present when the payload was a base64 data URI; this is what gets written to disk.
    pub decoded: Option<Vec<u8>>,
}

pub fn detect_file_type(data: &[u8]) -> Option<Detected> {
    detect_data_uri(data).or_else(|| detect_magic(data))
}

fn detect_data_uri(data: &[u8]) -> Option<Detected> {
    let text = std::str::from_utf8(data).ok()?;
    let captures = DATA_URI.captures(text.trim())?;
    let mime = format!("{}/{}", &captures[1], &captures[2]);
    let ext = mime_extension(&mime)
        .map(String::from)
        .unwrap_or_else(|| captures[2].to_string());
    // an invalid base64 body keeps the type, the raw payload is written instead
    let decoded = STANDARD.decode(&captures[3]).ok();
    Some(Detected { ext, mime, decoded })
}

fn detect_magic(data: &[u8]) -> Option<Detected> {
    SIGNATURES
        .iter()
        .find(|x| x.matches(data))
        .map(|x| Detected {
            ext: x.ext.into(),
            mime: x.mime.into(),
            decoded: None,
        })
}

/// Returns the decoded text if `data` is UTF-8 with a printable-or-whitespace ratio above
/// [`TEXT_PRINTABLE_RATIO`].
pub fn is_text(data: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(data).ok()?;
    let total = text.chars().count();
    if total == 0 {
        return None;
    }
    let printable = text
        .chars()
        .filter(|&c| c.is_whitespace() || is_printable(c))
        .count();
    (printable as f64 / total as f64 > TEXT_PRINTABLE_RATIO).then_some(text)
}

/// Format characters (general category Cf).
const FORMAT_CHARS: [(u32, u32); 21] = [
    (0x00AD, 0x00AD),
    (0x0600, 0x0605),
    (0x061C, 0x061C),
    (0x06DD, 0x06DD),
    (0x070F, 0x070F),
    (0x0890, 0x0891),
    (0x08E2, 0x08E2),
    (0x180E, 0x180E),
    (0x200B, 0x200F),
    (0x202A, 0x202E),
    (0x2060, 0x2064),
    (0x2066, 0x206F),
    (0xFEFF, 0xFEFF),
    (0xFFF9, 0xFFFB),
    (0x110BD, 0x110BD),
    (0x110CD, 0x110CD),
    (0x13430, 0x1343F),
    (0x1BCA0, 0x1BCA3),
    (0x1D173, 0x1D17A),
    (0xE0001, 0xE0001),
    (0xE0020, 0xE007F),
];

/// Private use (Co) and the unassigned (Cn) areas: noncharacters, planes 4 to 13, and
/// plane 14 outside its tag and variation-selector blocks.
const UNPRINTABLE_AREAS: [(u32, u32); 7] = [
    (0xE000, 0xF8FF),
    (0xFDD0, 0xFDEF),
    (0x40000, 0xDFFFF),
    (0xE0000, 0xE0000),
    (0xE0002, 0xE001F),
    (0xE0080, 0xE00FF),
    (0xE01F0, 0x10FFFF),
];

/// Not a control, format, private-use or unassigned character, nor a separator other
/// than the ASCII space.
pub fn is_printable(c: char) -> bool {
    let x = c as u32;
    if c.is_control() || x & 0xFFFE == 0xFFFE {
        return false;
    }
    if c != ' ' && c.is_whitespace() {
        return false;
    }
    let within = |ranges: &[(u32, u32)]| ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(&x));
    !within(&FORMAT_CHARS) && !within(&UNPRINTABLE_AREAS)
}

pub fn is_dangerous(ext: &str) -> bool {
    DANGEROUS_EXTENSIONS.contains(&ext)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Text,
    Binary,
    Executable,
}

impl ContentCategory {
    pub fn of(ext: &str, mime: &str) -> Self {
        if is_dangerous(ext) {
            return Self::Executable;
        }
        match mime.split('/').next().unwrap_or_default() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "text" => Self::Text,
            _ => match ext {
                "pdf" | "doc" | "json" | "xml" => Self::Document,
                "zip" | "7z" | "rar" | "gz" | "bz2" | "tar" => Self::Archive,
                _ => Self::Binary,
            },
        }
    }
}

/// Final content decision for one payload, including the "text"/"binary" fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub detected: Option<Detected>,
    pub text: Option<String>,
}

impl Classification {
    pub fn of(data: &[u8]) -> Self {
        Self {
            detected: detect_file_type(data),
            text: is_text(data).map(String::from),
        }
    }

    pub fn is_text(&self) -> bool {
        self.text.is_some()
    }

    pub fn file_type(&self) -> &str {
        match &self.detected {
            Some(d) => &d.ext,
            None if self.is_text() => FALLBACK_TEXT,
            None => FALLBACK_BINARY,
        }
    }

    pub fn mime_type(&self) -> &str {
        match &self.detected {
            Some(d) => &d.mime,
            None if self.is_text() => MIME_TEXT,
            None => MIME_BINARY,
        }
    }

    pub fn category(&self) -> ContentCategory {
        match &self.detected {
            Some(d) => ContentCategory::of(&d.ext, &d.mime),
            None if self.is_text() => ContentCategory::Text,
            None => ContentCategory::Binary,
        }
    }

    pub fn is_dangerous(&self) -> bool {
        self.detected.as_ref().is_some_and(|d| is_dangerous(&d.ext))
    }

    /// Bytes for the raw and typed sidecars: the data-URI body if there is one.
    pub fn file_bytes<'a>(&'a self, raw: &'a [u8]) -> &'a [u8] {
        self.detected
            .as_ref()
            .and_then(|d| d.decoded.as_deref())
            .unwrap_or(raw)
    }
}
