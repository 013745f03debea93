// Line-oriented scanner over HLS playlist text, producing typed tag events.
// The scanner borrows from the owned playlist buffer; callers keep byte
// offsets into it so an index survives a buffer swap on refresh.

use crate::config::DRM_IV_LEN;
use crate::error::CollectorError;
use crate::http::ByteRange;

/// One classified playlist line.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistLine<'a> {
    Tag(PlaylistTag<'a>),
    /// Fragment (or variant) URI, relative or absolute.
    Uri(&'a str),
    /// A `#`-prefixed line that is not an `#EXT` tag.
    Comment(&'a str),
    Blank,
}

/// Recognized `#EXT` tags. Attribute lists stay unparsed here; callers run
/// [`AttributeList`] over them so each consumer applies its own typing.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistTag<'a> {
    ExtM3u,
    Version(&'a str),
    IndependentSegments,
    StreamInf(&'a str),
    IFrameStreamInf(&'a str),
    Media(&'a str),
    /// `#EXTINF:<duration>[,<title>]`
    Inf { duration: f64, title: &'a str },
    ByteRange(&'a str),
    TargetDuration(f64),
    MediaSequence(i64),
    Key(&'a str),
    ProgramDateTime(&'a str),
    AllowCache(&'a str),
    PlaylistType(&'a str),
    EndList,
    Discontinuity,
    IFramesOnly,
    Map(&'a str),
    /// `#EXT-X-FAXS-CM:<base64 metadata>` (in a media playlist) or the
    /// bare DRM-present marker (in a master manifest).
    FaxsContentMetadata(&'a str),
    /// `#EXT-X-X1-LIN-CK:<seconds>` deferred-license gating tag.
    DeferredLicenseWindow(&'a str),
    /// Any other `#EXT…` line, kept whole for the subscribed-tag dispatch.
    Unknown(&'a str),
}

/// Iterator over playlist lines. Lines terminate at LF; a preceding CR is
/// stripped. Yields the byte offset of each line start.
pub struct LineScanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> LineScanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Start scanning at the given byte offset.
    pub fn from_offset(text: &'a str, offset: usize) -> Self {
        Self {
            text,
            pos: offset.min(text.len()),
        }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for LineScanner<'a> {
    /// `(line_start_offset, line_without_terminator)`
    type Item = (usize, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.text.len() {
            return None;
        }
        let start = self.pos;
        let rest = &self.text[start..];
        let (mut line, next_pos) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], start + idx + 1),
            None => (rest, self.text.len()),
        };
        if let Some(stripped) = line.strip_suffix('\r') {
            line = stripped;
        }
        self.pos = next_pos;
        Some((start, line))
    }
}

/// Classify a single line. Unknown `#EXT` tags never fail the parse.
pub fn classify_line(line: &str) -> PlaylistLine<'_> {
    if line.is_empty() {
        return PlaylistLine::Blank;
    }
    if !line.starts_with('#') {
        return PlaylistLine::Uri(line);
    }
    let Some(ext) = line.strip_prefix("#EXT") else {
        return PlaylistLine::Comment(line);
    };

    let tag = if ext.starts_with("M3U") {
        PlaylistTag::ExtM3u
    } else if let Some(body) = ext.strip_prefix("INF:") {
        let (duration, title) = match body.split_once(',') {
            Some((d, t)) => (d, t),
            None => (body, ""),
        };
        PlaylistTag::Inf {
            duration: duration.trim().parse::<f64>().unwrap_or(0.0),
            title,
        }
    } else if let Some(body) = ext.strip_prefix("-X-BYTERANGE:") {
        PlaylistTag::ByteRange(body)
    } else if let Some(body) = ext.strip_prefix("-X-TARGETDURATION:") {
        PlaylistTag::TargetDuration(body.trim().parse::<f64>().unwrap_or(0.0))
    } else if let Some(body) = ext.strip_prefix("-X-MEDIA-SEQUENCE:") {
        PlaylistTag::MediaSequence(body.trim().parse::<i64>().unwrap_or(0))
    } else if let Some(body) = ext.strip_prefix("-X-KEY:") {
        PlaylistTag::Key(body)
    } else if let Some(body) = ext.strip_prefix("-X-PROGRAM-DATE-TIME:") {
        PlaylistTag::ProgramDateTime(body)
    } else if let Some(body) = ext.strip_prefix("-X-ALLOW-CACHE:") {
        PlaylistTag::AllowCache(body)
    } else if let Some(body) = ext.strip_prefix("-X-PLAYLIST-TYPE:") {
        PlaylistTag::PlaylistType(body)
    } else if ext.starts_with("-X-ENDLIST") {
        PlaylistTag::EndList
    } else if ext.starts_with("-X-I-FRAMES-ONLY") {
        PlaylistTag::IFramesOnly
    } else if let Some(body) = ext.strip_prefix("-X-I-FRAME-STREAM-INF:") {
        PlaylistTag::IFrameStreamInf(body)
    } else if ext.starts_with("-X-DISCONTINUITY") {
        // Also matches -X-DISCONTINUITY-SEQUENCE; the sequence form is not
        // tracked separately.
        if ext.starts_with("-X-DISCONTINUITY-SEQUENCE") {
            PlaylistTag::Unknown(line)
        } else {
            PlaylistTag::Discontinuity
        }
    } else if let Some(body) = ext.strip_prefix("-X-MAP:") {
        PlaylistTag::Map(body)
    } else if let Some(body) = ext.strip_prefix("-X-STREAM-INF:") {
        PlaylistTag::StreamInf(body)
    } else if let Some(body) = ext.strip_prefix("-X-MEDIA:") {
        PlaylistTag::Media(body)
    } else if let Some(body) = ext.strip_prefix("-X-VERSION:") {
        PlaylistTag::Version(body)
    } else if ext.starts_with("-X-INDEPENDENT-SEGMENTS") {
        PlaylistTag::IndependentSegments
    } else if let Some(body) = ext.strip_prefix("-X-FAXS-CM:") {
        PlaylistTag::FaxsContentMetadata(body)
    } else if ext.starts_with("-X-FAXS-CM") {
        PlaylistTag::FaxsContentMetadata("")
    } else if let Some(body) = ext.strip_prefix("-X-X1-LIN-CK:") {
        PlaylistTag::DeferredLicenseWindow(body)
    } else {
        PlaylistTag::Unknown(line)
    };
    PlaylistLine::Tag(tag)
}

/// One attribute value from a `KEY=VALUE[,KEY=VALUE]*` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrValue<'a>(&'a str);

impl<'a> AttrValue<'a> {
    /// Value with surrounding double quotes stripped.
    pub fn as_str(self) -> &'a str {
        let v = self.0;
        v.strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(v)
    }

    pub fn raw(self) -> &'a str {
        self.0
    }

    pub fn as_u64(self) -> Option<u64> {
        self.as_str().trim().parse().ok()
    }

    pub fn as_f64(self) -> Option<f64> {
        self.as_str().trim().parse().ok()
    }

    pub fn is_yes(self) -> bool {
        self.as_str() == "YES"
    }
}

/// Iterator over an attribute list. Commas inside double-quoted values are
/// literal; whitespace around names is stripped.
pub struct AttributeList<'a> {
    rest: &'a str,
}

impl<'a> AttributeList<'a> {
    pub fn new(attrs: &'a str) -> Self {
        Self { rest: attrs }
    }
}

impl<'a> Iterator for AttributeList<'a> {
    type Item = (&'a str, AttrValue<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = self.rest.trim_start();
            if rest.is_empty() {
                self.rest = rest;
                return None;
            }

            // find the end of this attribute, honoring quoted commas
            let mut in_quotes = false;
            let mut end = rest.len();
            for (idx, ch) in rest.char_indices() {
                match ch {
                    '"' => in_quotes = !in_quotes,
                    ',' if !in_quotes => {
                        end = idx;
                        break;
                    }
                    _ => {}
                }
            }
            let attr = &rest[..end];
            self.rest = rest.get(end + 1..).unwrap_or("");

            if let Some((name, value)) = attr.split_once('=') {
                return Some((name.trim(), AttrValue(value)));
            }
            // attribute without '=' is malformed; skip it
        }
    }
}

/// Parse `<length>[@<offset>]`. A missing offset is zero.
pub fn parse_byte_range(body: &str) -> Option<ByteRange> {
    let body = body.trim();
    let (length, offset) = match body.split_once('@') {
        Some((len, off)) => (len.trim().parse().ok()?, off.trim().parse().ok()?),
        None => (body.parse().ok()?, 0),
    };
    Some(ByteRange { length, offset })
}

/// Decode a 32-hex-digit IV (optional `0x` prefix) into 16 bytes. Inputs
/// of any other length are rejected.
pub fn parse_iv_hex(value: &str) -> Result<[u8; DRM_IV_LEN], CollectorError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.len() != DRM_IV_LEN * 2 {
        return Err(CollectorError::InvalidManifest {
            reason: format!("IV must be {} hex digits, got {}", DRM_IV_LEN * 2, digits.len()),
        });
    }
    let mut iv = [0u8; DRM_IV_LEN];
    hex::decode_to_slice(digits, &mut iv).map_err(|e| CollectorError::InvalidManifest {
        reason: format!("bad IV `{value}`: {e}"),
    })?;
    Ok(iv)
}

/// Parse an ISO-8601 `YYYY-MM-DDTHH:MM:SS[.fff]` program-date-time into
/// seconds. The timezone suffix is discarded: both tracks are assumed to
/// share one, and synchronization uses differences only.
pub fn parse_program_date_time(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.len() < 19 {
        return None;
    }
    let (stamp, rest) = value.split_at(19);
    let datetime =
        chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S").ok()?;
    let mut seconds = datetime.and_utc().timestamp() as f64;
    if let Some(frac) = rest.strip_prefix('.') {
        let digits: String = frac.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty()
            && let Ok(value) = digits.parse::<f64>()
        {
            seconds += value / 10f64.powi(digits.len() as i32);
        }
    }
    Some(seconds)
}
