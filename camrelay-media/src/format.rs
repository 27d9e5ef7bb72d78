//! Encoding format identifiers and preference-order negotiation

use crate::error::{MediaError, MediaResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Container and codec of the outbound chunk stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodingFormat {
    /// Container, e.g. `webm`
    pub container: String,
    /// Video codec, e.g. `vp9`
    pub codec: String,
}

impl EncodingFormat {
    /// Create a video format
    pub fn new(container: impl Into<String>, codec: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            codec: codec.into(),
        }
    }

    /// WebM with VP9
    pub fn webm_vp9() -> Self {
        Self::new("webm", "vp9")
    }

    /// WebM with VP8
    pub fn webm_vp8() -> Self {
        Self::new("webm", "vp8")
    }

    /// MIME type with codecs parameter, e.g. `video/webm;codecs=vp9`
    pub fn mime_type(&self) -> String {
        format!("video/{};codecs={}", self.container, self.codec)
    }

    /// Parse a MIME type of the form `video/<container>;codecs=<codec>`
    pub fn parse(mime: &str) -> MediaResult<Self> {
        let invalid = |reason: &str| MediaError::InvalidFormat {
            format: mime.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = mime.split(';').map(str::trim);
        let media_type = parts.next().unwrap_or_default();
        let container = media_type
            .strip_prefix("video/")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| invalid("expected video/<container>"))?;

        let codec = parts
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("codecs"))
            .map(|(_, value)| value.trim().trim_matches('"'))
            .filter(|codec| !codec.is_empty())
            .ok_or_else(|| invalid("missing codecs parameter"))?;

        Ok(Self::new(container.to_ascii_lowercase(), codec.to_ascii_lowercase()))
    }

    /// Fixed preference order: VP9 first, then VP8
    pub fn default_preferences() -> Vec<EncodingFormat> {
        vec![Self::webm_vp9(), Self::webm_vp8()]
    }
}

impl fmt::Display for EncodingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mime_type())
    }
}

impl FromStr for EncodingFormat {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Pick the first format in `preferences` that `supports` accepts.
///
/// Returns `UnsupportedFormat` listing every candidate when none matches.
pub fn select_format<F>(preferences: &[EncodingFormat], mut supports: F) -> MediaResult<EncodingFormat>
where
    F: FnMut(&EncodingFormat) -> bool,
{
    preferences
        .iter()
        .find(|format| supports(format))
        .cloned()
        .ok_or_else(|| MediaError::UnsupportedFormat {
            tried: preferences.iter().map(EncodingFormat::mime_type).collect(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type() {
        assert_eq!(EncodingFormat::webm_vp9().mime_type(), "video/webm;codecs=vp9");
        assert_eq!(EncodingFormat::webm_vp8().to_string(), "video/webm;codecs=vp8");
    }

    #[test]
    fn test_parse() {
        let format = EncodingFormat::parse("video/webm; codecs=\"VP9\"").unwrap();
        assert_eq!(format, EncodingFormat::webm_vp9());

        let format: EncodingFormat = "video/webm;codecs=vp8".parse().unwrap();
        assert_eq!(format, EncodingFormat::webm_vp8());

        assert!(EncodingFormat::parse("audio/ogg;codecs=opus").is_err());
        assert!(EncodingFormat::parse("video/webm").is_err());
        assert!(EncodingFormat::parse("video/;codecs=vp8").is_err());
    }

    #[test]
    fn test_select_prefers_first_supported() {
        let prefs = EncodingFormat::default_preferences();

        let chosen = select_format(&prefs, |_| true).unwrap();
        assert_eq!(chosen, EncodingFormat::webm_vp9());

        let chosen = select_format(&prefs, |f| f.codec == "vp8").unwrap();
        assert_eq!(chosen, EncodingFormat::webm_vp8());
    }

    #[test]
    fn test_select_none_supported() {
        let prefs = EncodingFormat::default_preferences();
        match select_format(&prefs, |_| false) {
            Err(MediaError::UnsupportedFormat { tried }) => {
                assert_eq!(tried, vec!["video/webm;codecs=vp9", "video/webm;codecs=vp8"]);
            }
            other => panic!("Expected UnsupportedFormat, got {:?}", other),
        }
    }
}
