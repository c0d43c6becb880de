// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream keys: the routing tokens Apps subscribe with.
//!
//! The same normalisation runs at subscribe time and at publish time, so
//! fan-out always finds the subscribers that asked for a result. A bare
//! `transcription` is shorthand for `transcription:en-US`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default language when a media subscription omits one.
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// A validated BCP-47-style language tag, stored in canonical case
/// (`en-US`, `fr-FR`, `es`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageTag(String);

fn language_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]{2,3}(-[A-Za-z0-9]{2,8})*$").unwrap())
}

impl LanguageTag {
    /// Parse and canonicalise a language tag: language subtag lowercased,
    /// two-letter region subtag uppercased.
    pub fn parse(raw: &str) -> Result<Self, StreamKeyError> {
        let raw = raw.trim();
        if !language_re().is_match(raw) {
            return Err(StreamKeyError::InvalidLanguage(raw.to_owned()));
        }
        let mut parts = raw.split('-');
        let mut canonical = match parts.next() {
            Some(lang) => lang.to_ascii_lowercase(),
            None => return Err(StreamKeyError::InvalidLanguage(raw.to_owned())),
        };
        for part in parts {
            canonical.push('-');
            if part.len() == 2 {
                canonical.push_str(&part.to_ascii_uppercase());
            } else {
                canonical.push_str(part);
            }
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Language-only comparison: `en-US` and `en-GB` share a base language.
    pub fn same_base(&self, other: &LanguageTag) -> bool {
        let a = self.0.split('-').next().unwrap_or_default();
        let b = other.0.split('-').next().unwrap_or_default();
        a == b
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error produced while parsing a stream key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKeyError {
    UnknownStream(String),
    InvalidLanguage(String),
    /// Translation key missing the `-to-` separator or a side of it.
    MalformedTranslation(String),
}

impl fmt::Display for StreamKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownStream(s) => write!(f, "unknown stream type: {s}"),
            Self::InvalidLanguage(s) => write!(f, "invalid language tag: {s}"),
            Self::MalformedTranslation(s) => {
                write!(f, "malformed translation key (want translation:<src>-to-<dst>): {s}")
            }
        }
    }
}

impl std::error::Error for StreamKeyError {}

/// A transcription or translation language pair, the unit the
/// transcription manager maintains streams for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TranscriptionKey {
    Transcription { language: LanguageTag },
    Translation { source: LanguageTag, target: LanguageTag },
}

impl TranscriptionKey {
    pub fn transcribe_language(&self) -> &LanguageTag {
        match self {
            Self::Transcription { language } => language,
            Self::Translation { source, .. } => source,
        }
    }

    pub fn target_language(&self) -> Option<&LanguageTag> {
        match self {
            Self::Transcription { .. } => None,
            Self::Translation { target, .. } => Some(target),
        }
    }
}

impl fmt::Display for TranscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transcription { language } => write!(f, "transcription:{language}"),
            Self::Translation { source, target } => {
                write!(f, "translation:{source}-to-{target}")
            }
        }
    }
}

/// Normalised routing key for a stream an App can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    /// ASR output for one language.
    Transcription { language: LanguageTag },
    /// Translated ASR output for a language pair.
    Translation { source: LanguageTag, target: LanguageTag },
    /// Raw PCM frames as received from the glasses.
    AudioChunk,
    CalendarEvent,
    LocationUpdate,
    CustomMessage,
    HeadPosition,
    ButtonPress,
    PhoneNotification,
    GlassesBatteryUpdate,
    VadStatus,
    RtmpStreamStatus,
    ManagedStreamStatus,
}

impl StreamKey {
    /// Parse a raw subscription token into its canonical key.
    ///
    /// `transcription` alone normalises to `transcription:en-US`; with a
    /// language it keeps it; `translation:<src>-to-<dst>` splits the pair.
    pub fn parse(raw: &str) -> Result<Self, StreamKeyError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("transcription:") {
            return Ok(Self::Transcription { language: LanguageTag::parse(rest)? });
        }
        if let Some(rest) = raw.strip_prefix("translation:") {
            let (src, dst) = rest
                .split_once("-to-")
                .ok_or_else(|| StreamKeyError::MalformedTranslation(raw.to_owned()))?;
            return Ok(Self::Translation {
                source: LanguageTag::parse(src)?,
                target: LanguageTag::parse(dst)?,
            });
        }
        match raw {
            "transcription" => Ok(Self::Transcription {
                language: LanguageTag::parse(DEFAULT_LANGUAGE)?,
            }),
            "audio_chunk" => Ok(Self::AudioChunk),
            "calendar_event" => Ok(Self::CalendarEvent),
            "location_update" => Ok(Self::LocationUpdate),
            "custom_message" => Ok(Self::CustomMessage),
            "head_position" => Ok(Self::HeadPosition),
            "button_press" => Ok(Self::ButtonPress),
            "phone_notification" => Ok(Self::PhoneNotification),
            "glasses_battery_update" => Ok(Self::GlassesBatteryUpdate),
            "vad_status" => Ok(Self::VadStatus),
            "rtmp_stream_status" => Ok(Self::RtmpStreamStatus),
            "managed_stream_status" => Ok(Self::ManagedStreamStatus),
            other => Err(StreamKeyError::UnknownStream(other.to_owned())),
        }
    }

    /// Whether this subscription implies the microphone must be open.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Transcription { .. } | Self::Translation { .. } | Self::AudioChunk)
    }

    /// The language pair this key asks the transcription manager to run,
    /// if any.
    pub fn transcription_key(&self) -> Option<TranscriptionKey> {
        match self {
            Self::Transcription { language } => {
                Some(TranscriptionKey::Transcription { language: language.clone() })
            }
            Self::Translation { source, target } => Some(TranscriptionKey::Translation {
                source: source.clone(),
                target: target.clone(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transcription { language } => write!(f, "transcription:{language}"),
            Self::Translation { source, target } => {
                write!(f, "translation:{source}-to-{target}")
            }
            Self::AudioChunk => f.write_str("audio_chunk"),
            Self::CalendarEvent => f.write_str("calendar_event"),
            Self::LocationUpdate => f.write_str("location_update"),
            Self::CustomMessage => f.write_str("custom_message"),
            Self::HeadPosition => f.write_str("head_position"),
            Self::ButtonPress => f.write_str("button_press"),
            Self::PhoneNotification => f.write_str("phone_notification"),
            Self::GlassesBatteryUpdate => f.write_str("glasses_battery_update"),
            Self::VadStatus => f.write_str("vad_status"),
            Self::RtmpStreamStatus => f.write_str("rtmp_stream_status"),
            Self::ManagedStreamStatus => f.write_str("managed_stream_status"),
        }
    }
}

impl From<&TranscriptionKey> for StreamKey {
    fn from(key: &TranscriptionKey) -> Self {
        match key {
            TranscriptionKey::Transcription { language } => {
                Self::Transcription { language: language.clone() }
            }
            TranscriptionKey::Translation { source, target } => {
                Self::Translation { source: source.clone(), target: target.clone() }
            }
        }
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
