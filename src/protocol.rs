//! Register descriptors and their wire codec for the Eastron SDM meter family.
//!
//! A [`Register`] describes one named, device-resident quantity: where it lives in
//! the device address space, how many 16-bit words it occupies, how the raw words
//! are interpreted and how the decoded number is turned into a published value.

use std::fmt;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Errors raised by the register codec and by the register table lookups.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The value is outside the writable range declared by the register.
    #[error("Value {value} for register {name} is outside the range {min}..={max}")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The register has no writable range and must not be written.
    #[error("Register {0} is read-only")]
    NotWritable(String),

    /// No register with this name is declared by the device.
    #[error("Unknown register {0}")]
    UnknownRegister(String),

    /// The model name or code does not belong to a supported meter.
    #[error("Unknown meter model '{0}'")]
    UnknownModel(String),
}

/// Wire encoding of a register. The number of words is fixed by the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer, high word first.
    U32Be,
    /// IEEE-754 single precision float, high word first.
    F32Be,
}

impl Encoding {
    /// Number of 16-bit words this encoding occupies.
    pub const fn word_count(&self) -> u16 {
        match self {
            Encoding::U16 => 1,
            Encoding::U32Be | Encoding::F32Be => 2,
        }
    }

    /// Interprets the raw words. Returns `None` for a malformed payload.
    pub fn decode(&self, words: &[u16]) -> Option<f64> {
        if words.len() != self.word_count() as usize {
            return None;
        }
        match self {
            Encoding::U16 => Some(words[0] as f64),
            Encoding::U32Be => Some(merge_words(words[0], words[1]) as f64),
            Encoding::F32Be => Some(f32::from_bits(merge_words(words[0], words[1])) as f64),
        }
    }

    /// Range of raw values this encoding can represent.
    pub fn raw_range(&self) -> RangeInclusive<f64> {
        match self {
            Encoding::U16 => 0.0..=u16::MAX as f64,
            Encoding::U32Be => 0.0..=u32::MAX as f64,
            Encoding::F32Be => -(f32::MAX as f64)..=f32::MAX as f64,
        }
    }

    /// Packs a raw numeric value into big-endian words.
    ///
    /// Integers are rounded first. Returns `None` if the value does not fit.
    pub fn encode(&self, raw: f64) -> Option<Vec<u16>> {
        let raw = match self {
            Encoding::U16 | Encoding::U32Be => raw.round(),
            Encoding::F32Be => raw,
        };
        if !self.raw_range().contains(&raw) {
            return None;
        }
        Some(match self {
            Encoding::U16 => vec![raw as u16],
            Encoding::U32Be => split_words(raw as u32).to_vec(),
            Encoding::F32Be => split_words((raw as f32).to_bits()).to_vec(),
        })
    }
}

fn merge_words(high: u16, low: u16) -> u32 {
    (high as u32) << 16 | low as u32
}

fn split_words(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

/// Maps a numeric value to its display string.
pub type Formatter = fn(f64) -> String;

pub fn fmt_kwh(value: f64) -> String {
    format!("{value:.3} kWh")
}

pub fn fmt_a(value: f64) -> String {
    format!("{value:.1}A")
}

pub fn fmt_w(value: f64) -> String {
    format!("{value:.1}W")
}

pub fn fmt_v(value: f64) -> String {
    format!("{value:.1}V")
}

pub fn fmt_hz(value: f64) -> String {
    format!("{value:.1}Hz")
}

/// Wiring configurations reported by the phase configuration register.
pub const PHASE_CONFIGS: &[&str] = &["undefined", "1p2w", "3p3w", "3p4w"];

/// Number of measured phases for each entry of [`PHASE_CONFIGS`].
pub const NR_PHASES: [u8; 4] = [0, 1, 3, 3];

/// A typed, addressable device quantity and its encode/decode rules.
///
/// The encoding (and thus the word count) is fixed when the register is
/// constructed. Calibration (`offset`, `invert`) can be changed at runtime and is
/// applied to every value computed for publication.
#[derive(Debug, Clone)]
pub struct Register {
    address: u16,
    encoding: Encoding,
    name: String,
    scale: f64,
    formatter: Option<Formatter>,
    text: Option<&'static [&'static str]>,
    write_range: Option<RangeInclusive<f64>>,
    offset: f64,
    invert: bool,
    pub(crate) max_age: Duration,
    pub(crate) updated: Option<Instant>,
    value: Option<f64>,
}

impl Register {
    fn new(address: u16, encoding: Encoding, name: impl Into<String>) -> Self {
        Self {
            address,
            encoding,
            name: name.into(),
            scale: 1.0,
            formatter: None,
            text: None,
            write_range: None,
            offset: 0.0,
            invert: false,
            max_age: Duration::ZERO,
            updated: None,
            value: None,
        }
    }

    /// A 16-bit unsigned register.
    pub fn u16(address: u16, name: impl Into<String>) -> Self {
        Self::new(address, Encoding::U16, name)
    }

    /// A 32-bit unsigned register, high word first.
    pub fn u32b(address: u16, name: impl Into<String>) -> Self {
        Self::new(address, Encoding::U32Be, name)
    }

    /// A 32-bit float register, high word first.
    pub fn f32b(address: u16, name: impl Into<String>) -> Self {
        Self::new(address, Encoding::F32Be, name)
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_formatter(mut self, formatter: Formatter) -> Self {
        self.formatter = Some(formatter);
        self
    }

    /// Declares the register as enumerated; the decoded value selects a label.
    pub fn with_text(mut self, text: &'static [&'static str]) -> Self {
        self.text = Some(text);
        self
    }

    /// Makes the register writable within the inclusive range.
    pub fn writable(mut self, range: RangeInclusive<f64>) -> Self {
        self.write_range = Some(range);
        self
    }

    /// Flips the sign of every published value.
    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn word_count(&self) -> u16 {
        self.encoding.word_count()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
    }

    pub fn is_inverted(&self) -> bool {
        self.invert
    }

    pub fn is_writable(&self) -> bool {
        self.write_range.is_some()
    }

    /// The current value, `None` if never decoded or invalid.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    /// Timestamp of the last decode attempt.
    pub fn last_update(&self) -> Option<Instant> {
        self.updated
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Display text of the current value, `None` if the value is absent.
    pub fn text(&self) -> Option<String> {
        let value = self.value?;
        Some(match (self.text, self.formatter) {
            (Some(labels), _) => labels[value as usize].to_string(),
            (None, Some(formatter)) => formatter(value),
            (None, None) => value.to_string(),
        })
    }

    fn calibrate(&self, raw: f64) -> f64 {
        let value = raw + self.offset;
        let value = if self.invert { -value } else { value };
        value / self.scale
    }

    fn uncalibrate(&self, value: f64) -> f64 {
        let raw = value * self.scale;
        let raw = if self.invert { -raw } else { raw };
        raw - self.offset
    }

    fn in_text_bounds(&self, value: f64) -> bool {
        match self.text {
            Some(labels) => value.fract() == 0.0 && value >= 0.0 && (value as usize) < labels.len(),
            None => true,
        }
    }

    /// Decodes the raw words into the current value.
    ///
    /// Non-finite numbers, malformed payloads and enumeration indices outside the
    /// label table leave the register invalid. Returns whether the current value
    /// differs from the previous one.
    pub fn decode(&mut self, words: &[u16]) -> bool {
        let value = self
            .encoding
            .decode(words)
            .filter(|raw| raw.is_finite())
            .map(|raw| self.calibrate(raw))
            .filter(|value| value.is_finite() && self.in_text_bounds(*value));
        let changed = value != self.value;
        self.value = value;
        changed
    }

    /// Encodes a value for a write to the device.
    ///
    /// The value is checked against the writable range first and transformed with the
    /// inverse of the decode calibration, so that decoding the returned words
    /// reproduces `value`.
    pub fn encode_for_write(&self, value: f64) -> Result<Vec<u16>, Error> {
        let range = self
            .write_range
            .as_ref()
            .ok_or_else(|| Error::NotWritable(self.name.clone()))?;
        if !range.contains(&value) {
            return Err(Error::OutOfRange {
                name: self.name.clone(),
                value,
                min: *range.start(),
                max: *range.end(),
            });
        }
        let raw = self.uncalibrate(value);
        self.encoding.encode(raw).ok_or_else(|| {
            let raw_range = self.encoding.raw_range();
            Error::OutOfRange {
                name: self.name.clone(),
                value: raw,
                min: *raw_range.start(),
                max: *raw_range.end(),
            }
        })
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text() {
            Some(text) => write!(f, "{}: {}", self.name, text),
            None => write!(f, "{}: --", self.name),
        }
    }
}
