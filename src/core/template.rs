//! File naming template inference.
//!
//! A dataset is a directory of frames named `prefix + zero_padded(index) + suffix`,
//! e.g. `img_001.tif ... img_120.tif`. The template is recovered from the
//! listing alone by comparing the names from both ends; no regex scanning is
//! involved, so every valid name round-trips through [`NamingTemplate::format`].

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Errors raised while inferring or parsing a naming template.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("no file names to infer a naming pattern from")]
    Empty,

    #[error("variable part '{segment}' of '{file}' is not numeric")]
    NonNumeric { file: String, segment: String },

    #[error("variable part of '{file}' has {found} digits, expected {expected}")]
    InconsistentWidth {
        file: String,
        expected: usize,
        found: usize,
    },

    #[error("no frame counter found in '{0}'")]
    NoCounter(String),

    #[error("frame counter of '{file}' has {width} digits, at most {} are supported", MAX_COUNTER_WIDTH)]
    CounterTooWide { file: String, width: usize },

    #[error("invalid file name placeholder: '{0}'")]
    InvalidPlaceholder(String),
}

/// Result type for template operations.
pub type Result<T> = std::result::Result<T, PatternError>;

/// Widest counter whose every value fits a `u32` frame index.
pub const MAX_COUNTER_WIDTH: usize = 9;

/// `prefix + zero_padded(index, width) + suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingTemplate {
    prefix: String,
    suffix: String,
    width: usize,
}

impl NamingTemplate {
    /// Create a template from its parts.
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>, width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            width,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Number of digits in the frame counter.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Render the file name of frame `index`.
    pub fn format(&self, index: u32) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.width
        )
    }

    /// Same counter width with a different prefix and suffix.
    ///
    /// Used for stage outputs, e.g. `preprocessed_{t:03d}.tif`.
    pub fn with_affixes(&self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self::new(prefix, suffix, self.width)
    }

    /// Parse the frame index out of `name`.
    ///
    /// Returns `None` unless `name` is exactly `prefix + width digits + suffix`.
    pub fn parse_index(&self, name: &str) -> Option<u32> {
        let digits = name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        if digits.len() != self.width || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Format-string form understood by the stage runners: `img_{t:03d}.tif`.
    ///
    /// Literal braces in the prefix or suffix are doubled.
    pub fn placeholder(&self) -> String {
        format!(
            "{}{{t:0{}d}}{}",
            escape_braces(&self.prefix),
            self.width,
            escape_braces(&self.suffix)
        )
    }

    /// Parse the [`placeholder`](Self::placeholder) form back into a template.
    pub fn from_placeholder(placeholder: &str) -> Result<Self> {
        static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
        let re = PLACEHOLDER.get_or_init(|| {
            Regex::new(r"^(?s)(.*)\{t:0(\d+)d\}(.*)$").expect("placeholder regex is valid")
        });

        let invalid = || PatternError::InvalidPlaceholder(placeholder.to_string());
        let caps = re.captures(placeholder).ok_or_else(invalid)?;
        let width: usize = caps[2].parse().map_err(|_| invalid())?;
        if width == 0 {
            return Err(invalid());
        }

        Ok(Self::new(
            unescape_braces(&caps[1]),
            unescape_braces(&caps[3]),
            width,
        ))
    }
}

impl fmt::Display for NamingTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.placeholder())
    }
}

fn escape_braces(s: &str) -> String {
    s.replace('{', "{{").replace('}', "}}")
}

fn unescape_braces(s: &str) -> String {
    s.replace("{{", "{").replace("}}", "}")
}

/// Length of the prefix shared by every name.
fn common_prefix_len(names: &[&[u8]], limit: usize) -> usize {
    let first = names[0];
    (0..limit)
        .take_while(|&i| names.iter().all(|n| n[i] == first[i]))
        .count()
}

/// Length of the suffix shared by every name, capped at `limit` so it never
/// overlaps the common prefix.
fn common_suffix_len(names: &[&[u8]], limit: usize) -> usize {
    let first = names[0];
    (1..=limit)
        .take_while(|&i| {
            let expected = first[first.len() - i];
            names.iter().all(|n| n[n.len() - i] == expected)
        })
        .count()
}

/// Byte range of the last run of ASCII digits in `name`.
fn last_digit_run(name: &[u8]) -> Option<(usize, usize)> {
    let end = name.iter().rposition(|b| b.is_ascii_digit())? + 1;
    let start = name[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map_or(0, |i| i + 1);
    Some((start, end))
}

/// Infer the naming template shared by `filenames`.
///
/// The variable segment is what remains between the longest common prefix and
/// the longest common suffix, widened over any digits the two share at the
/// boundary (`img_009`/`img_010` has a 3-digit counter, not 2). A single name
/// uses its last run of digits as the counter. Widening stops at
/// [`MAX_COUNTER_WIDTH`] digits.
///
/// # Errors
///
/// - [`PatternError::Empty`] if `filenames` is empty
/// - [`PatternError::NonNumeric`] if a variable segment contains non-digits
/// - [`PatternError::InconsistentWidth`] if variable segments differ in length
/// - [`PatternError::NoCounter`] if a single name carries no digits
/// - [`PatternError::CounterTooWide`] if the names differ in more than
///   [`MAX_COUNTER_WIDTH`] digits
pub fn infer<S: AsRef<str>>(filenames: &[S]) -> Result<NamingTemplate> {
    let names: Vec<&[u8]> = filenames.iter().map(|n| n.as_ref().as_bytes()).collect();
    let first = *names.first().ok_or(PatternError::Empty)?;
    let first_str = filenames[0].as_ref();

    let min_len = names.iter().map(|n| n.len()).min().unwrap_or(0);
    let mut prefix = common_prefix_len(&names, min_len);
    let mut suffix = common_suffix_len(&names, min_len - prefix);

    let counter_width = |prefix: usize, suffix: usize| first.len() - prefix - suffix;
    while prefix > 0
        && first[prefix - 1].is_ascii_digit()
        && counter_width(prefix, suffix) < MAX_COUNTER_WIDTH
    {
        prefix -= 1;
    }
    while suffix > 0
        && first[first.len() - suffix].is_ascii_digit()
        && counter_width(prefix, suffix) < MAX_COUNTER_WIDTH
    {
        suffix -= 1;
    }

    if names.iter().all(|n| n.len() == prefix + suffix) {
        // Every name is identical: fall back to the trailing counter.
        let (start, end) =
            last_digit_run(first).ok_or_else(|| PatternError::NoCounter(first_str.to_string()))?;
        prefix = start.max(end.saturating_sub(MAX_COUNTER_WIDTH));
        suffix = first.len() - end;
    }

    let width = counter_width(prefix, suffix);
    if width > MAX_COUNTER_WIDTH {
        return Err(PatternError::CounterTooWide {
            file: first_str.to_string(),
            width,
        });
    }
    for (name, bytes) in filenames.iter().zip(&names) {
        let segment = &bytes[prefix..bytes.len() - suffix];
        if !segment.iter().all(u8::is_ascii_digit) {
            return Err(PatternError::NonNumeric {
                file: name.as_ref().to_string(),
                segment: String::from_utf8_lossy(segment).into_owned(),
            });
        }
        if segment.len() != width {
            return Err(PatternError::InconsistentWidth {
                file: name.as_ref().to_string(),
                expected: width,
                found: segment.len(),
            });
        }
    }

    // Both cut points border an ASCII digit, so they fall on char boundaries.
    let template = NamingTemplate::new(
        &first_str[..prefix],
        &first_str[first.len() - suffix..],
        width,
    );
    log::debug!(
        "Inferred naming template {} from {} files",
        template,
        filenames.len()
    );
    Ok(template)
}
