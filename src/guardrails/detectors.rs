//! Built-in sensitive-data detectors.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

/// Finds sensitive spans in text.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Byte ranges of every match in `text`.
    fn find(&self, text: &str) -> anyhow::Result<Vec<Range<usize>>>;
}

/// Regex detector with an optional validator for candidate matches.
struct RegexDetector {
    name: &'static str,
    regex: &'static LazyLock<Regex>,
    validate: Option<fn(&str) -> bool>,
}

impl Detector for RegexDetector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn find(&self, text: &str) -> anyhow::Result<Vec<Range<usize>>> {
        Ok(self
            .regex
            .find_iter(text)
            .filter(|m| self.validate.is_none_or(|valid| valid(m.as_str())))
            .map(|m| m.range())
            .collect())
    }
}

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,}\b").unwrap()
});

static IP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b")
        .unwrap()
});

// Separators are required so plain long numbers are left alone.
static PHONE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)\s?|\b\d{3}[\s.-])\d{3}[\s.-]\d{4}\b").unwrap()
});

static CARD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").unwrap());

static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\b(?:https?|ftp)://[^\s<>"'`)\]]+"#).unwrap());

static SECRET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:sk-(?:ant-)?[A-Za-z0-9_-]{20,}|AKIA[0-9A-Z]{16}|gh[pousr]_[A-Za-z0-9]{36,}|xox[abprs]-[A-Za-z0-9-]{10,})",
    )
    .unwrap()
});

static BUILTIN: [RegexDetector; 6] = [
    RegexDetector {
        name: "email",
        regex: &EMAIL_REGEX,
        validate: None,
    },
    RegexDetector {
        name: "ip_address",
        regex: &IP_REGEX,
        validate: None,
    },
    RegexDetector {
        name: "phone_number",
        regex: &PHONE_REGEX,
        validate: None,
    },
    RegexDetector {
        name: "credit_card",
        regex: &CARD_REGEX,
        validate: Some(luhn_valid),
    },
    RegexDetector {
        name: "url",
        regex: &URL_REGEX,
        validate: None,
    },
    RegexDetector {
        name: "secret_key",
        regex: &SECRET_REGEX,
        validate: None,
    },
];

/// Look up a built-in detector by name.
pub fn builtin_detector(name: &str) -> Option<&'static dyn Detector> {
    BUILTIN
        .iter()
        .find(|d| d.name == name)
        .map(|d| d as &'static dyn Detector)
}

/// Names of all built-in detectors.
pub fn builtin_names() -> Vec<&'static str> {
    BUILTIN.iter().map(|d| d.name).collect()
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
