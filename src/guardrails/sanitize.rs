use std::collections::BTreeMap;

use super::detectors::{Detector, builtin_detector};
use crate::events::{AgentEvent, InputGuardrailPayload};

/// Result of the pre-stage sanitizer.
#[derive(Debug, Clone, PartialEq)]
pub struct InputVerdict {
    pub sanitized: String,
    /// Detectors that matched, in configuration order.
    pub triggered: Vec<String>,
    pub matches: BTreeMap<String, Vec<String>>,
}

impl InputVerdict {
    fn passthrough(prompt: &str) -> Self {
        Self {
            sanitized: prompt.to_string(),
            triggered: Vec::new(),
            matches: BTreeMap::new(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        !self.triggered.is_empty()
    }

    /// The `guardrails_triggered` event, if anything matched.
    pub fn event(&self) -> Option<AgentEvent> {
        self.is_triggered().then(|| {
            AgentEvent::GuardrailsTriggered(InputGuardrailPayload {
                detectors: self.triggered.clone(),
                matches: self.matches.clone(),
            })
        })
    }
}

struct Hit {
    detector: &'static str,
    start: usize,
    end: usize,
}

/// Redact everything the enabled built-in detectors find.
pub fn sanitize(prompt: &str, detectors: &[String]) -> InputVerdict {
    sanitize_with(prompt, detectors, builtin_detector)
}

/// Redact with a custom detector lookup. Fails open: an unknown detector or
/// a detector error leaves the prompt untouched.
pub fn sanitize_with<'a>(
    prompt: &str,
    detectors: &[String],
    lookup: impl Fn(&str) -> Option<&'a dyn Detector>,
) -> InputVerdict {
    let mut hits = Vec::new();
    for name in detectors {
        let Some(detector) = lookup(name) else {
            tracing::warn!(detector = %name, "unknown guardrail detector, prompt left unchanged");
            return InputVerdict::passthrough(prompt);
        };
        match detector.find(prompt) {
            Ok(ranges) => hits.extend(ranges.into_iter().map(|r| Hit {
                detector: detector.name(),
                start: r.start,
                end: r.end,
            })),
            Err(e) => {
                tracing::warn!(detector = %name, error = %e, "guardrail detector failed, prompt left unchanged");
                return InputVerdict::passthrough(prompt);
            }
        }
    }

    // Earliest start wins; on a tie, the longest match.
    hits.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
    let mut kept: Vec<Hit> = Vec::new();
    for hit in hits {
        if hit.start == hit.end {
            continue;
        }
        if kept.last().is_some_and(|last| hit.start < last.end) {
            continue;
        }
        kept.push(hit);
    }

    let mut matches: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for hit in &kept {
        let values = matches.entry(hit.detector.to_string()).or_default();
        let value = prompt[hit.start..hit.end].to_string();
        if !values.contains(&value) {
            values.push(value);
        }
    }
    let triggered: Vec<String> = detectors
        .iter()
        .filter(|name| matches.contains_key(name.as_str()))
        .cloned()
        .collect();

    // Indices refer to the original prompt, so replace back to front.
    let mut sanitized = prompt.to_string();
    for hit in kept.iter().rev() {
        sanitized.replace_range(hit.start..hit.end, &redaction(hit.detector));
    }

    InputVerdict {
        sanitized,
        triggered,
        matches,
    }
}

pub fn redaction(detector: &str) -> String {
    format!("[REDACTED_{}]", detector.to_ascii_uppercase())
}
