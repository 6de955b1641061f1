//! Marker grammar: which open/close tags delimit a structured signal.
//!
//! The agent's free text carries signals in a versioned, externally controlled
//! format, so the tag set is data rather than code. The default grammar uses
//! XML-like tags; `kiln.toml` may replace it with `[[markers]]` entries.

use serde::{Deserialize, Serialize};

/// Kind of structured signal a marker produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ToolCall,
    ToolResult,
    PermissionRequest,
    SubagentStart,
    SubagentEnd,
    Thinking,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::ToolCall => "tool_call",
            SignalKind::ToolResult => "tool_result",
            SignalKind::PermissionRequest => "permission_request",
            SignalKind::SubagentStart => "subagent_start",
            SignalKind::SubagentEnd => "subagent_end",
            SignalKind::Thinking => "thinking",
        }
    }

    const ALL: [SignalKind; 6] = [
        SignalKind::ToolCall,
        SignalKind::ToolResult,
        SignalKind::PermissionRequest,
        SignalKind::SubagentStart,
        SignalKind::SubagentEnd,
        SignalKind::Thinking,
    ];
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One open/close pair in the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRule {
    pub kind: SignalKind,
    pub open: String,
    pub close: String,
}

impl MarkerRule {
    pub fn new(kind: SignalKind, open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            kind,
            open: open.into(),
            close: close.into(),
        }
    }
}

/// Validated set of marker rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerGrammar {
    rules: Vec<MarkerRule>,
}

impl MarkerGrammar {
    /// Build a grammar, rejecting empty tags and duplicate open tags.
    pub fn new(rules: Vec<MarkerRule>) -> anyhow::Result<Self> {
        for (i, rule) in rules.iter().enumerate() {
            if rule.open.is_empty() || rule.close.is_empty() {
                anyhow::bail!("Marker for {} has an empty open or close tag", rule.kind);
            }
            if rules[..i].iter().any(|r| r.open == rule.open) {
                anyhow::bail!("Duplicate marker open tag '{}'", rule.open);
            }
        }
        Ok(Self { rules })
    }

    /// `<kind>…</kind>` for every signal kind.
    pub fn default_rules() -> Vec<MarkerRule> {
        SignalKind::ALL
            .iter()
            .map(|kind| {
                MarkerRule::new(
                    *kind,
                    format!("<{}>", kind.as_str()),
                    format!("</{}>", kind.as_str()),
                )
            })
            .collect()
    }

    pub fn rules(&self) -> &[MarkerRule] {
        &self.rules
    }
}

impl Default for MarkerGrammar {
    fn default() -> Self {
        Self {
            rules: Self::default_rules(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grammar_covers_every_kind() {
        let grammar = MarkerGrammar::default();
        assert_eq!(grammar.rules().len(), 6);
        let thinking = grammar
            .rules()
            .iter()
            .find(|r| r.kind == SignalKind::Thinking)
            .unwrap();
        assert_eq!(thinking.open, "<thinking>");
        assert_eq!(thinking.close, "</thinking>");
    }

    #[test]
    fn test_grammar_rejects_duplicate_open_tags() {
        let rules = vec![
            MarkerRule::new(SignalKind::Thinking, "[[", "]]"),
            MarkerRule::new(SignalKind::ToolCall, "[[", "]]"),
        ];
        assert!(MarkerGrammar::new(rules).is_err());
    }

    #[test]
    fn test_grammar_rejects_empty_tags() {
        let rules = vec![MarkerRule::new(SignalKind::Thinking, "", "</t>")];
        assert!(MarkerGrammar::new(rules).is_err());
    }

    #[test]
    fn test_signal_kind_deserializes_snake_case() {
        let rule: MarkerRule = toml::from_str(
            r#"
kind = "permission_request"
open = "[perm]"
close = "[/perm]"
"#,
        )
        .unwrap();
        assert_eq!(rule.kind, SignalKind::PermissionRequest);
    }
}
