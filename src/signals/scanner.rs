//! Incremental marker scanner.
//!
//! Splits a stream of text chunks into plain text and marker-delimited signal
//! bodies. The scanner keeps just enough state to resume across chunk
//! boundaries: a marker whose open tag, body or close tag is split over two
//! chunks is reported exactly once.

use std::sync::Arc;

use super::grammar::{MarkerGrammar, SignalKind};

/// Output of the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Signal { kind: SignalKind, body: String },
}

/// Resumable scanner over one text source.
#[derive(Debug)]
pub struct MarkerScanner {
    grammar: Arc<MarkerGrammar>,
    /// Bytes not yet classified (may hold a partial tag).
    pending: String,
    /// Index of the rule whose body is being collected.
    active: Option<usize>,
    body: String,
}

impl MarkerScanner {
    pub fn new(grammar: Arc<MarkerGrammar>) -> Self {
        Self {
            grammar,
            pending: String::new(),
            active: None,
            body: String::new(),
        }
    }

    /// Feed a chunk and return every segment that is now complete.
    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        self.pending.push_str(chunk);
        let grammar = Arc::clone(&self.grammar);
        let rules = grammar.rules();
        let mut out = Vec::new();

        loop {
            match self.active {
                Some(idx) => {
                    let rule = &rules[idx];
                    if let Some(pos) = self.pending.find(rule.close.as_str()) {
                        self.body.push_str(&self.pending[..pos]);
                        self.pending.drain(..pos + rule.close.len());
                        out.push(Segment::Signal {
                            kind: rule.kind,
                            body: std::mem::take(&mut self.body),
                        });
                        self.active = None;
                    } else {
                        let keep = partial_tag_suffix(&self.pending, [rule.close.as_str()]);
                        let split = self.pending.len() - keep;
                        self.body.push_str(&self.pending[..split]);
                        self.pending.drain(..split);
                        break;
                    }
                }
                None => {
                    let earliest = rules
                        .iter()
                        .enumerate()
                        .filter_map(|(i, r)| self.pending.find(r.open.as_str()).map(|pos| (pos, i)))
                        .min_by(|a, b| {
                            a.0.cmp(&b.0)
                                .then(rules[b.1].open.len().cmp(&rules[a.1].open.len()))
                        });

                    if let Some((pos, idx)) = earliest {
                        if pos > 0 {
                            out.push(Segment::Text(self.pending[..pos].to_string()));
                        }
                        self.pending.drain(..pos + rules[idx].open.len());
                        self.active = Some(idx);
                    } else {
                        let keep =
                            partial_tag_suffix(&self.pending, rules.iter().map(|r| r.open.as_str()));
                        let split = self.pending.len() - keep;
                        if split > 0 {
                            out.push(Segment::Text(self.pending[..split].to_string()));
                            self.pending.drain(..split);
                        }
                        break;
                    }
                }
            }
        }

        out
    }

    /// Flush at end of stream. An unterminated marker degrades to plain text.
    pub fn finish(&mut self) -> Vec<Segment> {
        let text = match self.active.take() {
            Some(idx) => {
                let open = &self.grammar.rules()[idx].open;
                format!("{}{}{}", open, std::mem::take(&mut self.body), self.pending)
            }
            None => self.pending.clone(),
        };
        self.pending.clear();

        if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Text(text)]
        }
    }

    /// True while a marker body or partial tag is being held back.
    #[cfg(test)]
    fn is_holding(&self) -> bool {
        self.active.is_some() || !self.pending.is_empty()
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of one of `tags`.
fn partial_tag_suffix<'a>(text: &str, tags: impl IntoIterator<Item = &'a str>) -> usize {
    let bytes = text.as_bytes();
    let mut best = 0;
    for tag in tags {
        let max = tag.len().saturating_sub(1).min(bytes.len());
        for k in (best + 1..=max).rev() {
            if bytes[bytes.len() - k..] == tag.as_bytes()[..k] {
                best = k;
                break;
            }
        }
    }
    best
}
