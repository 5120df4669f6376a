use regex::Regex;

/// A tool call as it appears in raw model output, args still unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToolCall {
    pub name: String,
    pub raw_args: String,
}

/// Extracts tool calls from free-text model output.
///
/// The markup grammar is deliberately behind this trait so a structured
/// function-calling protocol can replace it without touching the agent's
/// retry/timeout logic.
pub trait ToolCallParser: Send + Sync + 'static {
    fn parse(&self, text: &str) -> Vec<RawToolCall>;
}

/// Parser for the `[TOOL:<name>]<json-args>[/TOOL]` wire grammar.
/// Matches non-greedily; the markup may repeat.
pub struct MarkupParser {
    pattern: Regex,
}

impl MarkupParser {
    pub fn new() -> Self {
        // (?s) so args may span lines; .*? keeps each match non-greedy.
        let pattern = Regex::new(r"(?s)\[TOOL:([A-Za-z0-9_-]+)\](.*?)\[/TOOL\]")
            .expect("tool markup pattern is valid");
        Self { pattern }
    }
}

impl Default for MarkupParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallParser for MarkupParser {
    fn parse(&self, text: &str) -> Vec<RawToolCall> {
        self.pattern
            .captures_iter(text)
            .map(|cap| RawToolCall {
                name: cap[1].to_string(),
                raw_args: cap[2].trim().to_string(),
            })
            .collect()
    }
}
