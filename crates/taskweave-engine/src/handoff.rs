use serde::{Deserialize, Serialize};

/// Outputs of upstream units, handed to a dependent unit with its task.
///
/// Each output is cut to `excerpt_chars` so a long dependency chain cannot
/// blow up the dependent's prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffContext {
    sections: Vec<(String, String)>,
    excerpt_chars: usize,
}

impl HandoffContext {
    pub fn new(excerpt_chars: usize) -> Self {
        Self {
            sections: Vec::new(),
            excerpt_chars,
        }
    }

    /// Build from `(label, output)` pairs in order.
    pub fn from_outputs<'a, I>(outputs: I, excerpt_chars: usize) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut ctx = Self::new(excerpt_chars);
        for (label, output) in outputs {
            ctx.push(label, output);
        }
        ctx
    }

    /// Append one upstream output.
    pub fn push(&mut self, label: impl Into<String>, output: &str) {
        self.sections
            .push((label.into(), excerpt(output, self.excerpt_chars)));
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Render as `## label` sections.
    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(|(label, text)| format!("## {}\n{}", label, text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The task with this context appended; the bare task when empty.
    pub fn apply(&self, task: &str) -> String {
        if self.is_empty() {
            return task.to_string();
        }
        format!("{}\n\nContext from previous steps:\n{}", task, self.render())
    }
}

/// First `max_chars` characters of `text`, on a char boundary.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_without_context_is_identity() {
        let ctx = HandoffContext::new(500);
        assert_eq!(ctx.apply("Write the report."), "Write the report.");
    }

    #[test]
    fn test_apply_appends_sections_in_order() {
        let ctx = HandoffContext::from_outputs(
            [("research", "Rust is fast"), ("design", "Use tokio")],
            500,
        );
        let task = ctx.apply("Implement it.");
        assert!(task.starts_with("Implement it.\n\nContext from previous steps:\n"));
        let research = task.find("## research\nRust is fast").unwrap();
        let design = task.find("## design\nUse tokio").unwrap();
        assert!(research < design);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_outputs_are_truncated() {
        let long = "x".repeat(1000);
        let ctx = HandoffContext::from_outputs([("a", long.as_str())], 10);
        assert_eq!(ctx.render(), format!("## a\n{}", "x".repeat(10)));
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo wörld", 4), "héll");
        assert_eq!(excerpt("short", 100), "short");
        assert_eq!(excerpt("", 3), "");
    }
}
