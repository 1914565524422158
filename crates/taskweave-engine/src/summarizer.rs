use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::{debug, info, warn};

use taskweave_core::config::{SizeUnit, SummarizerConfig};
use taskweave_core::error::{EngineError, Result};
use taskweave_core::event::EventBus;
use taskweave_core::traits::{SummarizerBackend, SummaryRequest};
use taskweave_core::types::{ConversationTurn, EngineEvent, Role, SummaryStyle};

use crate::handoff::excerpt;

/// Appended to a summary that had to be cut to fit its size budget.
pub const TRUNCATION_MARKER: &str = "\n[summary truncated to fit size budget]";

/// Get or initialize the cl100k_base tokenizer.
fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer")
    })
}

/// Size of `text` in `unit`.
pub fn measure(text: &str, unit: SizeUnit) -> usize {
    match unit {
        SizeUnit::Tokens => tokenizer().encode_ordinary(text).len(),
        SizeUnit::Chars => text.chars().count(),
    }
}

/// Longest char-boundary prefix of `text` whose size is at most `budget`.
fn fit_prefix(text: &str, budget: usize, unit: SizeUnit) -> String {
    match unit {
        SizeUnit::Chars => excerpt(text, budget),
        SizeUnit::Tokens => {
            // Token count grows monotonically with prefix length.
            let (mut lo, mut hi) = (0, text.chars().count());
            while lo < hi {
                let mid = (lo + hi + 1) / 2;
                if measure(&excerpt(text, mid), unit) <= budget {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
            excerpt(text, lo)
        }
    }
}

/// Stands in for [`TRUNCATION_MARKER`] when the budget cannot hold it.
pub const SHORT_TRUNCATION_MARKER: &str = "…";

/// Cut `text` so that the result, marker included, fits `budget`.
///
/// Uses [`TRUNCATION_MARKER`] when it fits, else [`SHORT_TRUNCATION_MARKER`],
/// else a bare prefix. The result never exceeds `budget`.
pub fn truncate_to_budget(text: &str, budget: usize, unit: SizeUnit) -> String {
    let marker = [TRUNCATION_MARKER, SHORT_TRUNCATION_MARKER]
        .into_iter()
        .find(|m| measure(m, unit) <= budget)
        .unwrap_or("");
    let mut room = budget.saturating_sub(measure(marker, unit));
    loop {
        let mut cut = fit_prefix(text, room, unit);
        cut.push_str(marker);
        let size = measure(&cut, unit);
        // Token merges across the seam can add a token or two
        if size <= budget || room == 0 {
            return cut;
        }
        room = room.saturating_sub(size - budget);
    }
}

/// `original / summary`, or 1.0 when the summary is empty.
pub fn compression_ratio(original_size: usize, summary_size: usize) -> f64 {
    if summary_size == 0 {
        return 1.0;
    }
    original_size as f64 / summary_size as f64
}

/// A size-checked summary of a turn history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub style: SummaryStyle,
    pub size_unit: SizeUnit,
    /// Size of the formatted history that was summarized.
    pub original_size: usize,
    /// Size of the backend's raw answer, before any truncation.
    pub backend_size: usize,
    /// Size of `text`.
    pub summary_size: usize,
    pub compression_ratio: f64,
    /// Whether `text` was cut to fit the budget (and carries the marker).
    pub truncated: bool,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    fn new(
        text: String,
        style: SummaryStyle,
        size_unit: SizeUnit,
        original_size: usize,
        backend_size: usize,
        truncated: bool,
    ) -> Self {
        let summary_size = measure(&text, size_unit);
        Self {
            text,
            style,
            size_unit,
            original_size,
            backend_size,
            summary_size,
            compression_ratio: compression_ratio(original_size, summary_size),
            truncated,
            created_at: Utc::now(),
        }
    }

    /// Whether the backend ignored its budget.
    pub fn over_budget(&self, size_budget: usize) -> bool {
        self.backend_size > size_budget
    }
}

fn style_instructions(style: SummaryStyle) -> &'static str {
    match style {
        SummaryStyle::Concise => {
            "Summarize this conversation in 2-3 short paragraphs covering what was \
             discussed, what was decided, and what work remains. Headline facts only."
        }
        SummaryStyle::Detailed => {
            "Write a thorough summary of this conversation with these parts:\n\
             1. Overview: the main topic or goal\n\
             2. Key Discussions: major points covered\n\
             3. Decisions Made: everything agreed upon\n\
             4. Artifacts: files, code, or outputs created or discussed\n\
             5. Current State: where the conversation ended\n\
             6. Open Items: remaining questions or tasks\n\
             Keep technical specifics exact."
        }
        SummaryStyle::Structured => {
            "Summarize this conversation using exactly these section headings, \
             each followed by one \"- \" item per line:\n\n\
             KEY DECISIONS:\n\
             - <decision>\n\
             OPEN QUESTIONS:\n\
             - <question or open item>\n\
             ARTIFACTS:\n\
             - <file, code, or document>\n\
             CURRENT TASK:\n\
             <one line describing the task in progress>"
        }
        SummaryStyle::TaskFocused => {
            "Summarize the current task state from this conversation:\n\n\
             Task: <what is being worked on>\n\
             Progress: <what has been completed>\n\
             Current Step: <what is happening now>\n\
             Blockers: <issues or blockers>\n\
             Next Action: <what should happen next>\n\n\
             Focus on what is needed to continue the work."
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Requester => "REQUESTER",
        Role::Responder => "RESPONDER",
    }
}

/// Render turns as `[ROLE]: content` blocks, in order.
pub fn format_history(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("[{}]: {}", role_label(t.role), t.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Full prompt sent to the backend; the budget is stated as a hard limit.
pub fn build_prompt(
    style: SummaryStyle,
    history: &str,
    size_budget: usize,
    size_unit: SizeUnit,
) -> String {
    format!(
        "{}\n\n## Conversation to Summarize\n\n{}\n\n## Instructions\n\
         - The summary MUST NOT exceed {} {}\n\
         - Keep the information needed to continue the work\n\
         - Preserve technical details, commitments, and agreements",
        style_instructions(style),
        history,
        size_budget,
        size_unit.label()
    )
}

/// Contract layer between callers and a [`SummarizerBackend`].
///
/// Packages the history into a request, then enforces the size budget on
/// whatever comes back.
pub struct ContextSummarizer {
    backend: Arc<dyn SummarizerBackend>,
    config: SummarizerConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl ContextSummarizer {
    pub fn new(backend: Arc<dyn SummarizerBackend>, config: SummarizerConfig) -> Self {
        Self {
            backend,
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    /// Summarize with the configured style and budget.
    pub async fn summarize_default(&self, turns: &[ConversationTurn]) -> Result<Summary> {
        self.summarize(turns, self.config.style, self.config.size_budget)
            .await
    }

    /// Summarize `turns` in `style`, keeping the result within `size_budget`.
    ///
    /// An empty history yields an empty summary without calling the backend.
    /// An over-long answer is cut by [`truncate_to_budget`] and
    /// flagged as `truncated`.
    pub async fn summarize(
        &self,
        turns: &[ConversationTurn],
        style: SummaryStyle,
        size_budget: usize,
    ) -> Result<Summary> {
        if size_budget == 0 {
            return Err(EngineError::Config("size_budget must be >= 1".into()));
        }
        let unit = self.config.size_unit;

        if turns.is_empty() {
            debug!("Empty history, nothing to summarize");
            let summary = Summary::new(String::new(), style, unit, 0, 0, false);
            self.publish(&summary);
            return Ok(summary);
        }

        let history = format_history(turns);
        let original_size = measure(&history, unit);
        info!(
            turns = turns.len(),
            %style,
            original_size,
            size_budget,
            unit = unit.label(),
            "Summarizing history"
        );

        let request = SummaryRequest {
            prompt: build_prompt(style, &history, size_budget, unit),
            turns: turns.to_vec(),
            style,
            size_budget,
            size_unit: unit,
        };
        let raw = self.backend.summarize_text(request).await?;
        let backend_size = measure(&raw, unit);

        let summary = if backend_size > size_budget {
            warn!(
                backend_size,
                size_budget,
                unit = unit.label(),
                "Summary exceeded its budget, truncating"
            );
            let cut = truncate_to_budget(&raw, size_budget, unit);
            Summary::new(cut, style, unit, original_size, backend_size, true)
        } else {
            Summary::new(raw, style, unit, original_size, backend_size, false)
        };

        debug!(
            summary_size = summary.summary_size,
            compression_ratio = summary.compression_ratio,
            "Summary produced"
        );
        self.publish(&summary);
        Ok(summary)
    }

    /// Summarize in the structured style and render a handoff prompt for
    /// the next execution stage.
    pub async fn summarize_for_fork(
        &self,
        turns: &[ConversationTurn],
        next_request: &str,
    ) -> Result<String> {
        let summary = self
            .summarize(turns, SummaryStyle::Structured, self.config.size_budget)
            .await?;
        let notes = HandoffNotes::parse(&summary.text);
        Ok(fork_prompt(&summary, &notes, next_request))
    }

    fn publish(&self, summary: &Summary) {
        if let Some(bus) = &self.event_bus {
            bus.publish(EngineEvent::SummaryProduced {
                style: summary.style,
                original_size: summary.original_size,
                summary_size: summary.summary_size,
                truncated: summary.truncated,
            });
        }
    }
}

/// Decision-relevant items pulled out of a summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffNotes {
    pub key_decisions: Vec<String>,
    pub open_questions: Vec<String>,
    pub artifacts: Vec<String>,
    pub current_task: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum NotesSection {
    Decisions,
    Questions,
    Artifacts,
    Task,
}

fn heading_section(line: &str) -> Option<NotesSection> {
    let upper = line.to_uppercase();
    if upper.contains("DECISION") {
        Some(NotesSection::Decisions)
    } else if upper.contains("QUESTION") || upper.contains("OPEN ITEM") {
        Some(NotesSection::Questions)
    } else if upper.contains("ARTIFACT") {
        Some(NotesSection::Artifacts)
    } else if upper.contains("CURRENT TASK")
        || upper.contains("CURRENT_TASK")
        || upper.contains("CURRENT STATE")
    {
        Some(NotesSection::Task)
    } else {
        None
    }
}

impl HandoffNotes {
    /// Parse section headings followed by `- ` items.
    ///
    /// The current task is the text after its heading's colon, or the first
    /// plain line below the heading.
    pub fn parse(text: &str) -> Self {
        let mut notes = Self::default();
        let mut section = None;

        for line in text.lines().map(str::trim) {
            if let Some(item) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
                let item = item.trim().to_string();
                match section {
                    Some(NotesSection::Decisions) => notes.key_decisions.push(item),
                    Some(NotesSection::Questions) => notes.open_questions.push(item),
                    Some(NotesSection::Artifacts) => notes.artifacts.push(item),
                    Some(NotesSection::Task) if notes.current_task.is_none() => {
                        notes.current_task = Some(item)
                    }
                    _ => {}
                }
                continue;
            }

            if let Some(next) = heading_section(line) {
                section = Some(next);
                if next == NotesSection::Task && notes.current_task.is_none() {
                    let inline = line.split_once(':').map(|(_, rest)| rest.trim());
                    if let Some(task) = inline.filter(|t| !t.is_empty()) {
                        notes.current_task = Some(task.to_string());
                    }
                }
                continue;
            }

            if section == Some(NotesSection::Task)
                && notes.current_task.is_none()
                && !line.is_empty()
                && !line.starts_with('#')
            {
                notes.current_task = Some(line.to_string());
            }
        }
        notes
    }
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!("- {}", empty);
    }
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Handoff prompt for the next execution stage.
pub fn fork_prompt(summary: &Summary, notes: &HandoffNotes, next_request: &str) -> String {
    format!(
        "## Previous Context\n\n{}\n\n\
         ### Key Decisions Made\n{}\n\n\
         ### Current State\n{}\n\n\
         ### Open Questions\n{}\n\n\
         ---\n\n\
         ## Your Task\n\n{}\n\n\
         Use the context above. Build on previous decisions and stay consistent \
         with the work already done.",
        summary.text,
        bullet_list(&notes.key_decisions, "None recorded"),
        notes
            .current_task
            .as_deref()
            .unwrap_or("No specific task identified"),
        bullet_list(&notes.open_questions, "None"),
        next_request
    )
}
