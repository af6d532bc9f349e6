use crate::database::Message;
use crate::llm::ChatTurn;
use crate::tools::ToolContext;

/// How many recent persisted messages feed the generation call.
pub const HISTORY_WINDOW: i64 = 4;
/// Document slice embedded into the rewritten current turn. More generous
/// than the system-context budget because it replaces it for RAG turns.
const HISTORY_DOC_SLICE: usize = 4_000;

/// Builds the message list for one generation call: the recent window
/// minus the newest entry (that is the current turn, already persisted),
/// then the current turn, rewritten to carry web or document context when
/// one is present. At most one rewrite applies.
pub fn build_history(
    recent: &[Message],
    current_message: &str,
    tool: Option<&ToolContext>,
    doc: Option<&str>,
) -> Vec<ChatTurn> {
    let mut turns: Vec<ChatTurn> = recent
        .iter()
        .take(recent.len().saturating_sub(1))
        .map(|m| ChatTurn {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();

    turns.push(ChatTurn::user(enhance_current(current_message, tool, doc)));
    turns
}

fn enhance_current(current: &str, tool: Option<&ToolContext>, doc: Option<&str>) -> String {
    if let Some(tool) = tool.filter(|t| t.is_web_search()) {
        return format!(
            "{}\n\n[Here are current search results to help answer this question:]\n{}\n\n\
[Use the search results above to answer my question about: {}]",
            current,
            tool.text(),
            current
        );
    }

    if let Some(doc) = doc.filter(|d| !d.trim().is_empty()) {
        let mut end = HISTORY_DOC_SLICE.min(doc.len());
        while !doc.is_char_boundary(end) {
            end -= 1;
        }
        return format!(
            "{}\n\n[Here is content from my uploaded documents that is relevant to my question:]\n{}\n\n\
[Use the document content above to answer my question: {}]",
            current,
            &doc[..end],
            current
        );
    }

    current.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Role;
    use chrono::Utc;

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: 0,
            conversation_id: 1,
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn newest_persisted_message_is_dropped() {
        let recent = vec![
            message(Role::User, "first"),
            message(Role::Assistant, "reply"),
            message(Role::User, "current question"),
        ];
        let turns = build_history(&recent, "current question", None, None);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "first");
        assert_eq!(turns[1].content, "reply");
        assert_eq!(turns[2].content, "current question");
        assert_eq!(turns[2].role, Role::User);
    }

    #[test]
    fn web_context_rewrites_the_current_turn() {
        let tool = ToolContext::WebSearch("result lines".into());
        let turns = build_history(&[], "who won", Some(&tool), Some("doc text"));
        let current = &turns.last().unwrap().content;
        assert!(current.contains("search results"));
        assert!(current.contains("result lines"));
        // Web context wins; the document rewrite must not also apply.
        assert!(!current.contains("uploaded documents"));
    }

    #[test]
    fn document_context_rewrites_when_no_web_context() {
        let turns = build_history(&[], "summarize", None, Some("doc body"));
        let current = &turns.last().unwrap().content;
        assert!(current.contains("uploaded documents"));
        assert!(current.contains("doc body"));
    }

    #[test]
    fn non_web_tool_context_is_never_injected() {
        let tool = ToolContext::Weather("sunny".into());
        let turns = build_history(&[], "weather?", Some(&tool), None);
        assert_eq!(turns.last().unwrap().content, "weather?");
    }

    #[test]
    fn document_slice_is_bounded() {
        let doc = "d".repeat(10_000);
        let turns = build_history(&[], "q", None, Some(&doc));
        let current = &turns.last().unwrap().content;
        assert!(current.len() < 5_000);
    }
}
