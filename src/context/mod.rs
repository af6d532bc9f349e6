use crate::search::SearchResult;
use crate::tools::ToolContext;

/// Character budget for document context on the API path.
pub const API_DOC_BUDGET: usize = 1_500;

const REAL_TIME_MARKER: &str = "[Real-time Data]: ";
const DOCUMENT_MARKER: &str = "[Document Context]: ";

/// Formats retrieval results into one context block, hard-truncated to the
/// budget with an ellipsis marker. `None` when there is nothing to show.
pub fn document_context(results: &[SearchResult], budget: usize) -> Option<String> {
    if results.is_empty() {
        return None;
    }

    let parts: Vec<String> = results
        .iter()
        .map(|r| format!("[From: {}]\n{}\n---", r.document_title, r.text))
        .collect();
    let mut context = parts.join("\n\n");

    if context.len() > budget {
        let mut end = budget;
        while !context.is_char_boundary(end) {
            end -= 1;
        }
        context.truncate(end);
        context.push_str("...");
    }
    Some(context)
}

/// Merges tool/web context and document context. Tool context always comes
/// first; either side may be absent and an empty result is valid.
pub fn combine(tool: Option<&ToolContext>, doc: Option<&str>) -> String {
    let mut combined = String::new();

    if let Some(tool) = tool {
        if !tool.text().trim().is_empty() {
            combined.push_str(REAL_TIME_MARKER);
            combined.push_str(tool.text());
        }
    }

    if let Some(doc) = doc.filter(|d| !d.trim().is_empty()) {
        if !combined.is_empty() {
            combined.push_str("\n\n");
        }
        combined.push_str(DOCUMENT_MARKER);
        combined.push_str(doc);
    }

    combined
}
