use vsa_mcp_client::ToolSegment;

use super::diagram::DiagramResult;
use crate::config::ResultHook;

pub const EMPTY_SUMMARY: &str = "Tool call completed with no textual summary.";

const MAX_TEXT_SEGMENTS: usize = 3;

/// Collapse backend segments into the single string injected for the model.
///
/// Up to three non-empty text segments are kept, separated by blank lines and
/// placed under `heading` when one is given. Without any text, the first JSON
/// segment is used as is. Returns an empty string when there is nothing to say.
pub fn summarize_segments(segments: &[ToolSegment], heading: Option<&str>) -> String {
    let texts: Vec<&str> = segments
        .iter()
        .filter_map(|segment| match segment {
            ToolSegment::Text { text } => Some(text.trim()),
            ToolSegment::Json { .. } => None,
        })
        .filter(|text| !text.is_empty())
        .take(MAX_TEXT_SEGMENTS)
        .collect();

    if !texts.is_empty() {
        let body = texts.join("\n\n");
        return match heading {
            Some(heading) => format!("{}\n\n{}", heading, body),
            None => body,
        };
    }

    segments
        .iter()
        .find_map(|segment| match segment {
            ToolSegment::Json { text } => Some(text.trim().to_string()),
            ToolSegment::Text { .. } => None,
        })
        .unwrap_or_default()
}

/// Summary of a successful call with the backend's result hook applied. A
/// decoded diagram is handed back so the caller can place it on the canvas.
pub fn summarize_result(
    segments: &[ToolSegment],
    heading: Option<&str>,
    hook: Option<ResultHook>,
) -> (String, Option<DiagramResult>) {
    let diagram = match hook {
        Some(ResultHook::DiagramCanvas) => DiagramResult::from_segments(segments),
        None => None,
    };
    match diagram {
        Some(diagram) => (diagram.summary(), Some(diagram)),
        None => (summarize_segments(segments, heading), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_segments_under_heading() {
        let segments = vec![
            ToolSegment::text("  first  "),
            ToolSegment::Json {
                text: "{\"raw\":true}".to_string(),
            },
            ToolSegment::text(""),
            ToolSegment::text("second"),
            ToolSegment::text("third"),
            ToolSegment::text("fourth"),
        ];
        assert_eq!(
            summarize_segments(&segments, Some("AWS Knowledge snippet:")),
            "AWS Knowledge snippet:\n\nfirst\n\nsecond\n\nthird"
        );
    }

    #[test]
    fn test_json_fallback_and_empty() {
        let segments = vec![ToolSegment::Json {
            text: "{\"results\":[]}".to_string(),
        }];
        assert_eq!(summarize_segments(&segments, Some("ignored")), "{\"results\":[]}");
        assert_eq!(summarize_segments(&[], None), "");
    }

    #[test]
    fn test_diagram_hook_replaces_summary() {
        let segments = vec![ToolSegment::text(
            r#"{"status":"success","path":"/tmp/a.png","message":"Done."}"#,
        )];
        let (summary, diagram) =
            summarize_result(&segments, Some("ignored"), Some(ResultHook::DiagramCanvas));
        assert_eq!(summary, "Done. Diagram path: /tmp/a.png");
        assert!(diagram.is_some());

        let (summary, diagram) = summarize_result(&segments, None, None);
        assert_eq!(summary, r#"{"status":"success","path":"/tmp/a.png","message":"Done."}"#);
        assert!(diagram.is_none());
    }
}
