//! Results of diagram-rendering backends: a short summary for the model and
//! an image element for the canvas.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::io::Cursor;
use std::path::PathBuf;
use vsa_mcp_client::ToolSegment;

use crate::canvas::{CanvasCommand, CanvasCommandType};

const DEFAULT_MESSAGE: &str = "Generated diagram.";

const MAX_WIDTH: u32 = 640;
const MAX_HEIGHT: u32 = 480;
const MIN_SIZE: u32 = 120;
const ORIGIN: (u32, u32) = (80, 80);

/// What a diagram server reports once the image is on disk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiagramResult {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DiagramResult {
    /// The first text segment that decodes to a diagram report carrying a
    /// message or a path.
    pub fn from_segments(segments: &[ToolSegment]) -> Option<Self> {
        segments.iter().find_map(|segment| match segment {
            ToolSegment::Text { text } => serde_json::from_str::<DiagramResult>(text)
                .ok()
                .filter(|result| result.path.is_some() || result.message.is_some()),
            ToolSegment::Json { .. } => None,
        })
    }

    pub fn summary(&self) -> String {
        let message = self
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MESSAGE);
        match &self.path {
            Some(path) => format!("{} Diagram path: {}", message, path.display()),
            None => message.to_string(),
        }
    }

    /// Read the rendered image and wrap it in a canvas patch that adds it as an
    /// image element. `Ok(None)` when the server reported no path.
    pub async fn canvas_command(
        &self,
        session_id: &str,
    ) -> Result<Option<CanvasCommand>, std::io::Error> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(path).await?;
        let (width, height) = image_dimensions(&bytes)
            .map(|(w, h)| constrain_dimensions(w, h))
            .unwrap_or((MAX_WIDTH, MAX_HEIGHT));
        Ok(Some(image_command(session_id, &bytes, width, height)))
    }
}

fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Scale down to fit the placement box, never up, keeping a minimum size.
fn constrain_dimensions(width: u32, height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (MAX_WIDTH, MAX_HEIGHT);
    }
    let scale = (MAX_WIDTH as f64 / width as f64)
        .min(MAX_HEIGHT as f64 / height as f64)
        .min(1.0);
    let scaled = |side: u32| ((side as f64 * scale).round() as u32).max(MIN_SIZE);
    (scaled(width), scaled(height))
}

fn image_command(session_id: &str, bytes: &[u8], width: u32, height: u32) -> CanvasCommand {
    let element_id = format!("diagram_{}", uuid::Uuid::new_v4().simple());
    let src = format!("data:image/png;base64,{}", STANDARD.encode(bytes));
    CanvasCommand {
        id: format!("cmd_{}", uuid::Uuid::new_v4().simple()),
        session_id: session_id.to_string(),
        kind: CanvasCommandType::ExcalidrawPatch,
        payload: json!({
            "summary": "Added diagram snapshot to canvas",
            "operations": [{
                "kind": "add_elements",
                "elements": [{
                    "id": element_id,
                    "type": "image",
                    "x": ORIGIN.0,
                    "y": ORIGIN.1,
                    "width": width,
                    "height": height,
                    "fileId": format!("{}_file", element_id),
                    "src": src,
                    "strokeColor": "#0ea5e9",
                    "backgroundColor": "transparent",
                }],
            }],
        }),
        issued_at: Utc::now().timestamp_millis(),
        issued_by: "user".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report(value: serde_json::Value) -> Vec<ToolSegment> {
        vec![ToolSegment::text(value.to_string())]
    }

    #[test]
    fn test_summary_includes_path() {
        let result = DiagramResult::from_segments(&report(json!({
            "status": "success",
            "path": "/tmp/diagrams/web.png",
            "message": "Diagram generated."
        })))
        .unwrap();
        assert_eq!(result.summary(), "Diagram generated. Diagram path: /tmp/diagrams/web.png");

        let bare = DiagramResult {
            status: None,
            path: None,
            message: Some("  ".to_string()),
        };
        assert_eq!(bare.summary(), "Generated diagram.");
    }

    #[test]
    fn test_non_reports_are_ignored() {
        assert_eq!(DiagramResult::from_segments(&[ToolSegment::text("plain text")]), None);
        assert_eq!(DiagramResult::from_segments(&report(json!({"icons": ["ec2"]}))), None);
        assert_eq!(
            DiagramResult::from_segments(&[ToolSegment::json(&json!({"path": "/x.png"}))]),
            None
        );
    }

    #[test]
    fn test_constrain_dimensions() {
        assert_eq!(constrain_dimensions(800, 600), (640, 480));
        assert_eq!(constrain_dimensions(1280, 480), (640, 240));
        assert_eq!(constrain_dimensions(100, 50), (120, 120));
        assert_eq!(constrain_dimensions(0, 10), (640, 480));
    }

    #[tokio::test]
    async fn test_canvas_command_embeds_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diagram.png");
        image::RgbaImage::new(800, 600).save(&path).unwrap();

        let result = DiagramResult {
            status: Some("success".to_string()),
            path: Some(path),
            message: None,
        };
        let command = result.canvas_command("primary-session").await.unwrap().unwrap();
        assert_eq!(command.session_id, "primary-session");
        assert_eq!(command.kind, CanvasCommandType::ExcalidrawPatch);

        let operation = &command.payload["operations"][0];
        assert_eq!(operation["kind"], "add_elements");
        let element = &operation["elements"][0];
        assert_eq!(element["type"], "image");
        assert_eq!((element["width"].clone(), element["height"].clone()), (json!(640), json!(480)));
        assert!(element["src"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,iVBORw0KGgo"));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let result = DiagramResult {
            status: None,
            path: Some(PathBuf::from("/nonexistent/diagram.png")),
            message: None,
        };
        assert!(result.canvas_command("s").await.is_err());

        let no_path = DiagramResult {
            status: None,
            path: None,
            message: Some("done".to_string()),
        };
        assert!(no_path.canvas_command("s").await.unwrap().is_none());
    }
}
