use anyhow::{anyhow, bail, Context, Result};
use console::style;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use vsa::config::{Config, RealtimeSettings};
use vsa::tools::{summarize_result, ToolRegistry, ToolTarget, EMPTY_SUMMARY};
use vsa_mcp_client::ToolSegment;

use crate::signal::shutdown_signal;

pub fn parse_arguments(args: Option<&str>) -> Result<Value> {
    let Some(args) = args.filter(|args| !args.trim().is_empty()) else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(args).context("Tool arguments are not valid JSON")?;
    if !value.is_object() {
        bail!("Tool arguments must be a JSON object");
    }
    Ok(value)
}

/// Call one backend tool the way a session would, and print the result.
pub async fn handle_tool(config: &Config, name: &str, args: Option<&str>, raw: bool) -> Result<()> {
    let settings = RealtimeSettings::from_config(config)?;
    let registry = ToolRegistry::from_settings(&settings, config)?;

    let route = match registry.classify(name) {
        ToolTarget::Backend(route) => route,
        ToolTarget::Internal => bail!("{} is a canvas command and has no backend", name),
        ToolTarget::Unsupported => bail!("No backend is registered for tool {}", name),
    };
    let arguments = route.enrich(parse_arguments(args)?);
    println!(
        "{} {} via {}",
        style("calling").dim(),
        style(name).cyan().bold(),
        style(&route.name).green()
    );

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };
    let result = route.backend.call(name, arguments, cancel).await;
    interrupt.abort();

    match result {
        Ok(segments) if raw => print_segments(&segments),
        Ok(segments) => {
            let (summary, _) =
                summarize_result(&segments, route.heading_for(name).as_deref(), route.result_hook);
            if summary.trim().is_empty() {
                println!("{}", style(EMPTY_SUMMARY).dim());
            } else {
                println!("{}", summary);
            }
            Ok(())
        }
        Err(e) => {
            println!("\n  {} {}\n", style(format!("{} error:", e.kind())).red().bold(), e);
            Err(anyhow!(e))
        }
    }
}

fn print_segments(segments: &[ToolSegment]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(segments)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(None).unwrap(), serde_json::json!({}));
        assert_eq!(parse_arguments(Some("  ")).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_arguments(Some(r#"{"query":"vpc"}"#)).unwrap()["query"],
            "vpc"
        );
        assert!(parse_arguments(Some("[1, 2]")).is_err());
        assert!(parse_arguments(Some("{")).is_err());
    }
}
