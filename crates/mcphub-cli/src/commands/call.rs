//! `mcphub call <tool> <json-args>`

use anyhow::Context;
use mcphub_core::ToolArguments;

use crate::AppContext;

pub async fn run(ctx: &AppContext, tool: &str, args: &str) -> anyhow::Result<()> {
    let json: serde_json::Value = serde_json::from_str(args).context("arguments must be valid JSON")?;
    let arguments = ToolArguments::from_json(json).map_err(anyhow::Error::msg)?;

    super::connect_enabled(ctx).await;

    let envelope = ctx.hub.router.invoke(tool, arguments).await;
    if envelope.success {
        println!("{}", envelope);
        tracing::debug!(duration_ms = envelope.duration_ms, "Call succeeded");
        Ok(())
    } else {
        anyhow::bail!("{}", envelope.model_text())
    }
}
