//! `mcphub tools`

use crate::AppContext;

pub async fn run(ctx: &AppContext) -> anyhow::Result<()> {
    super::connect_enabled(ctx).await;

    let tools = ctx.hub.router.list_available_tools();
    if tools.is_empty() {
        println!("No tools available.");
        return Ok(());
    }

    for tool in tools {
        println!("{} [{}]", tool.name, tool.server);
        if !tool.description.is_empty() {
            println!("    {}", tool.description);
        }
    }
    Ok(())
}
