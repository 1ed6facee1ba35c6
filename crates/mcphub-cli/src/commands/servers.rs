//! `mcphub servers`

use chrono::Local;

use crate::AppContext;

pub async fn run(ctx: &AppContext, connect: bool) -> anyhow::Result<()> {
    if connect {
        super::connect_enabled(ctx).await;
    }

    let statuses = ctx.hub.supervisor.statuses(None);
    if statuses.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    println!("{:<16} {:<24} {:<16} {:<13} TARGET", "SCOPE", "NAME", "TRANSPORT", "STATUS");
    for (descriptor, state) in statuses {
        let marker = if descriptor.is_protected() { " (protected)" } else { "" };
        println!(
            "{:<16} {:<24} {:<16} {:<13} {}{}",
            descriptor.scope.as_str(),
            descriptor.name,
            descriptor.transport.kind().to_string(),
            state.status.to_string(),
            descriptor.transport.target(),
            marker
        );
        if let Some(connected) = state.last_connected {
            println!("    last connected: {}", connected.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(error) = &state.last_error {
            println!("    last error: {} (retries: {})", error, state.retry_count);
        }
    }
    Ok(())
}
