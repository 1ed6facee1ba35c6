//! `mcphub watch`: print events until Ctrl-C.

use mcphub_core::{DomainEvent, EventLevel};
use tokio::sync::broadcast::error::RecvError;

use crate::AppContext;

pub async fn run(ctx: &AppContext) -> anyhow::Result<()> {
    let mut events = ctx.hub.notifier.subscribe_all();
    println!("Watching events (Ctrl-C to stop)...");

    super::connect_enabled(ctx).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event)?,
                Err(RecvError::Lagged(missed)) => eprintln!("... {} events dropped", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn print_event(event: &DomainEvent) -> anyhow::Result<()> {
    let level = match event.level {
        EventLevel::Info => "info",
        EventLevel::Warning => "warn",
    };
    println!(
        "{} {:<4} [{}] {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        level,
        event.scope,
        serde_json::to_string(&event.kind)?
    );
    Ok(())
}
