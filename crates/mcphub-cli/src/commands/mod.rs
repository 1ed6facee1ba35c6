//! CLI command implementations.

pub mod call;
pub mod check_config;
pub mod servers;
pub mod tools;
pub mod watch;

use mcphub_core::ServerStatus;

use crate::AppContext;

/// Connect every enabled server in the default scope that is not already
/// connected. Failures are logged; the server keeps its error status.
pub async fn connect_enabled(ctx: &AppContext) {
    let scope = ctx.config.general.default_scope();
    for (descriptor, state) in ctx.hub.supervisor.statuses(Some(&scope)) {
        if !descriptor.enabled || state.status == ServerStatus::Connected {
            continue;
        }
        match ctx.hub.supervisor.connect(descriptor.id).await {
            Ok(ServerStatus::Connected) => {}
            Ok(status) => tracing::warn!(server = %descriptor.name, %status, "Server did not connect"),
            Err(e) => tracing::warn!(server = %descriptor.name, error = %e, "Connect failed"),
        }
    }
}
