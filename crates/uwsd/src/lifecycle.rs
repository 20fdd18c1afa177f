//! Command-based lifecycle collaborator.
//!
//! Each service may configure a `restart_command` argv; `{id}` in any
//! argument is replaced with the service id. Exit status 0 is success.

use std::collections::HashMap;

use anyhow::{Context, bail};
use tokio::process::Command;
use tracing::debug;

use uws_core::ResolvedService;
use uws_health::{BoxFuture, Lifecycle};

pub struct CommandLifecycle {
    commands: HashMap<String, Vec<String>>,
}

impl CommandLifecycle {
    pub fn from_services(services: &[ResolvedService]) -> Self {
        let commands = services
            .iter()
            .filter_map(|svc| {
                let argv = svc.restart_command.as_ref()?;
                (!argv.is_empty()).then(|| (svc.id.clone(), argv.clone()))
            })
            .collect();
        Self { commands }
    }

    pub fn has_command(&self, service_id: &str) -> bool {
        self.commands.contains_key(service_id)
    }

    async fn run(&self, service_id: &str) -> anyhow::Result<()> {
        let Some(argv) = self.commands.get(service_id) else {
            bail!("no restart_command configured for {service_id}");
        };
        let argv: Vec<String> = argv.iter().map(|a| a.replace("{id}", service_id)).collect();
        debug!(%service_id, command = ?argv, "running restart command");

        // Dropped on timeout: the child goes with it.
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to spawn {:?}", argv[0]))?;

        if !status.success() {
            bail!("restart command exited with {status}");
        }
        Ok(())
    }
}

impl Lifecycle for CommandLifecycle {
    fn restart<'a>(&'a self, service_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.run(service_id))
    }
}
