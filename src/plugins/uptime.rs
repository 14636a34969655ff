//! Built-in plugin reporting how long the node has been up.

use clap::{Arg, ArgAction};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::ipc::{Channel, Event};
use crate::plugins::{Plugin, PluginContext, PluginError, PluginScope};

pub const DISABLE_FLAG: &str = "disable-uptime-report";

/// Topic of the events published on every report.
pub const UPTIME_TOPIC: &str = "uptime";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub struct UptimeReport {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl UptimeReport {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Default for UptimeReport {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for UptimeReport {
    fn name(&self) -> &str {
        "uptime"
    }

    fn scope(&self) -> PluginScope {
        PluginScope::Shared
    }

    fn extend_cli(&self, command: clap::Command) -> clap::Command {
        command.arg(
            Arg::new(DISABLE_FLAG)
                .long(DISABLE_FLAG)
                .action(ArgAction::SetTrue)
                .help("Do not periodically report node uptime"),
        )
    }

    fn should_start(&self, ctx: &PluginContext<'_>) -> bool {
        !ctx.args.plugin_flag(DISABLE_FLAG)
    }

    fn start(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| PluginError::Start {
            plugin: self.name().to_string(),
            message: e.to_string(),
        })?;

        let channel = ctx.channel.clone();
        let network = ctx.config.network.name();
        self.task = Some(runtime.spawn(report(channel, network, self.interval)));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn report(channel: Channel, network: &'static str, interval: Duration) {
    let started = Instant::now();
    let mut ticks = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticks.tick().await;

    loop {
        ticks.tick().await;
        let seconds = started.elapsed().as_secs();
        tracing::info!(network, uptime_secs = seconds, "Node uptime");

        let event = Event::Custom {
            topic: UPTIME_TOPIC.to_string(),
            payload: serde_json::json!({ "seconds": seconds, "network": network }),
        };
        if let Err(e) = channel.publish(event) {
            tracing::debug!(error = %e, "Uptime report not published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cli::{parse_with, Cli};
    use crate::config::schema::{DbEngine, Network, NodeConfig};
    use crate::ipc::Broker;
    use clap::CommandFactory;
    use std::path::PathBuf;

    fn config() -> NodeConfig {
        NodeConfig {
            network: Network::Mainnet,
            data_dir: PathBuf::from("/tmp/skein"),
            db_engine: DbEngine::LevelDb,
        }
    }

    #[test]
    fn test_disable_flag() {
        let plugin = UptimeReport::new();
        let cli = parse_with(
            plugin.extend_cli(Cli::command()),
            ["skein", "--disable-uptime-report"],
        )
        .unwrap();

        let config = config();
        let channel = Broker::new().create_channel("networking");
        let ctx = PluginContext {
            args: &cli.launch,
            config: &config,
            extras: None,
            channel: &channel,
            scope: PluginScope::Shared,
        };
        assert!(!plugin.should_start(&ctx));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut plugin = UptimeReport::with_interval(Duration::from_millis(10));
        let args = Default::default();
        let config = config();
        let channel = Broker::new().create_channel("networking");
        let ctx = PluginContext {
            args: &args,
            config: &config,
            extras: None,
            channel: &channel,
            scope: PluginScope::Shared,
        };

        assert!(plugin.should_start(&ctx));
        plugin.start(&ctx).unwrap();
        assert!(plugin.is_running());
        plugin.stop();
        assert!(!plugin.is_running());
    }
}
