//! CLI command modules.

pub mod device;
pub mod send;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use chunkcast_core::config::ChunkcastConfig;
use chunkcast_services::{InboundMessage, MqttTransport};

/// Connect with a per-invocation client id so several CLIs can run at once.
pub async fn connect(
    config: &ChunkcastConfig,
    chunk_size: usize,
) -> Result<(MqttTransport, mpsc::UnboundedReceiver<InboundMessage>)> {
    let client_id = format!("{}-ctl-{:08x}", config.broker.client_id, rand::random::<u32>());
    let packet_limit = config.broker.packet_limit(chunk_size);
    tracing::debug!(client_id = %client_id, packet_limit, "connecting");
    MqttTransport::connect(&config.broker, &client_id, packet_limit)
        .await
        .with_context(|| {
            format!(
                "failed to connect to broker {}:{}",
                config.broker.host, config.broker.port
            )
        })
}

/// Pull `--flag VALUE` pairs out of `args`, leaving positionals in order.
pub struct Options<'a> {
    pub positionals: Vec<&'a str>,
    flags: Vec<(&'a str, &'a str)>,
}

impl<'a> Options<'a> {
    pub fn parse(args: &[&'a str], known: &[&str]) -> Result<Self> {
        let mut positionals = Vec::new();
        let mut flags = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let arg = args[i];
            if arg.starts_with("--") {
                if !known.contains(&arg) {
                    anyhow::bail!("unknown option {arg}");
                }
                i += 1;
                let value = args
                    .get(i)
                    .with_context(|| format!("{arg} requires a value"))?;
                flags.push((arg, *value));
            } else {
                positionals.push(arg);
            }
            i += 1;
        }
        Ok(Self { positionals, flags })
    }

    pub fn get(&self, flag: &str) -> Option<&'a str> {
        self.flags
            .iter()
            .rev()
            .find(|(f, _)| *f == flag)
            .map(|(_, v)| *v)
    }

    pub fn number<T: std::str::FromStr>(&self, flag: &str) -> Result<Option<T>> {
        match self.get(flag) {
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| anyhow::anyhow!("{flag} must be a number, got {v:?}")),
            None => Ok(None),
        }
    }
}
