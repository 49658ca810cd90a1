//! Lamp and color commands.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use chunkcast_core::config::ChunkcastConfig;
use chunkcast_core::QoS;
use chunkcast_services::{HexColor, LampCommand, Transport};

use super::connect;

/// How long to wait for the lamp to echo its new state.
const ACK_WAIT: Duration = Duration::from_secs(5);

pub async fn cmd_lamp(config: &ChunkcastConfig, state: &str) -> Result<()> {
    let Some(command) = LampCommand::parse(state.as_bytes()) else {
        bail!("lamp state must be on or off, got {state:?}");
    };

    let (transport, mut inbound) = connect(config, 0).await?;
    transport
        .subscribe(&config.topics.lamp_ack, QoS::AtMostOnce)
        .await?;

    let sent = transport
        .publish(
            &config.topics.lamp_command,
            Bytes::from_static(command.as_str().as_bytes()),
            QoS::AtLeastOnce,
        )
        .await
        .context("failed to publish lamp command");

    let ack = match sent {
        Ok(()) => tokio::time::timeout(ACK_WAIT, async {
            while let Some(msg) = inbound.recv().await {
                if msg.topic == config.topics.lamp_ack {
                    return Some(msg.payload);
                }
            }
            None
        })
        .await
        .ok()
        .flatten(),
        Err(e) => {
            let _ = transport.disconnect().await;
            return Err(e);
        }
    };
    let _ = transport.disconnect().await;

    match ack {
        Some(payload) => println!("Lamp is {}", String::from_utf8_lossy(&payload)),
        None => println!(
            "Sent {} to {} (no acknowledgment within {}s)",
            command.as_str(),
            config.topics.lamp_command,
            ACK_WAIT.as_secs()
        ),
    }
    Ok(())
}

pub async fn cmd_color(config: &ChunkcastConfig, value: &str) -> Result<()> {
    let value = value.trim_start_matches('#').to_ascii_uppercase();
    let Some(color) = HexColor::parse(value.as_bytes()) else {
        bail!("color must be six hex digits (RRGGBB), got {value:?}");
    };

    let (transport, _inbound) = connect(config, 0).await?;
    let sent = transport
        .publish(
            &config.topics.color,
            Bytes::from(color.to_string()),
            QoS::AtLeastOnce,
        )
        .await;
    let _ = transport.disconnect().await;
    sent.context("failed to publish color")?;

    println!("Sent color {color} to {}", config.topics.color);
    Ok(())
}
