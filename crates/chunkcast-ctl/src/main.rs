//! chunkcast-ctl — command-line client for chunked transfers and the device
//! simulators.

use anyhow::{Context, Result};

use chunkcast_core::config::ChunkcastConfig;

mod cmd;

fn print_usage() {
    println!("chunkcast-ctl — send chunked transfers over MQTT");
    println!();
    println!("Usage: chunkcast-ctl [--broker HOST] [--port PORT] [--namespace NS] <command>");
    println!();
    println!("Commands:");
    println!("  send <file> [--chunk-size N] [--delay-ms N] [--retries N] [--name NAME]");
    println!("                           Send a file in acknowledged chunks");
    println!("  send-whole <file> [--topic T]");
    println!("                           Publish a file as a single message");
    println!("  lamp on|off              Switch the lamp and wait for its acknowledgment");
    println!("  color RRGGBB             Send a color");
    println!("  help                     Show this message");
    println!();
    println!("Configuration is read from {}", ChunkcastConfig::file_path().display());
}

/// Global options, then the command words in order.
struct GlobalArgs<'a> {
    broker: Option<&'a str>,
    port: Option<u16>,
    namespace: Option<&'a str>,
    remaining: Vec<&'a str>,
}

fn parse_global(args: &[String]) -> Result<GlobalArgs<'_>> {
    let mut parsed = GlobalArgs {
        broker: None,
        port: None,
        namespace: None,
        remaining: Vec::new(),
    };
    let mut i = 0;
    // Global options are only recognised before the command word.
    while i < args.len() {
        match args[i].as_str() {
            "--broker" if parsed.remaining.is_empty() => {
                i += 1;
                parsed.broker = Some(
                    args.get(i)
                        .map(String::as_str)
                        .context("--broker requires a value")?,
                );
            }
            "--port" if parsed.remaining.is_empty() => {
                i += 1;
                parsed.port = Some(
                    args.get(i)
                        .context("--port requires a value")?
                        .parse()
                        .context("--port must be a number")?,
                );
            }
            "--namespace" if parsed.remaining.is_empty() => {
                i += 1;
                parsed.namespace = Some(
                    args.get(i)
                        .map(String::as_str)
                        .context("--namespace requires a value")?,
                );
            }
            other => parsed.remaining.push(other),
        }
        i += 1;
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let global = parse_global(&args)?;
    if matches!(global.remaining.as_slice(), [] | ["help"] | ["--help"] | ["-h"]) {
        print_usage();
        return Ok(());
    }

    let mut config = ChunkcastConfig::load().context("failed to load config")?;
    if let Some(host) = global.broker {
        config.broker.host = host.to_string();
    }
    if let Some(port) = global.port {
        config.broker.port = port;
    }
    if let Some(ns) = global.namespace {
        config.topics.namespace = ns.to_string();
    }
    config.validate()?;

    match global.remaining.as_slice() {
        ["send", rest @ ..]             => cmd::send::cmd_send(&config, rest).await,
        ["send-whole", rest @ ..]       => cmd::send::cmd_send_whole(&config, rest).await,
        ["lamp", state]                 => cmd::device::cmd_lamp(&config, state).await,
        ["color", value]                => cmd::device::cmd_color(&config, value).await,
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
