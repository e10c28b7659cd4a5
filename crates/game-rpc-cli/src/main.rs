//! Game RPC command line client
//!
//! Connects using `GAME_RPC_ADDRESS`, `GAME_RPC_PORT` and
//! `GAME_RPC_STREAM_PORT` (see [`ConnectConfig::from_env`]) and runs one of:
//! - `status`: server version and traffic counters
//! - `services [SERVICE]`: the method table as JSON
//! - `call SERVICE PROCEDURE [ARG...]`: invoke a procedure once
//! - `watch SERVICE PROCEDURE [ARG...] [--rate HZ]`: stream a procedure
//!   until interrupted

use anyhow::{Context, Result, bail};
use game_rpc_client::{Call, Client, ConnectConfig};
use game_rpc_core::Value;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const USAGE: &str = "usage: game-rpc <status | services [SERVICE] | call SERVICE PROCEDURE [ARG...] | watch SERVICE PROCEDURE [ARG...] [--rate HZ]>";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("GAME_RPC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        bail!(USAGE);
    };

    let mut config = ConnectConfig::from_env()?;
    if config.name.is_empty() {
        config.name = "game-rpc".to_string();
    }
    if command != "watch" {
        config.stream_port = None;
    }
    let client = Client::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", config.address, config.rpc_port))?;

    let result = match command.as_str() {
        "status" => status(&client).await,
        "services" => services(&client, rest.first().map(String::as_str)),
        "call" => call(&client, rest).await,
        "watch" => watch(&client, rest).await,
        _ => Err(anyhow::anyhow!(USAGE)),
    };
    client.close().await;
    result
}

async fn status(client: &Client) -> Result<()> {
    let status = client.status().await?;
    println!("client:        {}", client.client_identifier());
    println!("version:       {}", status.version);
    println!("bytes read:    {} ({:.1}/s)", status.bytes_read, status.bytes_read_rate);
    println!(
        "bytes written: {} ({:.1}/s)",
        status.bytes_written, status.bytes_written_rate
    );
    println!("rpcs:          {} ({:.1}/s)", status.rpcs_executed, status.rpc_rate);
    println!(
        "stream rpcs:   {} active, {} executed ({:.1}/s)",
        status.stream_rpcs, status.stream_rpcs_executed, status.stream_rpc_rate
    );
    Ok(())
}

fn services(client: &Client, service: Option<&str>) -> Result<()> {
    let json = match service {
        Some(name) => serde_json::to_string_pretty(client.services().service(name)?)?,
        None => serde_json::to_string_pretty(client.services())?,
    };
    println!("{}", json);
    Ok(())
}

async fn call(client: &Client, args: &[String]) -> Result<()> {
    let call = parse_call(args)?;
    match client.call(&call).await? {
        Some(value) => println!("{}", value),
        None => info!("{}.{} returned no value", call.service, call.procedure),
    }
    Ok(())
}

async fn watch(client: &Client, args: &[String]) -> Result<()> {
    let (args, rate) = match args.iter().position(|a| a == "--rate") {
        Some(i) => {
            let rate = args
                .get(i + 1)
                .context("--rate needs a value")?
                .parse::<f32>()
                .context("--rate must be a number")?;
            let mut rest = args.to_vec();
            rest.drain(i..=i + 1);
            (rest, Some(rate))
        }
        None => (args.to_vec(), None),
    };
    let call = parse_call(&args)?;

    let stream = client.add_stream(&call).await?;
    if let Some(rate) = rate {
        stream.set_rate(rate).await?;
    }
    stream.add_callback(|value: &game_rpc_core::Result<Value>| match value {
        Ok(value) => println!("{}", value),
        Err(e) => eprintln!("error: {}", e),
    });
    stream.start(false).await?;
    info!("Watching stream {} (Ctrl-C to stop)", stream.id());

    tokio::signal::ctrl_c().await?;
    stream.remove().await?;
    Ok(())
}

fn parse_call(args: &[String]) -> Result<Call> {
    let [service, procedure, rest @ ..] = args else {
        bail!(USAGE);
    };
    Ok(rest
        .iter()
        .fold(Call::new(service.as_str(), procedure.as_str()), |call, arg| {
            call.arg(parse_value(arg))
        }))
}

/// Best-effort literal: integer, float, bool, `null`, otherwise string.
/// Arguments are coerced to the declared parameter types on invocation.
fn parse_value(arg: &str) -> Value {
    if let Ok(i) = arg.parse::<i64>() {
        return Value::Int64(i);
    }
    if let Ok(f) = arg.parse::<f64>() {
        return Value::Double(f);
    }
    match arg {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::from(arg),
    }
}
