use std::process;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use testhost_channel::{Channel, ChannelConfig, ChannelListener};

#[derive(Debug, PartialEq)]
struct Args {
    port: u16,
    accept_timeout: Option<Duration>,
    ack_timeout: Option<Duration>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: testhost-listen <port> [--accept-timeout <secs>] [--ack-timeout <secs>]"
            );
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <port>                    Loopback port to listen on (0 picks a free one)");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --accept-timeout <secs>   Give up if no test host connects [default: wait]");
            eprintln!("  --ack-timeout <secs>      Wait for TestHost.Acknowledge on close [default: 10]");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `TESTHOST_LOG` picks the level for this crate.
/// `LOG_FORMAT=json` switches stderr output to JSON lines.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TESTHOST_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("testhost_channel={level},testhost_listen={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_secs(flag: &str, value: Option<&String>) -> Result<Duration, String> {
    let value = value.ok_or(format!("{flag} requires a value"))?;
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("{flag}: '{value}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("{flag}: '{value}' is out of range"))
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut port: Option<u16> = None;
    let mut accept_timeout = None;
    let mut ack_timeout = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--accept-timeout" => {
                i += 1;
                accept_timeout = Some(parse_secs("--accept-timeout", args.get(i))?);
            }
            "--ack-timeout" => {
                i += 1;
                ack_timeout = Some(parse_secs("--ack-timeout", args.get(i))?);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if port.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                port = Some(arg.parse().map_err(|_| format!("invalid port: {arg}"))?);
            }
        }
        i += 1;
    }

    let port = port.ok_or("missing required argument: <port>")?;
    Ok(Args {
        port,
        accept_timeout,
        ack_timeout,
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = ChannelConfig::default().with_accept_timeout(args.accept_timeout);
    if let Some(timeout) = args.ack_timeout {
        config = config.with_ack_timeout(timeout);
    }

    let listener = ChannelListener::bind(args.port, config)?;
    let port = listener.port().context("failed to read bound port")?;
    println!("{port}");

    let channel: Channel = listener.accept().await?;
    let queue = channel.receive_queue();
    while let Some(message) = queue.take().await {
        let line = serde_json::to_string(&message).context("failed to render message")?;
        println!("{line}");
    }

    let outcome = channel.close().await;
    eprintln!("closed: {outcome:?} (reader: {:?})", channel.reader_state());
    Ok(())
}
