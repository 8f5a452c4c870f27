//! vbridge-echo: echo a message through the local/remote bridge.
//!
//! Wires an echo server, a bridge client, a local echo peer and an echo
//! caller into one local runtime, starts the caller and prints what came
//! back over the remote transport.

use std::process;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use vbridge::BridgeConfig;
use vbridge::LocalRuntime;
use vbridge::apps::{BridgeClient, EchoCaller, EchoServer, LocalEcho};
use vbridge::config::{ECHO_CALLER_URL, LOCAL_ECHO_URL};
use vbridge::remote::ListenSpec;

const DEFAULT_MESSAGE: &str = "Hello, world!";

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("VBRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("vbridge={level},vbridge_echo={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

struct Args {
    message: String,
    listen: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut message = DEFAULT_MESSAGE.to_string();
    let mut listen = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--message" => {
                i += 1;
                message = args.get(i).ok_or("--message requires a value")?.clone();
            }
            "--listen" => {
                i += 1;
                listen = Some(args.get(i).ok_or("--listen requires a value")?.clone());
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Args { message, listen })
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: vbridge-echo [--message <text>] [--listen <addr>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --message <text>  Message to echo [default: {DEFAULT_MESSAGE}]");
            eprintln!("  --listen <addr>   Remote server listen address [default: 127.0.0.1:0]");
            process::exit(2);
        }
    };

    init_tracing();

    match run(args).await {
        Ok(echoed) => println!("{echoed}"),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<String> {
    let mut config = BridgeConfig::from_env();
    if let Some(addr) = args.listen {
        config = config.with_listen(ListenSpec::new(addr));
    }

    let runtime = LocalRuntime::from_config(&config);
    runtime.register(config.relay_url.clone(), EchoServer::from_config(&config))?;
    runtime.register(config.bridge_url.clone(), BridgeClient::from_config(&config))?;
    runtime.register(LOCAL_ECHO_URL, LocalEcho)?;
    let caller = runtime.register(
        ECHO_CALLER_URL,
        EchoCaller::new(config.bridge_url.clone(), args.message),
    )?;

    let started = runtime
        .start(ECHO_CALLER_URL)
        .await
        .context("echo caller failed to start");
    let echoed = caller.delegate().echoed().map(str::to_string);
    runtime.shutdown().await;

    started?;
    echoed.context("echo caller finished without a result")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(rest: &[&str]) -> Vec<String> {
        std::iter::once("vbridge-echo")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        let args = parse_args(&argv(&[])).unwrap();
        assert_eq!(args.message, DEFAULT_MESSAGE);
        assert!(args.listen.is_none());
    }

    #[test]
    fn flags_are_parsed() {
        let args = parse_args(&argv(&["--message", "hi", "--listen", "127.0.0.1:7000"])).unwrap();
        assert_eq!(args.message, "hi");
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:7000"));
    }

    #[test]
    fn missing_value_and_unknown_flags_fail() {
        assert!(parse_args(&argv(&["--message"])).is_err());
        assert!(parse_args(&argv(&["--verbose"])).is_err());
    }

    #[tokio::test]
    async fn run_echoes_message() {
        let echoed = run(Args {
            message: "TestMessage".to_string(),
            listen: None,
        })
        .await
        .unwrap();
        assert_eq!(echoed, "TestMessage");
    }
}
