//! `loopctl`: drive a remote event loop from the command line.
//!
//! ```text
//! loopctl ping
//! loopctl call set_title '"hello"'
//! loopctl inject '{"method":"emit","args":"click"}'
//! loopctl query '{"method":"get_size"}'
//! loopctl shutdown
//! ```

use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use loopctl_core::client::{ClientOptions, ControlClient};
use loopctl_core::message::{ResponseFrame, Status};
use loopctl_core::network::ConnectionInfo;

#[derive(Parser, Debug)]
#[command(name = "loopctl", about = "Remote control for loopctl hosts")]
struct Cli {
    /// Host address.
    #[arg(short, long, default_value = "127.0.0.1:7300")]
    addr: String,

    /// Shared token, if the host requires one.
    #[arg(short, long)]
    token: Option<String>,

    /// Seconds to wait for each response.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Round-trip a Ping command through the GUI thread.
    Ping,
    /// Send a raw Inject-Event payload.
    Inject { payload: String },
    /// Send a raw Query-State selector.
    Query { selector: String },
    /// Ask the host to drain and stop.
    Shutdown,
    /// Invoke a named host method with JSON arguments.
    Call {
        method: String,
        #[arg(default_value = "null")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

/// Returns whether the host answered `Ok`.
async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let info: ConnectionInfo = cli.addr.parse()?;
    let mut options = ClientOptions::new("loopctl");
    options.token = cli.token;
    options.request_timeout = Some(Duration::from_secs(cli.timeout.max(1)));

    let client = ControlClient::connect(info, options).await?;
    debug!("session {}", client.session_id());

    let ok = match cli.command {
        Cmd::Ping => {
            let started = Instant::now();
            let response = client.ping().await?;
            if response.status.is_ok() {
                let tick = <[u8; 8]>::try_from(response.result.as_slice()).map(u64::from_le_bytes);
                match tick {
                    Ok(tick) => println!("pong at tick {tick} in {:?}", started.elapsed()),
                    Err(_) => println!("pong in {:?}", started.elapsed()),
                }
                true
            } else {
                print_response(&response)
            }
        }
        Cmd::Inject { payload } => print_response(&client.inject(payload.into_bytes()).await?),
        Cmd::Query { selector } => print_response(&client.query(selector.into_bytes()).await?),
        Cmd::Shutdown => print_response(&client.shutdown_host().await?),
        Cmd::Call { method, args } => {
            let args: Value = serde_json::from_str(&args)?;
            let value = client.invoke(&method, args).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            true
        }
    };

    client.goodbye().await?;
    Ok(ok)
}

fn print_response(response: &ResponseFrame) -> bool {
    match response.status {
        Status::Ok => {
            match serde_json::from_slice::<Value>(&response.result) {
                Ok(value) => println!("{value}"),
                Err(_) if response.result.is_empty() => println!("ok"),
                Err(_) => println!("{}", String::from_utf8_lossy(&response.result)),
            }
            true
        }
        status => {
            eprintln!("{status:?}: {}", response.reason());
            false
        }
    }
}
