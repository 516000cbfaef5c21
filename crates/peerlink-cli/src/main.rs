//! # peerlink CLI Entry Point
//!
//! Main binary for peerlink. Starts servers, pings or stops them, and makes
//! single calls for scripting.
//!
//! ## Usage
//!
//! ```bash
//! # Start a server exposing the demo `echo` object
//! peerlink serve -b 0.0.0.0:7100
//!
//! # Check that it is up
//! peerlink ping 127.0.0.1:7100
//!
//! # Call a method (outputs raw JSON)
//! peerlink call 127.0.0.1:7100 echo reverse -a hello
//!
//! # Stop it
//! peerlink shutdown 127.0.0.1:7100
//! ```

use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use peerlink_cli::{install_demo, string_method, to_json, ECHO_TYPE};
use peerlink_client::ClientOptions;
use peerlink_connection::{ConnectionOptions, Value};
use peerlink_server::{Server, ServerOptions};

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// peerlink - peer-to-peer remote method invocation
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Ping(PingArgs),
    Shutdown(ShutdownArgs),
    Call(CallArgs),
}

/// Arguments for starting a server.
///
/// Every accepted connection gets its own `echo` context variable
/// implementing `peerlink.demo.Echo`.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start a peerlink server
struct ServeArgs {
    /// address to listen on
    #[argh(option, short = 'b', default = "\"0.0.0.0:7100\".into()")]
    bind: String,

    /// maximum streams per connection
    ///
    /// Defaults to the number of available CPUs.
    #[argh(option, long = "max-streams")]
    max_streams: Option<usize>,

    /// refuse static method calls and constructors from peers
    #[argh(switch, long = "deny-direct")]
    deny_direct: bool,

    /// handshake timeout in milliseconds
    #[argh(option, long = "timeout", default = "2000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// ping a peerlink server
struct PingArgs {
    /// address of the server
    #[argh(positional)]
    address: String,

    /// timeout in milliseconds
    #[argh(option, long = "timeout", default = "2000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "shutdown")]
/// ask a peerlink server to shut down
struct ShutdownArgs {
    /// address of the server
    #[argh(positional)]
    address: String,

    /// timeout in milliseconds
    #[argh(option, long = "timeout", default = "2000")]
    timeout_ms: u64,
}

/// Arguments for making a single call.
///
/// The result is written to stdout as raw JSON so it can be piped into
/// other tools. Errors go to stderr with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method of a context variable
struct CallArgs {
    /// address of the server
    #[argh(positional)]
    address: String,

    /// name of the context variable
    #[argh(positional)]
    variable: String,

    /// name of the method
    #[argh(positional)]
    method: String,

    /// string argument, repeat for several
    #[argh(option, short = 'a', long = "arg")]
    args: Vec<String>,

    /// interface declaring the method
    #[argh(option, long = "type", default = "ECHO_TYPE.into()")]
    type_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `call` output clean for piping.
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Ping(args) => {
            let rtt = tokio::task::spawn_blocking(move || {
                peerlink_client::ping(&args.address, Duration::from_millis(args.timeout_ms))
            })
            .await??;
            tracing::debug!("Round trip: {:?}", rtt);
            println!("pong");
            Ok(())
        }
        Commands::Shutdown(args) => {
            tokio::task::spawn_blocking(move || {
                peerlink_client::shutdown(&args.address, Duration::from_millis(args.timeout_ms))
            })
            .await??;
            tracing::info!("Shutdown acknowledged");
            Ok(())
        }
        Commands::Call(args) => tokio::task::spawn_blocking(move || run_call(args)).await?,
    }
}

fn server_options(args: &ServeArgs) -> ServerOptions {
    let mut connection = ConnectionOptions::default().with_allow_direct_requests(!args.deny_direct);
    if let Some(max) = args.max_streams {
        connection = connection.with_max_stream_count(max.max(1));
    }
    ServerOptions::default()
        .with_connection_timeout_ms(args.timeout_ms)
        .with_connection_options(connection)
        .with_setup(install_demo)
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let server = Server::bind(args.bind.as_str(), server_options(&args)).await?;
    tracing::info!("Serving {} on {}", ECHO_TYPE, server.local_addr());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing server");
            server.close();
        }
    }
    Ok(())
}

/// Executes the `call` subcommand on a blocking thread.
fn run_call(args: CallArgs) -> Result<()> {
    let connection = peerlink_client::connect(&args.address, ClientOptions::default())?;
    let method = string_method(&args.type_name, &args.method, args.args.len());
    let call_args = args.args.into_iter().map(Value::String).collect();

    let result = connection
        .new_scope()
        .and_then(|scope| scope.invoke_context_variable_method(&args.variable, &method, call_args));
    connection.close_wait(Some(Duration::from_secs(2)));

    println!("{}", to_json(&result?));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args = Cli::from_args(&["peerlink"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(args) => {
                assert_eq!(args.bind, "0.0.0.0:7100");
                assert_eq!(args.max_streams, None);
                assert!(!args.deny_direct);
                assert_eq!(args.timeout_ms, 2000);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_options() {
        let args = Cli::from_args(
            &["peerlink"],
            &["serve", "-b", "127.0.0.1:9000", "--max-streams", "4", "--deny-direct"],
        )
        .unwrap();
        match args.command {
            Commands::Serve(args) => {
                let options = server_options(&args);
                assert_eq!(args.bind, "127.0.0.1:9000");
                assert_eq!(options.connection.max_stream_count, 4);
                assert!(!options.connection.allow_direct_requests);
                assert!(options.setup.is_some());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call_with_args() {
        let args = Cli::from_args(
            &["peerlink"],
            &["call", "127.0.0.1:7100", "echo", "echo", "-a", "one", "--arg", "two"],
        )
        .unwrap();
        match args.command {
            Commands::Call(args) => {
                assert_eq!(args.address, "127.0.0.1:7100");
                assert_eq!(args.variable, "echo");
                assert_eq!(args.method, "echo");
                assert_eq!(args.args, vec!["one".to_string(), "two".to_string()]);
                assert_eq!(args.type_name, ECHO_TYPE);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_ping_requires_address() {
        assert!(Cli::from_args(&["peerlink"], &["ping"]).is_err());
    }
}
