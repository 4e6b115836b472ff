//! Guest main loop: handshake, then answer host requests one at a time.

use std::net::Ipv4Addr;
use std::process::ExitCode;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use super::{CapabilitySet, GuestPlugin};
use crate::error::PluginError;
use crate::protocol::{ProtocolDescriptor, SAMSKIPNAD_PROTOCOL};
use crate::value::Value;
use crate::wire::{method, read_frame, write_frame, GuestIdentity, InitializeParams, Request, Response};

/// Log to stderr, which the host relays into its own log.
///
/// Stdout is reserved for the handshake line.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .try_init();
}

/// Entry point for plugin binaries built on the bundled protocol.
pub async fn run<P: GuestPlugin>(plugin: P) -> ExitCode {
    init_logging();
    let name = plugin.name().to_string();
    match serve(plugin, SAMSKIPNAD_PROTOCOL).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(plugin = %name, "plugin stopped: {e}");
            eprintln!("{name}: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Serve `plugin` to the host that launched this process.
///
/// Refuses to run without the host's magic cookie. Returns once the host
/// asks for shutdown or closes the connection.
pub async fn serve<P: GuestPlugin>(
    mut plugin: P,
    protocol: ProtocolDescriptor,
) -> Result<(), PluginError> {
    if !protocol.launched_by_host() {
        return Err(PluginError::Handshake(format!(
            "this binary is a plugin and must be launched by the plugin host ({} is not set)",
            protocol.cookie_key()
        )));
    }

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let handshake = protocol.handshake_for(listener.local_addr()?);
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{handshake}\n").as_bytes()).await?;
    stdout.flush().await?;
    tracing::debug!(plugin = %plugin.name(), %handshake, "handshake sent, waiting for host");

    let (stream, peer) = listener.accept().await?;
    drop(listener);
    if !peer.ip().is_loopback() {
        return Err(PluginError::Handshake(format!(
            "refusing non-loopback host connection from {peer}"
        )));
    }
    stream.set_nodelay(true)?;
    serve_connection(&mut plugin, stream).await
}

async fn serve_connection<P, S>(plugin: &mut P, mut stream: S) -> Result<(), PluginError>
where
    P: GuestPlugin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::info!(plugin = %plugin.name(), "host closed the connection");
                return plugin.shutdown().await;
            }
            Err(e) => {
                let _ = plugin.shutdown().await;
                return Err(e.into());
            }
        };

        let stop = request.method == method::SHUTDOWN;
        let response = dispatch(plugin, request).await;
        write_frame(&mut stream, &response).await?;
        if stop {
            return Ok(());
        }
    }
}

async fn dispatch<P: GuestPlugin>(plugin: &mut P, request: Request) -> Response {
    let result = match request.method.as_str() {
        method::INITIALIZE => initialize(plugin, request.params).await,
        method::EXECUTE => match request.params.into_map() {
            Some(params) => plugin.execute(params).await.map(Value::Map),
            None => Err(PluginError::Execution("execute params must be a map".into())),
        },
        method::SHUTDOWN => plugin.shutdown().await.map(|()| Value::empty_map()),
        other => Err(PluginError::Execution(format!("unknown method: {other}"))),
    };

    match result {
        Ok(value) => Response::ok(value),
        Err(e) => Response::err(e.guest_message()),
    }
}

async fn initialize<P: GuestPlugin>(plugin: &mut P, params: Value) -> Result<Value, PluginError> {
    let params: InitializeParams = params.deserialize_into()?;
    let capabilities = CapabilitySet::connect(&params.capabilities).await?;
    plugin.initialize(capabilities).await?;

    let identity = GuestIdentity {
        name: plugin.name().to_string(),
        version: plugin.version().to_string(),
    };
    Ok(Value::from_serialize(&identity)?)
}
