use anyhow::{bail, Context, Result};
use env_logger::Env;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use udp_tftp::{Client, ClientConfig, Operation, Server, ServerConfig, TransferRequest};

const USAGE: &str = "usage: udp-tftp server | get <local> <remote> | put <local> <remote>";

/// Control endpoint, for both the server's bind address and the client's target.
fn server_addr_override() -> Result<Option<SocketAddr>> {
    match env::var("TFTP_SERVER_ADDR") {
        Ok(addr) => Ok(Some(addr.parse::<SocketAddr>().with_context(|| format!("Bad TFTP_SERVER_ADDR '{}'", addr))?)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).context("Bad TFTP_SERVER_ADDR"),
    }
}

async fn run_server() -> Result<()> {
    let mut config = ServerConfig::default();
    if let Some(addr) = server_addr_override()? {
        config.bind_addr = addr;
    }
    if let Some(root) = env::var_os("TFTP_ROOT") {
        config.root = PathBuf::from(root);
    }

    let server = Server::bind(config).context("Unable to bind the control socket")?;
    server.run().await;
    Ok(())
}

async fn run_client(request: TransferRequest) -> Result<()> {
    let mut config = ClientConfig::default();
    if let Some(addr) = server_addr_override()? {
        config.server_addr = addr;
    }

    let summary = Client::new(config)
        .run(&request)
        .await
        .with_context(|| format!("{} of '{}' failed", request.operation, request.remote))?;
    println!("{} bytes in {} blocks", summary.bytes, summary.blocks);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let (operation, local, remote) = match args.as_slice() {
        ["server"] => return run_server().await,
        ["get", local, remote] => (Operation::Get, local, remote),
        ["put", local, remote] => (Operation::Put, local, remote),
        _ => bail!(USAGE),
    };

    run_client(TransferRequest {
        operation,
        local: PathBuf::from(local),
        remote: remote.to_string(),
    })
    .await
}
