//! deskpilot-worker - the out-of-process model server.
//!
//! Runs separately from the agent so a wedged or crashing model never
//! takes the pipeline down. The supervisor in the main process spawns
//! and restarts this binary as needed.
//!
//! Usage:
//!   deskpilot-worker [--port 6000] [--model qwen2.5:7b]
//!                    [--endpoint http://localhost:11434]
//!                    [--auth-key deskpilot]

use anyhow::{Context, Result};
use std::net::TcpListener;

use deskpilot::ipc::{DEFAULT_AUTH_KEY, DEFAULT_PORT};
use deskpilot::worker::{OllamaModel, WorkerServer};

struct Args {
    port: u16,
    model: String,
    endpoint: String,
    auth_key: Vec<u8>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        port: DEFAULT_PORT,
        model: "qwen2.5:7b".to_string(),
        endpoint: "http://localhost:11434".to_string(),
        auth_key: DEFAULT_AUTH_KEY.to_vec(),
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .with_context(|| format!("missing value for {}", flag))
        };
        match flag.as_str() {
            "--port" => args.port = value()?.parse().context("invalid port")?,
            "--model" => args.model = value()?,
            "--endpoint" => args.endpoint = value()?,
            "--auth-key" => args.auth_key = value()?.into_bytes(),
            other => anyhow::bail!("unknown flag: {}", other),
        }
    }

    Ok(args)
}

fn main() -> Result<()> {
    let args = parse_args()?;

    eprintln!("==================================================");
    eprintln!("deskpilot-worker starting");
    eprintln!("  port:     {}", args.port);
    eprintln!("  model:    {}", args.model);
    eprintln!("  endpoint: {}", args.endpoint);
    eprintln!("==================================================");

    let model = OllamaModel::new(&args.endpoint, &args.model)
        .context("model backend setup failed")?;
    let server = WorkerServer::new(model, &args.auth_key);

    let listener = TcpListener::bind(("127.0.0.1", args.port))
        .with_context(|| format!("cannot bind 127.0.0.1:{}", args.port))?;

    server.serve(listener).context("worker server exited")?;
    Ok(())
}
