// Peershare: rendezvous server or file-sharing client, chosen on the command line.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use peershare_node::cli::Cli;
use peershare_node::session::{Session, SessionOptions};
use peershare_node::{config, console, host};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    cli.apply(&mut cfg);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let advertise_ip = match cfg.advertise_ip {
        Some(ip) => ip,
        None => host::probe_advertised_ip().unwrap_or_else(|e| {
            warn!(error = %e, "cannot determine local address, using loopback");
            Ipv4Addr::LOCALHOST
        }),
    };
    let options = SessionOptions {
        role: cli.mode.into(),
        bind: SocketAddrV4::new(cfg.bind_ip, cfg.listen_port),
        advertise_ip,
        data_dir: cfg.data_dir.clone(),
        poll_interval: Duration::from_millis(cfg.poll_interval_ms),
        connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
    };
    let session = Session::bind(options)
        .with_context(|| format!("cannot listen on {}:{}", cfg.bind_ip, cfg.listen_port))?;
    info!(data_dir = %cfg.data_dir.display(), "started");

    let input = console::spawn(session.waker()).context("cannot start console")?;
    console::run(session, input)?;
    Ok(())
}
