//! Command-line arguments.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::Config;
use crate::session::Role;

#[derive(Parser, Debug)]
#[command(
    name = "peershare",
    version,
    about = "Peer-to-peer file sharing: rendezvous server or file-sharing client"
)]
pub struct Cli {
    /// Run mode: `s` for the rendezvous server, `c` for a client.
    #[arg(value_enum, ignore_case = true)]
    pub mode: Mode,

    /// Port to listen on (1025-65535). Defaults to the configured listen_port.
    #[arg(value_parser = clap::value_parser!(u16).range(1025..))]
    pub port: Option<u16>,

    /// Config file to read instead of the standard locations.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory uploads land in and downloads are served from.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Address to advertise instead of probing for one.
    #[arg(long)]
    pub advertise_ip: Option<Ipv4Addr>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    #[value(name = "s", alias = "server")]
    Server,
    #[value(name = "c", alias = "client")]
    Client,
}

impl From<Mode> for Role {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Server => Role::Server,
            Mode::Client => Role::Client,
        }
    }
}

impl Cli {
    /// Command-line values win over file and environment.
    pub fn apply(&self, c: &mut Config) {
        if let Some(p) = self.port {
            c.listen_port = p;
        }
        if let Some(dir) = &self.data_dir {
            c.data_dir = dir.clone();
        }
        if let Some(ip) = self.advertise_ip {
            c.advertise_ip = Some(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_accepts_short_long_and_any_case() {
        for (arg, mode) in [
            ("s", Mode::Server),
            ("C", Mode::Client),
            ("server", Mode::Server),
            ("CLIENT", Mode::Client),
        ] {
            let cli = Cli::try_parse_from(["peershare", arg, "5000"]).unwrap();
            assert_eq!(cli.mode, mode);
            assert_eq!(cli.port, Some(5000));
        }
    }

    #[test]
    fn rejects_bad_mode_and_reserved_port() {
        assert!(Cli::try_parse_from(["peershare", "x", "5000"]).is_err());
        assert!(Cli::try_parse_from(["peershare", "s", "80"]).is_err());
        assert!(Cli::try_parse_from(["peershare", "s", "70000"]).is_err());
        assert!(Cli::try_parse_from(["peershare"]).is_err());
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "peershare",
            "c",
            "6000",
            "--data-dir",
            "/tmp/share",
            "--advertise-ip",
            "192.168.1.9",
        ])
        .unwrap();
        let mut c = Config::default();
        cli.apply(&mut c);
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.data_dir, PathBuf::from("/tmp/share"));
        assert_eq!(c.advertise_ip, Some(Ipv4Addr::new(192, 168, 1, 9)));
        assert_eq!(Role::from(cli.mode), Role::Client);
    }
}
