use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Tollgate metered API gateway
#[derive(Debug, Parser)]
#[command(name = "tollgate", about = "Metered gateway for chat completion and audio providers")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tollgate.toml", env = "TOLLGATE_CONFIG")]
    pub config: PathBuf,

    /// Override the listen address
    #[arg(long, env = "TOLLGATE_LISTEN")]
    pub listen: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_override_parses() {
        let args = Args::try_parse_from(["tollgate", "--config", "/etc/tollgate.toml", "--listen", "127.0.0.1:9000"])
            .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/tollgate.toml"));
        assert_eq!(args.listen, Some("127.0.0.1:9000".parse().unwrap()));
    }
}
