//! kmsbox: a minimal Wayland compositor on DRM/KMS

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use kmsbox::config::{CompositorConfig, OutputSize};

#[derive(Parser, Debug)]
#[command(name = "kmsbox")]
#[command(about = "A minimal Wayland compositor presenting directly through DRM/KMS")]
#[command(version)]
struct Cli {
    /// Output size, e.g. 1280x720 (default: the connector's first mode)
    #[arg(short = 's', long, value_name = "WxH", value_parser = parse_size)]
    size: Option<OutputSize>,

    /// Wayland socket name (default: first free wayland-N)
    #[arg(short = 'S', long, value_name = "NAME")]
    socket: Option<String>,

    /// Configure every toplevel fullscreen
    #[arg(short, long)]
    fullscreen: bool,

    /// Wait for each page flip before continuing
    #[arg(short, long)]
    vsync: bool,

    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_size(s: &str) -> Result<OutputSize, String> {
    s.parse()
}

impl Cli {
    /// CLI flags are the last configuration layer
    fn apply(&self, config: &mut CompositorConfig) {
        if let Some(size) = self.size {
            config.output.width = size.width;
            config.output.height = size.height;
        }
        if let Some(ref socket) = self.socket {
            config.wayland.socket = Some(socket.clone());
        }
        if self.fullscreen {
            config.output.fullscreen = true;
        }
        if self.vsync {
            config.output.vsync = true;
        }
        if self.debug {
            config.debug = true;
        }
    }
}

fn load_config(cli: &Cli) -> Result<CompositorConfig> {
    let mut config = CompositorConfig::from_env(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = load_config(&cli);
    let debug = cli.debug || config.as_ref().map(|c| c.debug).unwrap_or(false);
    let filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("🚀 Starting kmsbox {}", kmsbox::VERSION);
    match kmsbox::scheduler::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flags_parse() {
        let cli = Cli::try_parse_from(["kmsbox", "-s", "800x600", "-S", "wl-test", "-f", "-v"])
            .unwrap();
        assert_eq!(
            cli.size,
            Some(OutputSize {
                width: 800,
                height: 600
            })
        );
        assert_eq!(cli.socket.as_deref(), Some("wl-test"));
        assert!(cli.fullscreen);
        assert!(cli.vsync);
        assert!(!cli.debug);
    }

    #[test]
    fn malformed_size_is_rejected() {
        assert!(Cli::try_parse_from(["kmsbox", "-s", "800"]).is_err());
        assert!(Cli::try_parse_from(["kmsbox", "-s", "0x600"]).is_err());
        assert!(Cli::try_parse_from(["kmsbox", "-s", "axb"]).is_err());
    }

    #[test]
    fn help_is_a_display_request() {
        let err = Cli::try_parse_from(["kmsbox", "-h"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from(["kmsbox", "--size", "1024x768", "--fullscreen"]).unwrap();
        let mut config = CompositorConfig::default();
        cli.apply(&mut config);
        assert_eq!((config.output.width, config.output.height), (1024, 768));
        assert!(config.output.fullscreen);
        assert!(!config.output.vsync);
        assert!(config.validate().is_ok());
    }
}
