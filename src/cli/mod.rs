use std::path::PathBuf;

use clap::{Parser, Subcommand};

use deskcast::config::DeskcastConfig;
use deskcast::screen::viewer::GraphicsProtocol;

#[derive(Parser, Debug)]
#[command(name = "deskcast")]
#[command(about = "Stream a desktop's screen and audio to terminal viewers", long_about = None)]
#[command(version)]
pub struct Cli {
    /// TOML config file (missing file = defaults)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish this machine's screen (and microphone) until Ctrl-C
    Host {
        /// Video port; audio uses port + 1
        #[arg(short, long)]
        port: Option<u16>,

        /// Send grayscale frames
        #[arg(long)]
        gray: bool,

        /// Do not capture or publish audio
        #[arg(long)]
        no_audio: bool,

        /// JPEG quality
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=100))]
        quality: Option<u8>,

        /// Downscale frames wider than this many pixels
        #[arg(long)]
        max_width: Option<u32>,
    },

    /// Watch a publisher in this terminal (q quits, r reconnects)
    Join {
        /// Publisher host
        #[arg(long)]
        host: String,

        /// Video port; audio uses port + 1
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not subscribe to audio
        #[arg(long)]
        no_audio: bool,

        /// Graphics protocol: auto, sixel, kitty, iterm2 or halfblocks
        #[arg(short, long)]
        graphics: Option<GraphicsProtocol>,
    },

    /// Print the default configuration as TOML
    GenConfig,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Let command-line flags override whatever the config file said.
    pub fn apply(&self, config: &mut DeskcastConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }

        match &self.command {
            Commands::Host {
                port,
                gray,
                no_audio,
                quality,
                max_width,
            } => {
                if let Some(port) = port {
                    config.network.port = *port;
                }
                if *gray {
                    config.screen.grayscale = true;
                }
                if *no_audio {
                    config.audio.enabled = false;
                }
                if let Some(quality) = quality {
                    config.screen.jpeg_quality = *quality;
                }
                if max_width.is_some() {
                    config.screen.max_width = *max_width;
                }
            }
            Commands::Join {
                host,
                port,
                no_audio,
                graphics,
            } => {
                config.network.host = host.clone();
                if let Some(graphics) = graphics {
                    config.viewer.graphics = *graphics;
                }
                if let Some(port) = port {
                    config.network.port = *port;
                }
                if *no_audio {
                    config.audio.enabled = false;
                }
            }
            Commands::GenConfig => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_flags_override_config() {
        let cli = Cli::try_parse_from([
            "deskcast", "host", "--port", "6000", "--gray", "--no-audio", "--quality", "70",
        ])
        .unwrap();
        let mut config = DeskcastConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.network.port, 6000);
        assert!(config.screen.grayscale);
        assert!(!config.audio.enabled);
        assert_eq!(config.screen.jpeg_quality, 70);
        assert_eq!(config.screen.max_width, None);
    }

    #[test]
    fn join_requires_host() {
        assert!(Cli::try_parse_from(["deskcast", "join"]).is_err());

        let cli = Cli::try_parse_from(["deskcast", "join", "--host", "10.0.0.7", "-g", "kitty"]).unwrap();
        let mut config = DeskcastConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.network.host, "10.0.0.7");
        assert_eq!(config.network.port, 5555);
        assert!(config.audio.enabled);
        assert_eq!(config.viewer.graphics, GraphicsProtocol::Kitty);
        assert!(Cli::try_parse_from(["deskcast", "join", "--host", "h", "-g", "vga"]).is_err());
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from(["deskcast", "gen-config", "--log-level", "debug", "-c", "cast.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("cast.toml")));

        let mut config = DeskcastConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn quality_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["deskcast", "host", "--quality", "0"]).is_err());
        assert!(Cli::try_parse_from(["deskcast", "host", "--quality", "101"]).is_err());
    }
}
