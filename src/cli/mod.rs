pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file (default location if no path is given)
    #[arg(long, global = true, num_args = 0..=1, value_name = "PATH")]
    pub log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Own the frontier and hand work out to connected workers
    Host {
        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,

        /// Password workers must present
        #[arg(long)]
        password: Option<String>,
    },

    /// Crawl work handed out by a host
    Worker {
        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Host address to connect to
        #[arg(long)]
        host: Option<String>,

        /// Password for the host
        #[arg(long)]
        password: Option<String>,
    },

    /// Crawl on this machine only
    Crawl {
        /// URLs to start crawling from (in addition to the profile's seeds)
        urls: Vec<String>,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Crawl newest links first
        #[arg(long)]
        depth_first: bool,

        /// Maximum number of pages to crawl
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

impl Cli {
    /// Process role of the chosen subcommand, used to name its log file
    pub fn role(&self) -> &'static str {
        match self.command {
            Commands::Host { .. } => "host",
            Commands::Worker { .. } => "worker",
            Commands::Crawl { .. } => "crawl",
            Commands::Config { .. } => "config",
        }
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Host { profile, listen, password } => {
            info!("Starting host with profile {}", profile.as_deref().unwrap_or("default"));
            commands::host(profile, listen, password).await
        }
        Commands::Worker { profile, host, password } => {
            info!("Starting worker with profile {}", profile.as_deref().unwrap_or("default"));
            commands::worker(profile, host, password).await
        }
        Commands::Crawl { urls, profile, depth_first, limit } => {
            info!("Starting standalone crawl of {} URLs", urls.len());
            commands::crawl(urls, profile, depth_first, limit).await
        }
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn log_file_flag_takes_an_optional_path() {
        let cli = Cli::try_parse_from(["crawler", "config", "--log-file"]).unwrap();
        assert_eq!(cli.log_file, Some(None));

        let cli = Cli::try_parse_from(["crawler", "--log-file", "/tmp/x.log", "worker"]).unwrap();
        assert_eq!(cli.log_file, Some(Some(PathBuf::from("/tmp/x.log"))));
        assert_eq!(cli.role(), "worker");
    }

    #[test]
    fn crawl_accepts_several_urls() {
        let cli = Cli::try_parse_from([
            "crawler",
            "crawl",
            "https://a.example/",
            "https://b.example/",
            "--depth-first",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Crawl { urls, depth_first, limit, .. } => {
                assert_eq!(urls.len(), 2);
                assert!(depth_first);
                assert_eq!(limit, Some(5));
            }
            _ => panic!("expected crawl"),
        }
    }
}
