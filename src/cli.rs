use std::path::PathBuf;

use clap::Parser;
use speedgauge::settings::{MAX_DURATION_SECS, MIN_DURATION_SECS};
use speedgauge::Settings;

#[derive(Debug, Parser)]
#[command(
    name = "speedgauge",
    version,
    about = "Measure latency, download and upload speed over HTTP"
)]
pub struct Cli {
    /// Settings file (TOML)
    #[arg(long, short = 'c', env = "SPEEDGAUGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Server id to measure against
    #[arg(long, short = 's')]
    pub server: Option<String>,

    /// Save a download URL as a server and measure against it; implies no upload endpoint
    #[arg(long, value_name = "URL")]
    pub custom_server: Option<String>,

    /// Display name for --custom-server
    #[arg(long, value_name = "NAME", requires = "custom_server")]
    pub server_name: Option<String>,

    /// Forget a saved custom server and exit
    #[arg(long, value_name = "ID", conflicts_with = "custom_server")]
    pub remove_server: Option<String>,

    /// Run a single measurement and print the result
    #[arg(long)]
    pub headless: bool,

    /// Print the N most recent measurements and exit
    #[arg(long, value_name = "N")]
    pub history: Option<usize>,

    /// Print averages over the last DAYS days and exit
    #[arg(long, value_name = "DAYS")]
    pub stats: Option<u32>,

    /// Delete saved measurements and exit
    #[arg(long)]
    pub clear_history: bool,

    /// List known servers and exit
    #[arg(long)]
    pub list_servers: bool,

    /// Download phase length in seconds
    #[arg(long, value_name = "SECS")]
    pub download_secs: Option<u64>,

    /// Upload phase length in seconds
    #[arg(long, value_name = "SECS")]
    pub upload_secs: Option<u64>,

    /// Seed for target choice and simulated uploads
    #[arg(long, env = "SPEEDGAUGE_SEED")]
    pub seed: Option<u64>,

    /// Skip the public address lookup
    #[arg(long)]
    pub no_lookup: bool,

    /// Debug logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl Cli {
    /// True when no terminal UI should be started.
    pub fn is_batch(&self) -> bool {
        self.headless
            || self.history.is_some()
            || self.stats.is_some()
            || self.clear_history
            || self.list_servers
            || self.remove_server.is_some()
    }

    /// Layers command-line overrides on top of file settings.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(server) = &self.server {
            settings.server = Some(server.clone());
        }
        if let Some(secs) = self.download_secs {
            settings.download_duration_secs = secs.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS);
        }
        if let Some(secs) = self.upload_secs {
            settings.upload_duration_secs = secs.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS);
        }
        if self.seed.is_some() {
            settings.seed = self.seed;
        }
        if self.no_lookup {
            settings.client_lookup = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let cli = Cli::parse_from([
            "speedgauge",
            "--server",
            "ovh",
            "--download-secs",
            "60",
            "--seed",
            "7",
            "--no-lookup",
        ]);
        let mut settings = Settings::default();
        cli.apply(&mut settings);

        assert_eq!(settings.server.as_deref(), Some("ovh"));
        assert_eq!(settings.download_duration_secs, MAX_DURATION_SECS);
        assert_eq!(settings.upload_duration_secs, 8);
        assert_eq!(settings.seed, Some(7));
        assert!(!settings.client_lookup);
        assert!(!cli.is_batch());
    }

    #[test]
    fn report_flags_skip_the_ui() {
        assert!(Cli::parse_from(["speedgauge", "--history", "5"]).is_batch());
        assert!(Cli::parse_from(["speedgauge", "--headless"]).is_batch());
        assert!(!Cli::parse_from(["speedgauge"]).is_batch());
    }

    #[test]
    fn remove_server_is_a_report_command() {
        let cli = Cli::parse_from(["speedgauge", "--remove-server", "custom_1"]);
        assert_eq!(cli.remove_server.as_deref(), Some("custom_1"));
        assert!(cli.is_batch());

        assert!(Cli::try_parse_from([
            "speedgauge",
            "--remove-server",
            "custom_1",
            "--custom-server",
            "https://mirror.test/blob",
        ])
        .is_err());
    }

    #[test]
    fn server_name_needs_a_custom_server() {
        let cli = Cli::parse_from([
            "speedgauge",
            "--custom-server",
            "https://mirror.test/blob",
            "--server-name",
            "Mirror",
        ]);
        assert_eq!(cli.server_name.as_deref(), Some("Mirror"));
        assert!(Cli::try_parse_from(["speedgauge", "--server-name", "Mirror"]).is_err());
    }
}
