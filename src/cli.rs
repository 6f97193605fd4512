//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crawler_core::{FileConfig, RobotsMode};

/// Politely load web pages.
///
/// Each URL is loaded with per-domain throttling, retries and robots.txt checks, and its
/// status, final URL, redirect trail and body size are printed.
#[derive(Parser, Debug)]
#[command(name = "crawler")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to load
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// TOML configuration file (flags override its values)
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Identify as this bot (product token) and obey robots.txt
    #[arg(short, long, conflicts_with = "user_agent")]
    pub bot: Option<String>,

    /// Send this literal User-Agent header (robots.txt is not consulted)
    #[arg(short = 'u', long)]
    pub user_agent: Option<String>,

    /// Retries for error responses (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub retries: Option<u32>,

    /// Seconds to wait before each retry, comma separated
    #[arg(long, value_delimiter = ',')]
    pub retry_wait: Option<Vec<u64>>,

    /// Longest Retry-After (seconds) to honor before giving up
    #[arg(long)]
    pub max_wait: Option<u64>,

    /// Lower end of the throttle range
    #[arg(long)]
    pub throttle_from: Option<f64>,

    /// Upper end of the throttle range
    #[arg(long)]
    pub throttle_to: Option<f64>,

    /// Read the throttle range as seconds instead of multiples of the last round trip
    #[arg(long)]
    pub absolute_throttle: bool,

    /// What to do when robots.txt disallows a URL
    #[arg(long, value_enum)]
    pub robots: Option<RobotsArg>,

    /// Cache responses in this directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Gzip cache entries
    #[arg(long, requires = "cache_dir")]
    pub compress: bool,

    /// Ignore cache entries older than this many seconds
    #[arg(long, requires = "cache_dir")]
    pub cache_ttl: Option<u64>,

    /// Maximum redirects to follow per URL (0-100)
    #[arg(long, value_parser = clap::value_parser!(u64).range(0..=100))]
    pub max_redirects: Option<u64>,
}

/// Robots.txt handling choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RobotsArg {
    Off,
    Skip,
    Fail,
}

impl From<RobotsArg> for RobotsMode {
    fn from(value: RobotsArg) -> Self {
        match value {
            RobotsArg::Off => Self::Off,
            RobotsArg::Skip => Self::Skip,
            RobotsArg::Fail => Self::Fail,
        }
    }
}

impl Args {
    /// Configuration values given on the command line.
    pub fn overrides(&self) -> FileConfig {
        FileConfig {
            user_agent: self.user_agent.clone(),
            bot_name: self.bot.clone(),
            throttle_from: self.throttle_from,
            throttle_to: self.throttle_to,
            throttle_multiplier: self.absolute_throttle.then_some(false),
            retries: self.retries,
            retry_wait_secs: self.retry_wait.clone(),
            retry_max_wait_secs: self.max_wait,
            robots: self.robots.map(RobotsMode::from),
            cache_dir: self.cache_dir.clone(),
            cache_compress: self.compress.then_some(true),
            cache_ttl_secs: self.cache_ttl,
            max_redirects: self
                .max_redirects
                .and_then(|value| usize::try_from(value).ok()),
            ..FileConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_minimal_args_parse_successfully() {
        let args = Args::try_parse_from(["crawler", "https://example.com/"]).unwrap();
        assert_eq!(args.urls, ["https://example.com/"]);
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.overrides(), FileConfig::default());
    }

    #[test]
    fn test_cli_requires_a_url() {
        let err = Args::try_parse_from(["crawler"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["crawler", "-vv", "https://a.com/"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["crawler", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let err = Args::try_parse_from(["crawler", "--invalid-flag", "https://a.com/"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    // ==================== Identity Tests ====================

    #[test]
    fn test_cli_bot_and_user_agent_conflict() {
        let err = Args::try_parse_from(["crawler", "-b", "MyBot", "-u", "X", "https://a.com/"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_bot_sets_bot_name() {
        let args = Args::try_parse_from(["crawler", "--bot", "MyBot", "https://a.com/"]).unwrap();
        assert_eq!(args.overrides().bot_name.as_deref(), Some("MyBot"));
    }

    // ==================== Retry Tests ====================

    #[test]
    fn test_cli_retry_options() {
        let args = Args::try_parse_from([
            "crawler",
            "-r",
            "3",
            "--retry-wait",
            "1,5,30",
            "--max-wait",
            "90",
            "https://a.com/",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.retries, Some(3));
        assert_eq!(overrides.retry_wait_secs, Some(vec![1, 5, 30]));
        assert_eq!(overrides.retry_max_wait_secs, Some(90));
    }

    #[test]
    fn test_cli_retries_over_max_rejected() {
        let err = Args::try_parse_from(["crawler", "-r", "11", "https://a.com/"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    // ==================== Robots / Cache Tests ====================

    #[test]
    fn test_cli_robots_mode() {
        let args = Args::try_parse_from(["crawler", "--robots", "fail", "https://a.com/"]).unwrap();
        assert_eq!(args.overrides().robots, Some(RobotsMode::Fail));

        let err = Args::try_parse_from(["crawler", "--robots", "maybe", "https://a.com/"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn test_cli_compress_requires_cache_dir() {
        let err = Args::try_parse_from(["crawler", "--compress", "https://a.com/"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let args = Args::try_parse_from([
            "crawler",
            "--cache-dir",
            "/tmp/c",
            "--compress",
            "https://a.com/",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.cache_compress, Some(true));
        assert_eq!(overrides.cache_dir, Some(PathBuf::from("/tmp/c")));
    }

    #[test]
    fn test_cli_absolute_throttle() {
        let args = Args::try_parse_from([
            "crawler",
            "--absolute-throttle",
            "--throttle-from",
            "0.5",
            "--throttle-to",
            "1",
            "https://a.com/",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.throttle_multiplier, Some(false));
        assert_eq!(overrides.throttle_from, Some(0.5));
        assert_eq!(overrides.throttle_to, Some(1.0));
    }
}
