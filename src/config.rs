use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::gaussians::DEFAULT_MAX_SPLATS;
use crate::ply::PlyParsePolicy;
use crate::viewer::LoadOptions;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "menu-splat", long_about = "Viewer for 3D menu-item assets (PLY, PLY.GZ, ZIP).")]
pub struct ViewerConfig {
    /// Model to open at startup: an http(s) URL or a local path
    pub model: Option<String>,
    #[arg(long, default_value_t = 1280)]
    pub width: usize,
    #[arg(long, default_value_t = 720)]
    pub height: usize,
    /// Upper bound on splats kept per asset, 0 keeps all
    #[arg(long, default_value_t = DEFAULT_MAX_SPLATS)]
    pub max_splats: usize,
    #[arg(long, default_value_t = 30)]
    pub fetch_timeout_secs: u64,
    /// Fail on the first malformed vertex row instead of skipping it
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub strict_ply: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub no_auto_rotate: bool,
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            model: None,
            width: 1280,
            height: 720,
            max_splats: DEFAULT_MAX_SPLATS,
            fetch_timeout_secs: 30,
            strict_ply: false,
            no_auto_rotate: false,
            log_level: LogLevel::Info,
        }
    }
}

impl ViewerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            max_splats: self.max_splats,
            policy: if self.strict_ply {
                PlyParsePolicy::Strict
            } else {
                PlyParsePolicy::Lenient
            },
            fetch_timeout: self.fetch_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_command_line() {
        let parsed = ViewerConfig::parse_from(["menu-splat"]);
        let default = ViewerConfig::default();
        assert_eq!(parsed.width, default.width);
        assert_eq!(parsed.height, default.height);
        assert_eq!(parsed.max_splats, default.max_splats);
        assert_eq!(parsed.fetch_timeout(), Duration::from_secs(30));
        assert_eq!(parsed.log_level, LogLevel::Info);
        assert_eq!(parsed.load_options().policy, PlyParsePolicy::Lenient);
    }

    #[test]
    fn flags_are_parsed() {
        let parsed = ViewerConfig::parse_from([
            "menu-splat",
            "https://example.com/a.ply",
            "--strict-ply",
            "--no-auto-rotate",
            "--max-splats",
            "10",
            "-l",
            "debug",
        ]);
        assert_eq!(parsed.model.as_deref(), Some("https://example.com/a.ply"));
        assert!(parsed.no_auto_rotate);
        assert_eq!(parsed.load_options().policy, PlyParsePolicy::Strict);
        assert_eq!(parsed.load_options().max_splats, 10);
        assert_eq!(LevelFilter::from(parsed.log_level), LevelFilter::DEBUG);
    }
}
