use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Upper bound for `token_ttl_days` (ten years)
pub const MAX_TOKEN_TTL_DAYS: i64 = 3650;

/// Bearer Session - authenticated API client with transparent token refresh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the remote API
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://localhost:3002")]
    pub base_url: String,

    /// Path to the SQLite token store
    #[arg(short = 'd', long, env = "TOKEN_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Upper bound for a token refresh call in seconds
    #[arg(long, env = "REFRESH_TIMEOUT", default_value = "30")]
    pub refresh_timeout: u64,

    /// Lifetime of persisted tokens in days
    #[arg(long, env = "TOKEN_TTL_DAYS", default_value = "30")]
    pub token_ttl_days: i64,

    /// Reason code the API puts in 401 bodies for expired access tokens
    #[arg(long, env = "EXPIRED_REASON_CODE", default_value = "token.expired")]
    pub expired_code: String,

    /// Sign out when a token refresh fails
    #[arg(long, env = "SIGN_OUT_ON_REFRESH_FAILURE", default_value_t = true, action = ArgAction::Set)]
    pub sign_out_on_refresh_failure: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in and persist the session tokens
    Login {
        /// Account email (prompted when missing)
        #[arg(short, long, env = "SESSION_EMAIL")]
        email: Option<String>,

        /// Account password (prompted when missing)
        #[arg(short, long, env = "SESSION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Clear the persisted session
    Logout,

    /// Show the signed-in user
    Whoami,

    /// GET a path through the authenticated client
    Get { path: String },

    /// POST a JSON body to a path through the authenticated client
    Post {
        path: String,
        /// JSON body (defaults to {})
        body: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Remote API
    pub base_url: String,

    // Token storage
    pub token_db_file: PathBuf,
    pub token_ttl_days: i64,

    // Timeouts (seconds)
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub refresh_timeout: u64,

    // Refresh policy
    pub expired_reason_code: String,
    pub sign_out_on_refresh_failure: bool,

    // Navigation targets
    pub entry_path: String,
    pub home_path: String,

    // Logging
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3002".to_string(),
            token_db_file: default_token_db_path(),
            token_ttl_days: 30,
            http_connect_timeout: 10,
            http_request_timeout: 30,
            refresh_timeout: 30,
            expired_reason_code: "token.expired".to_string(),
            sign_out_on_refresh_failure: true,
            entry_path: "/".to_string(),
            home_path: "/dashboard".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration with priority: CLI > ENV (.env included) > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args);
        Ok((config, args.command))
    }

    pub fn from_args(args: &CliArgs) -> Self {
        Config {
            base_url: args.base_url.trim_end_matches('/').to_string(),
            token_db_file: args
                .db_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_token_db_path),
            token_ttl_days: args.token_ttl_days,
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,
            refresh_timeout: args.refresh_timeout,
            expired_reason_code: args.expired_code.clone(),
            sign_out_on_refresh_failure: args.sign_out_on_refresh_failure,
            log_level: args.log_level.clone(),
            ..Config::default()
        }
    }

    /// Config pointed at another API, everything else default
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Config {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Config::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            anyhow::bail!(
                "API_BASE_URL must start with http:// or https://: {}",
                self.base_url
            );
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        if self.refresh_timeout == 0 {
            anyhow::bail!("REFRESH_TIMEOUT must be greater than zero");
        }

        if self.token_ttl_days <= 0 || self.token_ttl_days > MAX_TOKEN_TTL_DAYS {
            anyhow::bail!(
                "TOKEN_TTL_DAYS must be between 1 and {}: {}",
                MAX_TOKEN_TTL_DAYS,
                self.token_ttl_days
            );
        }

        if self.expired_reason_code.is_empty() {
            anyhow::bail!("EXPIRED_REASON_CODE cannot be empty");
        }

        Ok(())
    }

    /// Token lifetime, clamped to `MAX_TOKEN_TTL_DAYS`
    pub fn token_ttl(&self) -> chrono::Duration {
        let days = self.token_ttl_days.clamp(1, MAX_TOKEN_TTL_DAYS);
        chrono::Duration::try_days(days).unwrap_or_else(chrono::Duration::zero)
    }

    pub fn refresh_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.refresh_timeout)
    }
}

/// Default location of the SQLite token store
fn default_token_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bearer-session")
        .join("tokens.sqlite3")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
