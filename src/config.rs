use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::state::Credentials;

pub const AUTH_KEY_ENV: &str = "SESSION_RELAY_AUTH_KEY";

#[derive(Debug, Parser, Clone)]
#[command(name = "session-relay")]
#[command(about = "Keeps remote terminal sessions under control across an unreliable relay")]
pub struct Cli {
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long, default_value_t = false, global = true)]
    pub json_output: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Connect to a host through a relay and forward stdin commands.
    Connect(ConnectArgs),
    /// Run the session host and accept connections directly.
    Serve(ServeArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ConnectArgs {
    #[arg(long)]
    pub relay_url: String,

    #[arg(long)]
    pub session_group: String,

    #[arg(long, env = AUTH_KEY_ENV, hide_env_values = true)]
    pub auth_key: String,

    #[arg(long)]
    pub device_id: Option<String>,

    #[arg(long, value_enum, default_value_t = Profile::Standard)]
    pub profile: Profile,

    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
}

impl ConnectArgs {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.relay_url.clone(),
            self.session_group.clone(),
            self.auth_key.clone(),
            self.device_id.clone().unwrap_or_else(default_device_id),
        )
    }
}

#[derive(Debug, Args, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:7788")]
    pub bind: SocketAddr,

    #[arg(long)]
    pub session_group: String,

    #[arg(long, env = AUTH_KEY_ENV, hide_env_values = true)]
    pub auth_key: String,

    /// Shell command line for new sessions. Defaults to `$SHELL`.
    #[arg(long)]
    pub shell: Option<String>,

    #[arg(long)]
    pub workspaces_root: Option<PathBuf>,

    #[arg(long, default_value_t = 64)]
    pub batch_interval_ms: u64,

    #[arg(long, default_value_t = 4096)]
    pub max_batch_size: usize,
}

impl ServeArgs {
    pub fn host_config(&self) -> Result<HostConfig> {
        let shell_line = self.shell.clone().unwrap_or_else(default_shell);
        let (program, args) = parse_shell(&shell_line)?;
        let workspaces_root = match &self.workspaces_root {
            Some(root) => root.clone(),
            None => dirs::home_dir().context("cannot determine home directory; pass --workspaces-root")?,
        };
        if !workspaces_root.is_dir() {
            bail!("workspaces root {} is not a directory", workspaces_root.display());
        }

        Ok(HostConfig {
            session_group_id: self.session_group.clone(),
            auth_key: self.auth_key.clone(),
            host_name: host_name(),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            workspaces_root: workspaces_root.clone(),
            session: SessionConfig {
                program,
                args,
                default_working_dir: workspaces_root,
                batcher: BatcherConfig {
                    max_batch_size: self.max_batch_size.max(1),
                    interval: Duration::from_millis(self.batch_interval_ms),
                    ..BatcherConfig::default()
                },
            },
        })
    }
}

/// Liveness timing presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// Aggressive probing for cellular links and backgrounded apps.
    Mobile,
    Standard,
    /// Relaxed probing for wired, always-on clients.
    Desktop,
}

impl Profile {
    pub fn client_config(self) -> ClientConfig {
        let base = ClientConfig::default();
        match self {
            Self::Mobile => ClientConfig {
                ping_interval: Duration::from_secs(5),
                pong_timeout: Duration::from_secs(3),
                heartbeat_interval: Duration::from_secs(5),
                ..base
            },
            Self::Standard => base,
            Self::Desktop => ClientConfig {
                ping_interval: Duration::from_secs(20),
                pong_timeout: Duration::from_secs(10),
                max_missed_pongs: 2,
                heartbeat_interval: Duration::from_secs(15),
                ..base
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Per-step bound on the connect handshake.
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Missed pongs tolerated before the socket is declared dead.
    pub max_missed_pongs: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Consecutive missed heartbeat acks that force a full reconnect.
    pub stale_after_missed_heartbeats: u32,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub path_change_settle: Duration,
    /// Messages held while the handshake is in flight.
    pub pre_auth_buffer: usize,
    pub sync_on_authenticated: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(5),
            max_missed_pongs: 1,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            stale_after_missed_heartbeats: 2,
            reconnect_min_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            path_change_settle: Duration::from_millis(500),
            pre_auth_buffer: 64,
            sync_on_authenticated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub queue_capacity: usize,
    pub queue_ttl: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Pause between commands while draining the queue.
    pub drain_spacing: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            queue_ttl: Duration::from_secs(60),
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(4),
            drain_spacing: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    /// Flush interval under sustained output.
    pub interval: Duration,
    /// Flush interval for sparse, interactive output.
    pub fast_interval: Duration,
    /// Bytes per second above which output counts as sustained.
    pub rate_threshold: f64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 4096,
            interval: Duration::from_millis(64),
            fast_interval: Duration::from_millis(8),
            rate_threshold: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Base for relative working directories and the default for new sessions.
    pub default_working_dir: PathBuf,
    pub batcher: BatcherConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    pub session_group_id: String,
    pub auth_key: String,
    pub host_name: String,
    pub host_version: String,
    pub workspaces_root: PathBuf,
    pub session: SessionConfig,
}

pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn default_device_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host_name(), &suffix[..8])
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Split a shell command line into program and arguments.
pub fn parse_shell(line: &str) -> Result<(String, Vec<String>)> {
    let mut words = shlex::split(line)
        .with_context(|| format!("unbalanced quoting in shell command: {line}"))?
        .into_iter();
    let program = words
        .next()
        .with_context(|| "shell command is empty".to_string())?;
    Ok((program, words.collect()))
}
