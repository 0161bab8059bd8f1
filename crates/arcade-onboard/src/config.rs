use std::{path::PathBuf, time::Duration};

const DEFAULT_BASE_DIR: &str = "/tmp/devcade";
const DEFAULT_MAX_DOWNLOADS: usize = 3;
const DEFAULT_ACQUIRE_ATTEMPTS: u32 = 10;
const DEFAULT_ACQUIRE_DELAY_MS: u64 = 1000;
const DEFAULT_CATALOG_RETRY_DELAY_MS: u64 = 10_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PING_INTERVAL_MS: u64 = 5000;
const DEFAULT_KILL_GRACE_MS: u64 = 3000;
const DEFAULT_SANDBOX_TOOL: &str = "podman";
const DEFAULT_SANDBOX_BASE_IMAGE: &str = "debian:bookworm-slim";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEndpoint {
    /// One duplex Unix domain socket.
    Socket(PathBuf),
    /// Command pipe (we write) and response pipe (we read).
    Pipes { command: PathBuf, response: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Direct,
    Sandbox,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// `podman` or `docker`; both accept the same build/run/kill verbs.
    pub tool: String,
    pub base_image: String,
}

#[derive(Debug, Clone)]
pub struct OnboardConfig {
    pub base_dir: PathBuf,
    pub channel: ChannelEndpoint,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub max_downloads: usize,
    pub acquire_attempts: u32,
    pub acquire_delay: Duration,
    pub catalog_retry_delay: Duration,
    pub call_timeout: Duration,
    pub ping_interval: Duration,
    pub kill_grace: Duration,
    pub launch_mode: LaunchMode,
    pub sandbox: SandboxConfig,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_launch_mode(raw: Option<&str>) -> LaunchMode {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("sandbox") | Some("container") | Some("podman") | Some("docker") => LaunchMode::Sandbox,
        _ => LaunchMode::Direct,
    }
}

impl OnboardConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Out-of-range numbers are clamped,
    /// unparsable ones fall back to the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));
        let get_u64 = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok());

        let base_dir = get("ARCADE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));

        let channel = match (get("ARCADE_COMMAND_PIPE"), get("ARCADE_RESPONSE_PIPE")) {
            (Some(command), Some(response)) => ChannelEndpoint::Pipes {
                command: PathBuf::from(command),
                response: PathBuf::from(response),
            },
            _ => ChannelEndpoint::Socket(
                get("ARCADE_CHANNEL_SOCKET")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| base_dir.join("onboard.sock")),
            ),
        };

        let api_url = get("ARCADE_API_URL").map(|v| v.trim_end_matches('/').to_string());

        Self {
            channel,
            api_url,
            api_token: get("ARCADE_API_TOKEN"),
            max_downloads: get_u64("ARCADE_MAX_DOWNLOADS")
                .map(|v| v.clamp(1, 64) as usize)
                .unwrap_or(DEFAULT_MAX_DOWNLOADS),
            acquire_attempts: get_u64("ARCADE_ACQUIRE_ATTEMPTS")
                .map(|v| v.clamp(1, 1000) as u32)
                .unwrap_or(DEFAULT_ACQUIRE_ATTEMPTS),
            acquire_delay: Duration::from_millis(
                get_u64("ARCADE_ACQUIRE_DELAY_MS")
                    .map(|v| v.clamp(10, 60_000))
                    .unwrap_or(DEFAULT_ACQUIRE_DELAY_MS),
            ),
            catalog_retry_delay: Duration::from_millis(
                get_u64("ARCADE_CATALOG_RETRY_DELAY_MS")
                    .map(|v| v.clamp(0, 10 * 60_000))
                    .unwrap_or(DEFAULT_CATALOG_RETRY_DELAY_MS),
            ),
            call_timeout: Duration::from_millis(
                get_u64("ARCADE_CALL_TIMEOUT_MS")
                    .map(|v| v.clamp(100, 10 * 60_000))
                    .unwrap_or(DEFAULT_CALL_TIMEOUT_MS),
            ),
            ping_interval: Duration::from_millis(
                get_u64("ARCADE_PING_INTERVAL_MS")
                    .map(|v| v.clamp(250, 10 * 60_000))
                    .unwrap_or(DEFAULT_PING_INTERVAL_MS),
            ),
            kill_grace: Duration::from_millis(
                get_u64("ARCADE_KILL_GRACE_MS")
                    .map(|v| v.clamp(0, 60_000))
                    .unwrap_or(DEFAULT_KILL_GRACE_MS),
            ),
            launch_mode: parse_launch_mode(get("ARCADE_LAUNCH_MODE").as_deref()),
            sandbox: SandboxConfig {
                tool: get("ARCADE_SANDBOX_TOOL").unwrap_or_else(|| DEFAULT_SANDBOX_TOOL.to_string()),
                base_image: get("ARCADE_SANDBOX_BASE_IMAGE")
                    .unwrap_or_else(|| DEFAULT_SANDBOX_BASE_IMAGE.to_string()),
            },
            base_dir,
        }
    }
}
