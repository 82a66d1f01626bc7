// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Tether

// Sandbox root and shell execution
pub const TETHER_BASE_PATH: &str = "TETHER_BASE_PATH";
pub const TETHER_SHELL: &str = "TETHER_SHELL";
pub const TETHER_SHELL_TIMEOUT_SECS: &str = "TETHER_SHELL_TIMEOUT_SECS";

// Container backend
pub const TETHER_CONTAINER_IMAGE: &str = "TETHER_CONTAINER_IMAGE";
pub const TETHER_CONTAINER_STARTUP_TIMEOUT_SECS: &str = "TETHER_CONTAINER_STARTUP_TIMEOUT_SECS";
pub const TETHER_CONTAINER_WORKDIR: &str = "TETHER_CONTAINER_WORKDIR";
pub const TETHER_PREVIEW_PORT: &str = "TETHER_PREVIEW_PORT";
pub const TETHER_DOCKER_NETWORK: &str = "TETHER_DOCKER_NETWORK";

// Cloud sandbox backend
pub const TETHER_CLOUD_API_URL: &str = "TETHER_CLOUD_API_URL";
pub const TETHER_CLOUD_API_KEY: &str = "TETHER_CLOUD_API_KEY";
pub const TETHER_CLOUD_TEMPLATE: &str = "TETHER_CLOUD_TEMPLATE";
pub const TETHER_CLOUD_SANDBOX_TIMEOUT_SECS: &str = "TETHER_CLOUD_SANDBOX_TIMEOUT_SECS";

// Agent event stream
pub const TETHER_AGENT_API_URL: &str = "TETHER_AGENT_API_URL";
pub const TETHER_HTTP_CONNECT_TIMEOUT_SECS: &str = "TETHER_HTTP_CONNECT_TIMEOUT_SECS";

// Logging filter consumed by binaries and test helpers
pub const TETHER_LOG: &str = "TETHER_LOG";

// Defaults
pub const DEFAULT_BASE_PATH: &str = "workspace";
pub const DEFAULT_SHELL: &str = "sh";
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CONTAINER_IMAGE: &str = "ubuntu:24.04";
pub const DEFAULT_CONTAINER_STARTUP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONTAINER_WORKDIR: &str = "/workspace";
/// Container port exposed for browser/UI preview when common ports are enabled.
pub const DEFAULT_PREVIEW_PORT: u16 = 6080;
pub const DEFAULT_CLOUD_API_URL: &str = "http://localhost:3986";
pub const DEFAULT_CLOUD_TEMPLATE: &str = "base";
pub const DEFAULT_CLOUD_SANDBOX_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_AGENT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
