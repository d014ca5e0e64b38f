// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Corral

// Server Configuration
pub const CORRAL_HOST: &str = "CORRAL_HOST";
pub const CORRAL_PORT: &str = "CORRAL_PORT";
pub const PORT: &str = "PORT"; // Legacy
pub const CORRAL_CORS_ORIGIN: &str = "CORRAL_CORS_ORIGIN";

// Persistence
pub const CORRAL_DATABASE_URL: &str = "CORRAL_DATABASE_URL";

// Sandbox Provisioning
pub const CORRAL_SANDBOX_IMAGE: &str = "CORRAL_SANDBOX_IMAGE";
pub const CORRAL_SANDBOX_MEMORY_MB: &str = "CORRAL_SANDBOX_MEMORY_MB";
pub const CORRAL_SANDBOX_CPU_CORES: &str = "CORRAL_SANDBOX_CPU_CORES";
pub const CORRAL_SANDBOX_NETWORK_MODE: &str = "CORRAL_SANDBOX_NETWORK_MODE";
pub const CORRAL_SANDBOX_WORKDIR: &str = "CORRAL_SANDBOX_WORKDIR";
pub const CORRAL_IMAGE_PULL_TIMEOUT_SECONDS: &str = "CORRAL_IMAGE_PULL_TIMEOUT_SECONDS";

// Execution Runner
pub const CORRAL_AGENT_PROGRAM: &str = "CORRAL_AGENT_PROGRAM";
pub const CORRAL_TOOL_CATALOG: &str = "CORRAL_TOOL_CATALOG";
pub const CORRAL_REQUIRE_TOOLS: &str = "CORRAL_REQUIRE_TOOLS";

// Stream Gateway
pub const CORRAL_HEARTBEAT_INTERVAL_SECONDS: &str = "CORRAL_HEARTBEAT_INTERVAL_SECONDS";
pub const CORRAL_EVENT_CHANNEL_SIZE: &str = "CORRAL_EVENT_CHANNEL_SIZE";

// Session Monitor
pub const CORRAL_HEALTH_CHECK_INTERVAL_SECONDS: &str = "CORRAL_HEALTH_CHECK_INTERVAL_SECONDS";
pub const CORRAL_IDLE_TIMEOUT_SECONDS: &str = "CORRAL_IDLE_TIMEOUT_SECONDS";

// Webhook Dispatcher
pub const CORRAL_WEBHOOK_MAX_RETRIES: &str = "CORRAL_WEBHOOK_MAX_RETRIES";
pub const CORRAL_WEBHOOK_BACKOFF_MS: &str = "CORRAL_WEBHOOK_BACKOFF_MS";
pub const CORRAL_WEBHOOK_MAX_BACKOFF_MS: &str = "CORRAL_WEBHOOK_MAX_BACKOFF_MS";
pub const CORRAL_WEBHOOK_TIMEOUT_SECONDS: &str = "CORRAL_WEBHOOK_TIMEOUT_SECONDS";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
