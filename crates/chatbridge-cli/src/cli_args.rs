use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "chatbridge",
    about = "Instant-messaging support bridge with AI replies and human handoff",
    version
)]
pub struct Cli {
    #[arg(
        long = "state-dir",
        env = "CHATBRIDGE_STATE_DIR",
        default_value = ".chatbridge",
        global = true,
        help = "Directory holding credentials, connection snapshot, stores, and audit logs"
    )]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Connect to the sidecar and serve inbound messages until Ctrl-C.
    Run(RunArgs),
    /// Print the persisted connection snapshot.
    Status(StatusArgs),
    /// Purge credentials and reset the connection snapshot (bridge must be stopped).
    Reset,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long, default_value_t = false, help = "Emit the snapshot as JSON")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(
        long = "sidecar-url",
        env = "CHATBRIDGE_SIDECAR_URL",
        default_value = "ws://127.0.0.1:8790/bridge",
        help = "WebSocket URL of the messaging-platform sidecar"
    )]
    pub sidecar_url: String,

    #[arg(
        long = "sidecar-request-timeout-ms",
        env = "CHATBRIDGE_SIDECAR_REQUEST_TIMEOUT_MS",
        default_value_t = 15_000,
        value_parser = parse_positive_u64,
        help = "Timeout in milliseconds for sidecar command responses"
    )]
    pub sidecar_request_timeout_ms: u64,

    #[arg(
        long = "reconnect-delay-ms",
        env = "CHATBRIDGE_RECONNECT_DELAY_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Fixed delay in milliseconds before each reconnect attempt"
    )]
    pub reconnect_delay_ms: u64,

    #[arg(
        long = "max-credential-resets",
        env = "CHATBRIDGE_MAX_CREDENTIAL_RESETS",
        default_value_t = 3,
        help = "Credential rejections tolerated before the connection enters the failed state"
    )]
    pub max_credential_resets: u32,

    #[arg(
        long = "processed-message-cap",
        env = "CHATBRIDGE_PROCESSED_MESSAGE_CAP",
        default_value_t = 512,
        value_parser = parse_positive_usize,
        help = "Number of recent inbound message ids remembered for duplicate suppression"
    )]
    pub processed_message_cap: usize,

    #[arg(
        long = "history-window",
        env = "CHATBRIDGE_HISTORY_WINDOW",
        default_value_t = 20,
        value_parser = parse_positive_usize,
        help = "Conversation messages kept per contact and sent to the AI responder"
    )]
    pub history_window: usize,

    #[arg(
        long = "session-cleanup-interval-ms",
        env = "CHATBRIDGE_SESSION_CLEANUP_INTERVAL_MS",
        default_value_t = 3_600_000,
        value_parser = parse_positive_u64,
        help = "Interval in milliseconds between idle conversation session sweeps"
    )]
    pub session_cleanup_interval_ms: u64,

    #[arg(
        long = "session-max-idle-ms",
        env = "CHATBRIDGE_SESSION_MAX_IDLE_MS",
        default_value_t = 86_400_000,
        value_parser = parse_positive_u64,
        help = "Conversation sessions idle for longer than this are purged"
    )]
    pub session_max_idle_ms: u64,

    #[arg(
        long = "apology-text",
        env = "CHATBRIDGE_APOLOGY_TEXT",
        default_value = chatbridge_runtime::DEFAULT_APOLOGY_TEXT,
        help = "Reply sent to the customer when a dispatch fails unexpectedly"
    )]
    pub apology_text: String,

    #[arg(
        long = "responder-api-base",
        env = "CHATBRIDGE_RESPONDER_API_BASE",
        default_value = chatbridge_runtime::DEFAULT_RESPONDER_API_BASE,
        help = "Base URL of the OpenAI-compatible chat completions API"
    )]
    pub responder_api_base: String,

    #[arg(
        long = "responder-model",
        env = "CHATBRIDGE_RESPONDER_MODEL",
        default_value = chatbridge_runtime::DEFAULT_RESPONDER_MODEL,
        help = "Model name sent with every completion request"
    )]
    pub responder_model: String,

    #[arg(
        long = "responder-api-key",
        env = "CHATBRIDGE_RESPONDER_API_KEY",
        hide_env_values = true,
        help = "API key for the responder endpoint"
    )]
    pub responder_api_key: Option<String>,

    #[arg(
        long = "responder-system-prompt",
        env = "CHATBRIDGE_RESPONDER_SYSTEM_PROMPT",
        help = "Override the built-in system prompt (should mention the handoff marker)"
    )]
    pub responder_system_prompt: Option<String>,

    #[arg(
        long = "responder-timeout-ms",
        env = "CHATBRIDGE_RESPONDER_TIMEOUT_MS",
        default_value_t = chatbridge_runtime::DEFAULT_RESPONDER_TIMEOUT_MS,
        value_parser = parse_positive_u64,
        help = "HTTP timeout in milliseconds for one AI completion"
    )]
    pub responder_timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{Cli, CliCommand};

    #[test]
    fn unit_cli_run_defaults_match_runtime_defaults() {
        let cli = Cli::try_parse_from(["chatbridge", "run"]).expect("parse");
        let CliCommand::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.reconnect_delay_ms, 5_000);
        assert_eq!(args.max_credential_resets, 3);
        assert_eq!(args.processed_message_cap, 512);
        assert_eq!(args.history_window, 20);
        assert_eq!(args.sidecar_url, "ws://127.0.0.1:8790/bridge");
    }

    #[test]
    fn unit_cli_accepts_global_state_dir_after_subcommand() {
        let cli = Cli::try_parse_from(["chatbridge", "status", "--json", "--state-dir", "/tmp/cb"])
            .expect("parse");
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/cb"));
        assert!(matches!(cli.command, CliCommand::Status(args) if args.json));
    }

    #[test]
    fn regression_cli_rejects_zero_reconnect_delay() {
        let error = Cli::try_parse_from(["chatbridge", "run", "--reconnect-delay-ms", "0"])
            .expect_err("zero delay");
        assert!(error.to_string().contains("value must be greater than 0"));
    }
}
