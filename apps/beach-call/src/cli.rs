use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-call",
    about = "Two-party audio/video calls joined with a six-character code",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "BEACH_CALL_RELAY_URL",
        help = "WebSocket URL of the call relay (ws:// or wss://)"
    )]
    pub relay: Option<String>,

    #[arg(
        long = "ice-server",
        global = true,
        value_name = "URL",
        help = "STUN/TURN server to use instead of the defaults (repeatable)"
    )]
    pub ice_servers: Vec<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "BEACH_CALL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "BEACH_CALL_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a call and print its code
    Create(CreateArgs),
    /// Join a call by code
    Join(JoinArgs),
    /// Run an owner and a joiner in this process over an in-memory relay
    Demo(DemoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    #[arg(long, help = "Ask before letting each joiner in")]
    pub admission: bool,

    #[arg(
        long = "auto-admit",
        requires = "admission",
        help = "Admit every joiner without prompting"
    )]
    pub auto_admit: bool,
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// Six-character call code (case-insensitive)
    pub code: String,
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    #[arg(long, help = "Route the joiner through the owner's admission gate")]
    pub admission: bool,

    #[arg(
        long,
        default_value_t = 5,
        value_name = "SECS",
        help = "How long to stay connected before the joiner hangs up"
    )]
    pub hold: u64,
}
