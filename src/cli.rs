use std::path::PathBuf;

use clap::Parser;

use crate::config::{LinkConfig, Product};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "vivid-link")]
#[command(version)]
#[command(about = "Terminal client for the VividCrowd real-time chat endpoints")]
pub struct Args {
    /// Product endpoint to connect to
    #[arg(value_enum)]
    pub product: Product,

    /// TOML file with connection overrides
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Backend host[:port] (overrides the config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Use wss:// instead of ws://
    #[arg(long)]
    pub secure: bool,

    /// Recipient ids for celebrity / digital-customer broadcasts (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub recipients: Vec<String>,

    /// Broadcast mode sent alongside the recipients
    #[arg(long, default_value = "group")]
    pub mode: String,

    /// Interview session id (required for the interview product)
    #[arg(long)]
    pub interview_session: Option<String>,

    /// JSON file used to persist resumable session ids
    #[arg(long)]
    pub session_file: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short)]
    pub verbose: bool,
}

impl Args {
    /// The config file (if any) with command-line overrides applied.
    pub fn link_config(&self) -> Result<LinkConfig> {
        let mut cfg = match &self.config {
            Some(path) => LinkConfig::load(path)?,
            None => LinkConfig::default(),
        };
        if let Some(host) = &self.host {
            cfg.host = Some(host.clone());
        }
        if self.secure {
            cfg.secure = Some(true);
        }
        if let Some(session) = &self.interview_session {
            cfg.interview_session = Some(session.clone());
        }
        if let Some(file) = &self.session_file {
            cfg.session_file = Some(file.clone());
        }
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Interactive input
// ---------------------------------------------------------------------------

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Text(String),
    Reconnect,
    Disconnect,
    ClearSession,
    State,
    /// `/start 1,2,3` for the interview product.
    StartInterview(Vec<String>),
    EndInterview,
    Help,
    Quit,
    Unknown(String),
}

pub const HELP: &str = "\
/reconnect      reconnect now, resetting the retry budget
/disconnect     close without reconnecting
/clear          forget the persisted session id
/state          print the connection state
/start [ids]    start an interview (comma separated experience set ids)
/end            end the interview
/quit           exit";

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Text(line.to_string());
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    match name {
        "reconnect" => Input::Reconnect,
        "disconnect" => Input::Disconnect,
        "clear" => Input::ClearSession,
        "state" => Input::State,
        "start" => Input::StartInterview(
            rest.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        "end" => Input::EndInterview,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    }
}
