use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use vivid_link::cli::{parse_input, Args, Input, HELP};
use vivid_link::frame::InboundFrame;
use vivid_link::{
    FileSessionStore, LinkClient, LinkEvent, Message, Outbound, Phase, ProductProfile, SessionStore,
};

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn print_message(message: &Message) {
    let sender = if message.is_error {
        message.sender.bright_red().bold()
    } else if message.is_user {
        message.sender.bright_green().bold()
    } else {
        message.sender.bright_cyan().bold()
    };
    let round = message.round.map(|r| format!(" [round {r}]")).unwrap_or_default();
    println!("{sender}{round}: {}", message.content);
    if let Some(meta) = &message.metadata {
        if meta.transfer_to_human {
            println!("{}", "  → transferred to a human agent".yellow());
        }
    }
}

fn print_event(event: &LinkEvent) {
    match event {
        LinkEvent::StateChanged(state) => {
            let phase = match state.phase {
                Phase::Open => state.phase.to_string().green(),
                Phase::Connecting | Phase::Reconnecting => state.phase.to_string().yellow(),
                Phase::Closed => state.phase.to_string().red(),
            };
            let mut line = format!("[{phase}]");
            if state.phase == Phase::Reconnecting {
                line.push_str(&format!(" retry {}/{}", state.retry_count, state.max_retries));
            }
            if let Some(reason) = state.closed_reason {
                line.push_str(&format!(" ({reason:?})"));
            }
            println!("{}", line.dimmed());
        }
        LinkEvent::Reconnecting { attempt, delay } => {
            println!("{}", format!("reconnecting in {:.1}s (attempt {attempt})", delay.as_secs_f64()).yellow());
        }
        LinkEvent::GaveUp { attempts } => {
            println!(
                "{}",
                format!("connection lost after {attempts} retries, type /reconnect to try again").bright_red()
            );
        }
        LinkEvent::Typing { sender } => println!("{}", format!("{sender} is typing…").dimmed()),
        LinkEvent::TypingCleared { .. } | LinkEvent::Partial { .. } => {}
        LinkEvent::Message(message) => print_message(message),
        LinkEvent::Session { session_id, resumed } => {
            let verb = if *resumed { "resumed" } else { "created" };
            println!("{}", format!("session {verb}: {session_id}").dimmed());
        }
        LinkEvent::Frame(frame) => print_frame(frame),
    }
}

fn print_frame(frame: &InboundFrame) {
    match frame {
        InboundFrame::Ready { message } => {
            println!("{}", message.as_deref().unwrap_or("ready").bright_blue());
        }
        InboundFrame::Evaluation { data } => println!("{} {data}", "evaluation:".bright_magenta()),
        InboundFrame::VideoState { state } => println!("{}", format!("video: {state}").dimmed()),
        InboundFrame::InterviewEnd { message, evaluation } => {
            println!("{}", message.as_deref().unwrap_or("interview finished").bright_blue().bold());
            if let Some(evaluation) = evaluation {
                println!("{evaluation}");
            }
        }
        other => println!("{}", format!("<{}>", other.kind()).dimmed()),
    }
}

async fn render(mut events: broadcast::Receiver<LinkEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.verbose { "vivid_link=debug" } else { "vivid_link=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = args.link_config()?;
    let settings = config.resolve(args.product)?;
    let profile = ProductProfile::preset(args.product);
    let store: Option<Arc<dyn SessionStore>> = config
        .session_file
        .as_ref()
        .map(|path| Arc::new(FileSessionStore::new(path)) as Arc<dyn SessionStore>);

    println!("{}", format!("vivid-link · {} · {}", args.product, settings.url).bright_cyan().bold());
    println!("{}", "type /help for commands".dimmed());

    let (client, events) = LinkClient::connect(settings, store);
    let printer = tokio::spawn(render(events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match parse_input(&line) {
            Input::Empty => Ok(()),
            Input::Text(text) => {
                let payload = profile.user_request(&text, &args.recipients, &args.mode);
                client.send_user(payload, Message::user(profile.user_sender.as_str(), text)).await
            }
            Input::Reconnect => client.reconnect(),
            Input::Disconnect => client.disconnect(),
            Input::ClearSession => client.clear_session(),
            Input::State => {
                println!("{:?}", client.state());
                Ok(())
            }
            Input::StartInterview(ids) => {
                client
                    .send(Outbound::StartInterview { experience_set_ids: ids, experience_mode: None })
                    .await
            }
            Input::EndInterview => client.send(Outbound::EndInterview).await,
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::Quit => break,
            Input::Unknown(cmd) => {
                println!("{}", format!("unknown command /{cmd}").red());
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("{}", format!("error: {e}").red());
        }
    }

    client.shutdown().await;
    drop(client);
    let _ = printer.await;
    Ok(())
}
