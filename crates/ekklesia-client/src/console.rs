//! Line-oriented console: command parsing, execution and rendering.

use std::ops::ControlFlow;

use ekklesia_shared::{
    ConversationKey, DeliveryState, GroupId, Message, MessageId, UserId,
};
use ekklesia_sync::{Contact, EngineHandle, EngineNotification};
use thiserror::Error;

use crate::backend::Backend;

/// Messages shown when a timeline is rendered.
const TIMELINE_TAIL: usize = 10;

pub const HELP: &str = "\
Commands:
  /open <user>        open the direct conversation with <user>
  /group <id>         open a group conversation
  /close              close the active conversation
  /read <user>        mark <user> as read
  /roster             show contacts with unread counts
  /retry <id>         resend a failed message
  /as <user> <text>   deliver <text> to you from <user>
  /fail               make the next send fail
  /offline, /online   toggle event bus connectivity
  /help               show this help
  /quit               exit
Any other line is sent to the active conversation.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open(UserId),
    Group(GroupId),
    Close,
    Read(UserId),
    Roster,
    Retry(MessageId),
    As { from: UserId, body: String },
    Fail,
    Online(bool),
    Help,
    Quit,
    Send(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),
}

fn user_arg(arg: &str, usage: &'static str) -> Result<UserId, ParseError> {
    match arg.split_whitespace().collect::<Vec<_>>().as_slice() {
        [id] if !id.contains(':') => Ok(UserId::new(*id)),
        _ => Err(ParseError::Usage(usage)),
    }
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "open" => Command::Open(user_arg(arg, "/open <user>")?),
        "group" => {
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains(':') {
                return Err(ParseError::Usage("/group <id>"));
            }
            Command::Group(GroupId::new(arg))
        }
        "close" => Command::Close,
        "read" => Command::Read(user_arg(arg, "/read <user>")?),
        "roster" => Command::Roster,
        "retry" => {
            let id = arg
                .parse::<MessageId>()
                .map_err(|_| ParseError::InvalidMessageId(arg.to_string()))?;
            Command::Retry(id)
        }
        "as" => match arg.split_once(char::is_whitespace) {
            Some((from, body)) if !body.trim().is_empty() => Command::As {
                from: user_arg(from, "/as <user> <text>")?,
                body: body.trim().to_string(),
            },
            _ => return Err(ParseError::Usage("/as <user> <text>")),
        },
        "fail" => Command::Fail,
        "offline" => Command::Online(false),
        "online" => Command::Online(true),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

/// Run one command against the engine.
pub async fn execute(
    command: Command,
    me: &UserId,
    engine: &EngineHandle,
    backend: &Backend,
) -> anyhow::Result<ControlFlow<()>> {
    match command {
        Command::Open(user) => {
            engine
                .select_conversation(ConversationKey::direct(me.clone(), user))
                .await?;
        }
        Command::Group(id) => {
            let (group, members) = backend.group_info(&id)?;
            let members: Vec<&str> = members.iter().map(UserId::as_str).collect();
            println!("# {} ({})", group.name, members.join(", "));
            engine
                .select_conversation(ConversationKey::Group(id))
                .await?;
        }
        Command::Close => match engine.close_conversation().await? {
            Some(key) => println!("Closed {key}"),
            None => println!("No conversation is open"),
        },
        Command::Read(user) => engine.mark_read(user).await?,
        Command::Roster => {
            let contacts = engine.roster().await?;
            print!("{}", render_roster(&contacts));
            println!("Unread: {}", engine.unread_total().await?);
        }
        Command::Retry(id) => {
            let id = engine.retry(id).await?;
            println!("Resending as {id}");
        }
        Command::As { from, body } => {
            backend.inject(from, me.clone(), &body)?;
        }
        Command::Fail => backend.fail_next_dispatch(),
        Command::Online(online) => backend.bus().set_online(online)?,
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(ControlFlow::Break(())),
        Command::Send(body) => {
            engine.send(body).await?;
        }
    }
    Ok(ControlFlow::Continue(()))
}

fn state_marker(message: &Message) -> &'static str {
    match message.delivery_state {
        DeliveryState::Pending => " …",
        DeliveryState::Confirmed => "",
        DeliveryState::Failed => " (failed)",
    }
}

pub fn render_timeline(key: &ConversationKey, messages: &[Message]) -> String {
    let mut out = format!("── {key} ──\n");
    let skip = messages.len().saturating_sub(TIMELINE_TAIL);
    for message in &messages[skip..] {
        out.push_str(&format!(
            "[{}] {}: {}{}",
            message.created_at.format("%H:%M"),
            message.sender_id,
            message.body,
            state_marker(message)
        ));
        if message.is_failed() {
            out.push_str(&format!("  /retry {}", message.id));
        }
        out.push('\n');
    }
    out
}

pub fn render_roster(contacts: &[Contact]) -> String {
    let mut out = String::new();
    for contact in contacts {
        let star = if contact.favorite { "*" } else { " " };
        let unread = if contact.unread_count > 0 {
            format!(" [{}]", contact.unread_count)
        } else {
            String::new()
        };
        let preview = contact.last_message_preview.as_deref().unwrap_or("");
        out.push_str(&format!(
            "{star} {:<20} {:<10}{unread} {preview}\n",
            contact.display_name, contact.id
        ));
    }
    out
}

/// Render a notification, fetching whatever state it refers to.
pub async fn render_notification(
    notification: &EngineNotification,
    engine: &EngineHandle,
) -> Option<String> {
    match notification {
        EngineNotification::Started => Some("Connected. Type /help for commands.".to_string()),
        EngineNotification::TimelineChanged { key } => {
            // Ignore changes for a conversation that was closed meanwhile.
            let active = engine.active_conversation().await.ok().flatten()?;
            if &active != key {
                return None;
            }
            let messages = engine.timeline().await.ok()?;
            Some(render_timeline(key, &messages))
        }
        EngineNotification::RosterChanged => None,
        EngineNotification::MessageFailed {
            message_id, reason, ..
        } => Some(format!("! Message {message_id} failed: {reason}")),
        EngineNotification::SubscriptionFailed {
            topic,
            reason,
            will_retry,
        } => Some(format!(
            "! Subscription to {topic} failed: {reason}{}",
            if *will_retry { " (retrying)" } else { "" }
        )),
        EngineNotification::SubscriptionRestored { topic } => {
            Some(format!("Subscription to {topic} restored"))
        }
        EngineNotification::HistoryFailed { key, reason } => {
            Some(format!("! History of {key} unavailable: {reason}"))
        }
        EngineNotification::RosterSourceFailed { source, reason } => {
            Some(format!("! Contact source {source} failed: {reason}"))
        }
        EngineNotification::MarkReadFailed { contact, reason } => {
            Some(format!("! Could not mark {contact} read remotely: {reason}"))
        }
        EngineNotification::Closed => Some("Disconnected.".to_string()),
    }
}
