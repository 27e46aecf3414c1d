use std::str::FromStr;

use strum::{EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::events::ConversationChannel;

/// Commands that can be invoked by starting a line with a leading slash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum SlashCommand {
    /// Save the display name other peers see
    Name,
    /// Broadcast to everyone
    All,
    /// Private message to a connection id
    Pm,
    /// Private reply to whoever wrote last
    Reply,
    /// Join a group, leaving the current one
    Join,
    /// Leave the current group
    Leave,
    /// Post to the current group
    Group,
    /// List groups and their members
    Groups,
    /// List connected peers
    Users,
    /// Ask the AI
    Ai,
    /// Pick the AI model
    Model,
    /// List AI models
    Models,
    /// Show a channel's history
    History,
    /// Show connection status
    Status,
    /// Show help
    Help,
    /// Exit the application
    Quit,
}

impl SlashCommand {
    /// User-visible description shown in help.
    pub fn description(self) -> &'static str {
        match self {
            SlashCommand::Name => "set your display name",
            SlashCommand::All => "send a message to everyone",
            SlashCommand::Pm => "send a private message: /pm <connection id> <message>",
            SlashCommand::Reply => "reply privately to the last person who wrote to you",
            SlashCommand::Join => "join a group (leaves the current one)",
            SlashCommand::Leave => "leave the current group",
            SlashCommand::Group => "send a message to the current group",
            SlashCommand::Groups => "list groups and their members",
            SlashCommand::Users => "list connected users",
            SlashCommand::Ai => "ask the AI assistant",
            SlashCommand::Model => "switch AI model (no name restores the server default)",
            SlashCommand::Models => "list available AI models",
            SlashCommand::History => "show history: broadcast, private, group or ai",
            SlashCommand::Status => "show connection status",
            SlashCommand::Help => "show available commands",
            SlashCommand::Quit => "exit the application",
        }
    }

    /// Command string without the leading '/'.
    pub fn command(self) -> &'static str {
        self.into()
    }

    /// Whether the command is meaningless without an argument.
    pub fn requires_argument(self) -> bool {
        matches!(
            self,
            SlashCommand::Name
                | SlashCommand::All
                | SlashCommand::Pm
                | SlashCommand::Reply
                | SlashCommand::Join
                | SlashCommand::Group
                | SlashCommand::Ai
                | SlashCommand::History
        )
    }
}

/// History view requested with `/history`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryTarget {
    Channel(ConversationChannel),
    /// Whichever group is currently joined
    ActiveGroup,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: SlashCommand,
    pub argument: Option<String>,
}

impl ParsedCommand {
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }

    /// Split `/pm <id> <message>` into its two parts
    pub fn recipient_and_message(&self) -> Option<(&str, &str)> {
        if self.command != SlashCommand::Pm {
            return None;
        }
        let (recipient, message) = self.argument()?.split_once(char::is_whitespace)?;
        let message = message.trim_start();
        if message.is_empty() {
            return None;
        }
        Some((recipient, message))
    }

    pub fn history_target(&self) -> Option<HistoryTarget> {
        if self.command != SlashCommand::History {
            return None;
        }

        let arg = self.argument()?.trim().to_lowercase();
        match arg.as_str() {
            "b" | "all" | "broadcast" => Some(HistoryTarget::Channel(ConversationChannel::Broadcast)),
            "p" | "pm" | "private" => Some(HistoryTarget::Channel(ConversationChannel::Private)),
            "g" | "group" => Some(HistoryTarget::ActiveGroup),
            "ai" => Some(HistoryTarget::Ai),
            _ => None,
        }
    }
}

/// One line typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    /// Plain text, broadcast to everyone
    Message(String),
    Command(ParsedCommand),
    /// Slash followed by something that is not a command
    Unknown(String),
}

/// Classify a line of user input
pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    match parse_slash_command(line) {
        Some(parsed) => Input::Command(parsed),
        None if line.starts_with('/') => Input::Unknown(line.to_string()),
        None => Input::Message(line.to_string()),
    }
}

/// Parse a slash command from user input
pub fn parse_slash_command(input: &str) -> Option<ParsedCommand> {
    let body = input.strip_prefix('/')?;

    // Everything after the command word is kept verbatim, inner spacing included
    let (head, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    if head.is_empty() {
        return None;
    }
    let rest = rest.trim();

    let command = SlashCommand::from_str(&head.to_lowercase())
        .ok()
        .or_else(|| match head.to_lowercase().as_str() {
            "q" | "exit" | "bye" => Some(SlashCommand::Quit),
            "dm" | "msg" => Some(SlashCommand::Pm),
            "r" => Some(SlashCommand::Reply),
            "?" | "h" => Some(SlashCommand::Help),
            _ => None,
        })?;

    let argument = (!rest.is_empty()).then(|| rest.to_string());

    Some(ParsedCommand { command, argument })
}

/// Get help text for all available commands
pub fn get_help_text() -> String {
    let mut help = String::from("Available commands:\n\n");
    for command in SlashCommand::iter() {
        help.push_str(&format!("/{} - {}\n", command.command(), command.description()));
    }

    help.push_str("\nPlain text without a slash is sent to everyone.");
    help.push_str("\nAliases: /q for /quit, /dm for /pm, /r for /reply, /? for /help");

    help
}
