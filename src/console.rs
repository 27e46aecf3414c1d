//! Line-oriented terminal front end.
//!
//! Owns the [`SessionManager`] and feeds it, one at a time, transport events
//! from both sessions and lines typed on stdin.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::{HistoryTarget, Input, ParsedCommand, SlashCommand, get_help_text, parse_input};
use crate::config::Config;
use crate::events::{ChatMessage, ChatRole, ConversationChannel, ConversationEntry};
use crate::hub::HubTransport;
use crate::session::{SessionManager, SessionUpdate};
use crate::transport::{SessionKind, event_channel};

pub struct Console {
    manager: SessionManager,
    /// An AI answer is being printed token by token
    ai_line_open: bool,
}

impl Console {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            ai_line_open: false,
        }
    }

    /// Render the effect of one handled event
    pub fn render(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Entry { channel, entry } => {
                self.close_ai_line();
                print_entry(&channel, &entry);
            }
            SessionUpdate::AiToken(token) => {
                if !self.ai_line_open {
                    print!("🤖 ");
                    self.ai_line_open = true;
                }
                print!("{}", token);
                let _ = io::stdout().flush();
            }
            SessionUpdate::AiReply(message) => {
                if self.ai_line_open {
                    println!();
                    self.ai_line_open = false;
                } else {
                    println!("🤖 {}", message.content);
                }
            }
            SessionUpdate::RosterChanged => {
                self.close_ai_line();
                println!("👥 {} other user(s) online", self.manager.filtered_users().len());
            }
            SessionUpdate::GroupsChanged => {
                self.close_ai_line();
                println!("📚 {} group(s) available", self.manager.directory().groups().len());
            }
            SessionUpdate::Connected(SessionKind::Primary) => {
                self.close_ai_line();
                println!("✅ {}", self.manager.status());
                self.print_history(HistoryTarget::Channel(ConversationChannel::Broadcast));
                println!("💡 Type a message to talk to everyone, or /help for commands.");
            }
            SessionUpdate::Connected(SessionKind::Ai) => {
                self.close_ai_line();
                println!("🤖 AI assistant connected.");
            }
            SessionUpdate::Status(status) => {
                self.close_ai_line();
                println!("ℹ️  {}", status);
            }
        }
    }

    fn close_ai_line(&mut self) {
        if self.ai_line_open {
            println!();
            self.ai_line_open = false;
        }
    }

    /// Run one line of user input. Returns false when the user asked to quit.
    pub async fn execute(&mut self, line: &str) -> bool {
        match parse_input(line) {
            Input::Empty => {}
            Input::Message(text) => {
                if let Err(e) = self.manager.send_to_all(&text).await {
                    println!("❌ {}", e);
                }
            }
            Input::Unknown(text) => {
                println!("❓ Unknown command '{}'. Type /help for the list.", text);
            }
            Input::Command(parsed) => return self.run_command(parsed).await,
        }
        true
    }

    async fn run_command(&mut self, parsed: ParsedCommand) -> bool {
        let command = parsed.command;
        if command.requires_argument() && parsed.argument().is_none() {
            println!("⚠️  /{} needs an argument: {}", command.command(), command.description());
            return true;
        }
        let arg = parsed.argument().unwrap_or_default().to_string();

        match command {
            SlashCommand::Name => match self.manager.save_display_name(&arg).await {
                Ok(()) => println!("✅ You are now known as {}", arg),
                Err(e) => println!("❌ {}", e),
            },
            SlashCommand::All => {
                if let Err(e) = self.manager.send_to_all(&arg).await {
                    println!("❌ {}", e);
                }
            }
            SlashCommand::Pm => match parsed.recipient_and_message() {
                Some((recipient, message)) => self.send_private(recipient, message).await,
                None => println!("⚠️  Usage: /pm <connection id> <message>"),
            },
            SlashCommand::Reply => match self.manager.private_target().map(str::to_string) {
                Some(recipient) => self.send_private(&recipient, &arg).await,
                None => println!("📭 Nobody has written to you privately yet."),
            },
            SlashCommand::Join => match self.manager.join_group(&arg).await {
                Ok(true) => println!("✅ Joined group {}", arg),
                Ok(false) => println!("ℹ️  Already in group {}", arg),
                Err(e) => println!("❌ {}", e),
            },
            SlashCommand::Leave => {
                let group = self.manager.active_group().map(str::to_string);
                match self.manager.leave_group().await {
                    Ok(true) => println!("👋 Left group {}", group.unwrap_or_default()),
                    Ok(false) => println!("ℹ️  You are not in a group."),
                    Err(e) => println!("❌ {}", e),
                }
            }
            SlashCommand::Group => match self.manager.send_group_message(&arg).await {
                Ok(true) => {}
                Ok(false) => println!("⚠️  Join a group first with /join <name>"),
                Err(e) => println!("❌ {}", e),
            },
            SlashCommand::Groups => {
                if let Err(e) = self.manager.refresh_groups().await {
                    println!("❌ {}", e);
                }
                self.print_groups();
            }
            SlashCommand::Users => self.print_users(),
            SlashCommand::Ai => {
                if self.manager.send_to_ai(&arg, None) {
                    println!("⏳ Thinking...");
                } else {
                    println!("⏳ Still answering the previous question.");
                }
            }
            SlashCommand::Model => {
                if self.manager.select_model(&arg) {
                    match self.manager.selected_model() {
                        Some(model) => println!("✅ Using model {}", model),
                        None => println!("✅ Using the server's default model"),
                    }
                } else {
                    println!("❌ Unknown model '{}'. Type /models for the list.", arg);
                }
            }
            SlashCommand::Models => {
                println!("🧠 Available models:");
                for model in self.manager.available_models() {
                    let marker = if self.manager.selected_model() == Some(model.as_str()) { "*" } else { " " };
                    println!("  {} {}", marker, model);
                }
            }
            SlashCommand::History => match parsed.history_target() {
                Some(target) => self.print_history(target),
                None => println!("⚠️  Usage: /history <broadcast|private|group|ai>"),
            },
            SlashCommand::Status => self.print_status(),
            SlashCommand::Help => println!("{}", get_help_text()),
            SlashCommand::Quit => return false,
        }
        true
    }

    async fn send_private(&mut self, recipient: &str, message: &str) {
        match self.manager.send_private(recipient, message).await {
            Ok(true) => {
                if let Some(entry) = self.manager.history(&ConversationChannel::Private).last() {
                    print_entry(&ConversationChannel::Private, entry);
                }
            }
            Ok(false) => println!("⚠️  Usage: /pm <connection id> <message>"),
            Err(e) => println!("❌ {}", e),
        }
    }

    fn print_users(&self) {
        if let Some(id) = self.manager.local_peer_id() {
            println!("🪪 Your connection id: {}", id);
        }
        let users = self.manager.filtered_users();
        if users.is_empty() {
            println!("📭 Nobody else is online.");
            return;
        }
        println!("👥 Online:");
        for peer in users {
            let label = self
                .manager
                .directory()
                .resolve_label(&peer.connection_id, self.manager.local_peer_id());
            println!("  • {} ({})", label, peer.connection_id);
        }
    }

    fn print_groups(&self) {
        let groups = self.manager.directory().groups();
        if groups.is_empty() {
            println!("📭 No groups yet. Create one with /join <name>.");
            return;
        }
        println!("📚 Groups:");
        for group in groups {
            let marker = if self.manager.active_group() == Some(group.name.as_str()) { "*" } else { " " };
            let members: Vec<String> = self
                .manager
                .group_members(&group.name)
                .iter()
                .map(|peer| {
                    self.manager
                        .directory()
                        .resolve_label(&peer.connection_id, self.manager.local_peer_id())
                })
                .collect();
            println!("  {} {} ({})", marker, group.name, members.join(", "));
        }
    }

    fn print_history(&self, target: HistoryTarget) {
        match target {
            HistoryTarget::Channel(channel) => {
                for entry in self.manager.history(&channel) {
                    print_entry(&channel, entry);
                }
            }
            HistoryTarget::ActiveGroup => match self.manager.active_group() {
                Some(group) => {
                    let channel = ConversationChannel::Group(group.to_string());
                    for entry in self.manager.group_history() {
                        print_entry(&channel, entry);
                    }
                }
                None => println!("ℹ️  You are not in a group."),
            },
            HistoryTarget::Ai => {
                for message in self.manager.ai_history() {
                    print_ai_message(message);
                }
                if self.manager.ai_in_flight() {
                    println!("🤖 {}…", self.manager.ai_pending());
                }
            }
        }
    }

    fn print_status(&self) {
        println!("📡 Status");
        for kind in [SessionKind::Primary, SessionKind::Ai] {
            let session = self.manager.session_info(kind);
            println!(
                "   {}: {} (id: {}, attempts: {})",
                session.kind(),
                self.manager.connection_state(kind),
                session.connection_id().unwrap_or("-"),
                session.attempts()
            );
        }
        let membership = self.manager.membership();
        if let Some(group) = membership.active_group() {
            let since = membership
                .listener(group)
                .map(|l| l.registered_at().with_timezone(&Local).format("%H:%M").to_string())
                .unwrap_or_default();
            println!(
                "   group: {} ({:?} since {}, {} listener(s))",
                group,
                membership.phase(),
                since,
                membership.registry().len()
            );
        }
        println!(
            "   model: {}",
            self.manager.selected_model().unwrap_or("server default")
        );
        if self.manager.is_loading() {
            println!("   ai: waiting for first token");
        }
        if !self.manager.status().is_empty() {
            println!("   last: {}", self.manager.status());
        }
    }
}

fn print_entry(channel: &ConversationChannel, entry: &ConversationEntry) {
    println!(
        "💬 {} [{}] {}: {}",
        entry.received_at.with_timezone(&Local).format("%H:%M"),
        channel.display_name(),
        entry.author,
        entry.body
    );
}

fn print_ai_message(message: &ChatMessage) {
    match message.role {
        ChatRole::User => println!("🧑 {}", message.content),
        ChatRole::Assistant => println!("🤖 {}", message.content),
    }
}

/// Connect both hubs and run the interactive loop until /quit, EOF or Ctrl-C
pub async fn run(config: Config) -> Result<()> {
    let (primary_tx, mut primary_rx) = event_channel();
    let (ai_tx, mut ai_rx) = event_channel();
    let primary = Arc::new(HubTransport::new(
        SessionKind::Primary,
        config.hub_url.clone(),
        config.reconnect_delays(),
        primary_tx,
    ));
    // SendAiMessage completes only after the whole answer has streamed
    let ai = Arc::new(
        HubTransport::new(
            SessionKind::Ai,
            config.ai_hub_url.clone(),
            config.reconnect_delays(),
            ai_tx,
        )
        .without_invocation_timeout(),
    );

    let mut console = Console::new(SessionManager::new(&config, primary.clone(), ai.clone()));
    let mut signals = console
        .manager
        .take_signals()
        .context("Session signals were already taken")?;

    println!("🚀 Connecting to {} and {} ...", primary.url(), ai.url());
    console.manager.start_all();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        // Transport events first so fragments are applied before the
        // request that produced them settles
        tokio::select! {
            biased;
            Some(event) = ai_rx.recv() => {
                if let Some(update) = console.manager.handle_event(SessionKind::Ai, event) {
                    console.render(update);
                }
            }
            Some(event) = primary_rx.recv() => {
                if let Some(update) = console.manager.handle_event(SessionKind::Primary, event) {
                    console.render(update);
                }
            }
            Some(signal) = signals.recv() => {
                if let Some(update) = console.manager.handle_signal(signal).await {
                    console.render(update);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                if !console.execute(&line).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    console.manager.stop().await;
    println!("👋 Bye!");
    Ok(())
}
