use crate::session::{SessionChannels, SessionCommand, SessionEvent};
use anyhow::Result;
use crossterm::style::Stylize;
use std::io::{BufRead, Write};
use tokio::sync::mpsc;

const LINE_CHANNEL_CAPACITY: usize = 8;

/// Minimal line-oriented terminal observer: renders session events and turns
/// typed lines into session commands. Any richer front-end can replace this
/// by holding the same pair of channels.
pub struct Frontend {
    channels: SessionChannels,
    tool_names: Vec<String>,
    awaiting_permission: bool,
}

impl Frontend {
    pub fn new(channels: SessionChannels, tool_names: Vec<String>) -> Self {
        Self {
            channels,
            tool_names,
            awaiting_permission: false,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut lines_rx = spawn_stdin_reader();

        println!("{}", "quill — type a message, /help for commands".dark_grey());
        print_prompt();

        loop {
            tokio::select! {
                event = self.channels.events_rx.recv() => match event {
                    Some(event) => self.render_event(event),
                    None => break,
                },
                line = lines_rx.recv() => match line {
                    Some(line) => {
                        if !self.handle_line(line).await {
                            break;
                        }
                    }
                    None => {
                        let _ = self.channels.commands_tx.send(SessionCommand::Shutdown).await;
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    let _ = self.channels.commands_tx.send(SessionCommand::CancelStream).await;
                    println!();
                    println!("{}", "(stream cancelled; /quit to exit)".yellow());
                    print_prompt();
                }
            }
        }

        Ok(())
    }

    fn render_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StreamStarted => {}
            SessionEvent::StreamChunk(text) => {
                print!("{text}");
                flush_stdout();
            }
            SessionEvent::StreamThink(text) => {
                print!("{}", text.dark_grey());
                flush_stdout();
            }
            SessionEvent::StreamEnded(_) => {
                println!();
                print_prompt();
            }
            SessionEvent::StreamCancelled => {
                println!();
                println!("{}", "[cancelled]".yellow());
                print_prompt();
            }
            SessionEvent::StreamError(error) => {
                println!();
                println!("{} {}", "error:".red(), error);
                print_prompt();
            }
            SessionEvent::ToolCallRequested { name, arguments } => {
                self.awaiting_permission = true;
                println!();
                println!(
                    "{} {} {} {}",
                    "tool request:".cyan(),
                    name.clone().bold(),
                    "args:".cyan(),
                    arguments
                );
                println!(
                    "{}",
                    "allow? [y] once / [a] always this session / [n] deny".cyan()
                );
                print_prompt();
            }
            SessionEvent::ToolRunning { name } => {
                println!("{} {}", "running".cyan(), name);
            }
            SessionEvent::ToolOutput(output) => {
                println!("{}", output.dark_grey());
            }
            SessionEvent::SystemMessage(text) => {
                println!("{}", text.yellow());
                print_prompt();
            }
        }
    }

    /// Returns false when the front-end should exit.
    async fn handle_line(&mut self, line: String) -> bool {
        let trimmed = line.trim();

        if self.awaiting_permission {
            let command = match trimmed.to_ascii_lowercase().as_str() {
                "y" | "yes" => SessionCommand::PermitToolOnce,
                "a" | "always" => SessionCommand::PermitToolForSession,
                _ => SessionCommand::DenyTool,
            };
            self.awaiting_permission = false;
            let _ = self.channels.commands_tx.send(command).await;
            return true;
        }

        if trimmed.is_empty() {
            print_prompt();
            return true;
        }

        if let Some(command_word) = trimmed.strip_prefix('/') {
            return self.handle_slash_command(command_word).await;
        }

        let _ = self
            .channels
            .commands_tx
            .send(SessionCommand::UserPrompt(trimmed.to_string()))
            .await;
        true
    }

    async fn handle_slash_command(&mut self, command_word: &str) -> bool {
        match command_word {
            "help" => {
                println!("{}", "/help   show this help".dark_grey());
                println!("{}", "/tools  list available tools".dark_grey());
                println!("{}", "/reset  clear the conversation".dark_grey());
                println!("{}", "/cancel cancel the in-flight response".dark_grey());
                println!("{}", "/quit   exit".dark_grey());
                print_prompt();
            }
            "tools" => {
                for name in &self.tool_names {
                    println!("{}", name.clone().dark_grey());
                }
                print_prompt();
            }
            "reset" => {
                let _ = self.channels.commands_tx.send(SessionCommand::Reset).await;
            }
            "cancel" => {
                let _ = self
                    .channels
                    .commands_tx
                    .send(SessionCommand::CancelStream)
                    .await;
            }
            "quit" | "exit" => {
                let _ = self
                    .channels
                    .commands_tx
                    .send(SessionCommand::Shutdown)
                    .await;
                return false;
            }
            other => {
                println!("{}", format!("unknown command '/{other}'; try /help").yellow());
                print_prompt();
            }
        }
        true
    }
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (lines_tx, lines_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let mut handle = stdin.lock();
        let mut buffer = String::new();
        loop {
            buffer.clear();
            match handle.read_line(&mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let line = buffer.trim_end_matches(['\r', '\n']).to_string();
                    if lines_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    lines_rx
}

fn print_prompt() {
    print!("{} ", ">".green());
    flush_stdout();
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}
