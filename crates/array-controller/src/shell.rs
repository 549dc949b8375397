//! Interactive operator shell

use crate::progress::ProgressEvent;
use crate::session::{CloseReport, Session, SessionManager};
use crate::{ControllerError, DispatchReport, Result};
use array_link::ChannelState;
use array_proto::CommandBatch;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Render one progress event as a terminal line
pub fn render_event(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::PortOpened { index, address } => {
            format!("Serial Port {} {} {}", index, address, "OPENED".green())
        }
        ProgressEvent::PortFailed {
            index,
            address,
            reason,
        } => format!(
            "Serial Port {} {} {} ({})",
            index,
            address,
            "UNAVAILABLE".red().bold(),
            reason
        ),
        ProgressEvent::ArrayReady { index } => {
            format!("Array: {} {}", index, "READY".green().bold())
        }
        ProgressEvent::HandshakeFailed { index, reason } => {
            format!("Array: {} {} ({})", index, "NOT READY".red().bold(), reason)
        }
        ProgressEvent::CommandSent { index } => {
            format!("{} Array: {} {}", "-> ->".cyan(), index, "SENT".cyan())
        }
        ProgressEvent::ReplyReceived { index, reply } => {
            format!("{} Array: {} {}", "<- <-".green(), index, reply)
        }
        ProgressEvent::DispatchFailed { index, reason } => {
            format!("{} Array: {} {}", "<- <-".red(), index, reason.red())
        }
        ProgressEvent::PortClosed { index, address } => {
            format!("Serial Port {} {} {}", index, address, "CLOSED".yellow())
        }
        ProgressEvent::CloseFailed {
            index,
            address,
            reason,
        } => format!(
            "Serial Port {} {} {} ({})",
            index,
            address,
            "CLOSE FAILED".red().bold(),
            reason
        ),
    }
}

/// Dispatch a single command line on a fresh session and close it again
///
/// Fails if startup fails, any array does not reply, or any port does not
/// close cleanly.
pub async fn run_once(manager: &SessionManager, line: &str) -> Result<DispatchReport> {
    let batch = CommandBatch::parse(line, manager.config().ports.len(), &manager.config().markers())?;

    let mut session = manager.start().await?;
    let dispatched = session.dispatch(&batch).await;
    let closed = session.close().await.into_result();
    manager.reporter().flush().await;

    let report = dispatched?;
    closed?;

    if let Some(failed) = report.failures().next() {
        return Err(ControllerError::ReplyFailure {
            index: failed.index,
            reason: failed
                .result
                .as_ref()
                .err()
                .map(ToString::to_string)
                .unwrap_or_default(),
        });
    }

    Ok(report)
}

/// Interactive shell
pub struct Shell {
    /// Session factory
    manager: SessionManager,

    /// Readline editor
    editor: DefaultEditor,
}

impl Shell {
    /// Create a new shell
    pub fn new(manager: SessionManager) -> Result<Self> {
        let editor = DefaultEditor::new().map_err(|e| ControllerError::Repl(e.to_string()))?;

        Ok(Self { manager, editor })
    }

    /// Run the shell until the operator exits
    pub async fn run(&mut self) -> Result<()> {
        println!("{}", "Array Controller".bold().green());

        let Some(mut session) = self.startup().await? else {
            println!("Goodbye!");
            return Ok(());
        };

        let outcome = self.command_loop(&mut session).await;

        if session.state() != crate::SessionState::Closed {
            self.close(&mut session).await;
        }

        outcome
    }

    /// Keep offering startup until a session is ready or the operator quits
    async fn startup(&mut self) -> Result<Option<Session>> {
        loop {
            let prompt = "\nPress Enter to start or type 'exit' to quit: ";

            match self.editor.readline(prompt) {
                Ok(line) => {
                    if is_exit(line.trim()) {
                        return Ok(None);
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(None),
                Err(err) => {
                    error!("Readline error: {:?}", err);
                    return Err(ControllerError::Repl(err.to_string()));
                }
            }

            println!("\nOpening ports");
            let started = self.manager.start().await;
            self.manager.reporter().flush().await;

            match started {
                Ok(session) => {
                    println!("{}", "All arrays ready".green().bold());
                    return Ok(Some(session));
                }
                Err(e) => {
                    eprintln!("{} {}", "Startup failed:".red().bold(), e);
                    if e.is_retryable() {
                        println!("Check the connections and try again");
                    }
                }
            }
        }
    }

    async fn command_loop(&mut self, session: &mut Session) -> Result<()> {
        println!("Type 'help' for commands, 'exit' to quit");

        loop {
            let prompt = "arrays> ".cyan().to_string();

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();

                    if line.is_empty() {
                        continue;
                    }

                    let _ = self.editor.add_history_entry(line);

                    match line {
                        line if is_exit(line) => {
                            self.close(session).await;
                            println!("Goodbye!");
                            return Ok(());
                        }
                        "help" => print_help(session.channel_count()),
                        "status" => print_status(session),
                        "clear" => print!("\x1B[2J\x1B[1;1H"),
                        _ => {
                            if let Err(e) = self.dispatch_line(session, line).await {
                                eprintln!("{} {}", "Error:".red().bold(), e);
                            }
                        }
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("^D");
                    return Ok(());
                }
                Err(err) => {
                    error!("Readline error: {:?}", err);
                    return Err(ControllerError::Repl(err.to_string()));
                }
            }
        }
    }

    /// Parse and dispatch one operator line; Ctrl-C abandons the replies
    async fn dispatch_line(&self, session: &mut Session, line: &str) -> Result<()> {
        let batch = CommandBatch::parse(
            line,
            session.channel_count(),
            &self.manager.config().markers(),
        )?;

        debug!(session_id = %session.id, commands = batch.len(), "Dispatching operator line");
        println!("===========");

        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let result = session.dispatch_until(&batch, &cancel).await;
        watcher.abort();
        self.manager.reporter().flush().await;

        let report = result?;
        if cancel.is_cancelled() {
            println!("{}", "Dispatch cancelled".yellow());
        }
        if !report.all_replied() {
            println!(
                "{} of {} arrays did not reply",
                report.failures().count(),
                report.replies.len()
            );
        }
        Ok(())
    }

    async fn close(&self, session: &mut Session) {
        println!("\nClosing ports");
        let report = session.close().await;
        self.manager.reporter().flush().await;
        print_close_report(&report);
    }
}

fn is_exit(line: &str) -> bool {
    matches!(line, "exit" | "Exit" | "quit")
}

fn print_help(arrays: usize) {
    println!("{}", "Available commands:".bold());
    println!("  help          - Show this help message");
    println!("  status        - Show array states");
    println!("  clear         - Clear screen");
    println!("  exit, quit    - Close the ports and exit");
    println!(
        "\nAnything else is sent to the arrays: {} numeric commands separated by ';'.",
        arrays
    );
}

fn print_status(session: &Session) {
    println!("{} {}", "Session:".bold(), session.id_string());
    for (index, (address, state)) in session.channel_states().iter().enumerate() {
        let state = match state {
            ChannelState::Ready => "Ready".green().bold(),
            ChannelState::Open => "Open".yellow(),
            ChannelState::Unopened => "Unopened".normal(),
            ChannelState::Failed => "Failed".red().bold(),
            ChannelState::Closed => "Closed".normal(),
        };
        println!("  Array {} {}: {}", index, address, state);
    }
}

fn print_close_report(report: &CloseReport) {
    if report.is_clean() {
        println!("{}", "All ports closed".green());
        return;
    }

    for failure in report.failures() {
        if let Err(e) = &failure.result {
            eprintln!(
                "{} Array {} {}: {}",
                "Close failed:".red().bold(),
                failure.index,
                failure.address,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControllerConfig, Reporter};
    use array_link::{ArrayAddress, MockOpener};
    use std::sync::Arc;

    #[test]
    fn test_render_event() {
        colored::control::set_override(false);

        assert_eq!(
            render_event(&ProgressEvent::PortOpened {
                index: 0,
                address: ArrayAddress::new("/dev/ttyUSB0"),
            }),
            "Serial Port 0 /dev/ttyUSB0 OPENED"
        );
        assert_eq!(
            render_event(&ProgressEvent::CommandSent { index: 1 }),
            "-> -> Array: 1 SENT"
        );
        assert_eq!(
            render_event(&ProgressEvent::ReplyReceived {
                index: 1,
                reply: "done:5".to_string(),
            }),
            "<- <- Array: 1 done:5"
        );
    }

    #[test]
    fn test_is_exit() {
        assert!(is_exit("exit"));
        assert!(is_exit("Exit"));
        assert!(!is_exit(""));
        assert!(!is_exit("3"));
    }

    #[tokio::test]
    async fn test_run_once() {
        let (opener, mut devices) = MockOpener::with_devices(2);
        let config = ControllerConfig::for_ports(devices.iter().map(|d| d.address().clone()));
        let manager = SessionManager::new(config, Arc::new(opener), Reporter::disabled()).unwrap();

        let mut second = devices.pop().unwrap();
        let mut first = devices.pop().unwrap();
        let boards = tokio::spawn(async move {
            first.announce_ready().await.unwrap();
            second.announce_ready().await.unwrap();
            first.reply_with(|c| format!("done:{}", c)).await.unwrap();
            second.reply_with(|c| format!("done:{}", c)).await.unwrap();
            (first, second)
        });

        let report = run_once(&manager, "3;5").await.unwrap();
        let _boards = boards.await.unwrap();

        assert_eq!(report.reply(0), Some("done:3"));
        assert_eq!(report.reply(1), Some("done:5"));
    }

    #[tokio::test]
    async fn test_run_once_reports_missing_reply() {
        let (opener, mut devices) = MockOpener::with_devices(2);
        let mut config = ControllerConfig::for_ports(devices.iter().map(|d| d.address().clone()));
        config.reply_timeout_ms = 100;
        let manager = SessionManager::new(config, Arc::new(opener), Reporter::disabled()).unwrap();

        let mut silent = devices.pop().unwrap();
        let mut first = devices.pop().unwrap();
        let boards = tokio::spawn(async move {
            first.announce_ready().await.unwrap();
            silent.announce_ready().await.unwrap();
            first.reply_with(|c| format!("done:{}", c)).await.unwrap();
            silent.read_command().await.unwrap();
            (first, silent)
        });

        let error = run_once(&manager, "3;5").await.unwrap_err();
        let _boards = boards.await.unwrap();

        assert!(matches!(error, ControllerError::ReplyFailure { index: 1, .. }));
        assert!(error.to_string().starts_with("Array 1 did not reply"));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_run_once_rejects_bad_input() {
        let (opener, devices) = MockOpener::with_devices(2);
        let config = ControllerConfig::for_ports(devices.iter().map(|d| d.address().clone()));
        let manager = SessionManager::new(config, Arc::new(opener), Reporter::disabled()).unwrap();

        assert!(matches!(
            run_once(&manager, "3").await,
            Err(ControllerError::Protocol(_))
        ));
    }
}
