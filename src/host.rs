//! Session Host
//!
//! Wires supervisor, router and controller together for a consumer, and
//! the terminal front end used by the `tabstream` binary.

use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::config::{OutputFormat, PipelineConfig};
use crate::controller::CancellationController;
use crate::error::PipelineResult;
use crate::format::{SegmentKind, Style};
use crate::router::OutputRouter;
use crate::session::events::{ChannelSink, DisplayEvent, DisplayPayload, DisplaySink, NoticeLevel};
use crate::session::manager::{CancelOutcome, SessionError, SessionSupervisor};
use crate::session::state::SessionInfo;

/// Everything a display consumer needs to drive sessions
pub struct SessionHost {
    supervisor: Arc<SessionSupervisor>,
    controller: CancellationController,
}

impl SessionHost {
    pub fn new(config: &PipelineConfig, sink: Arc<dyn DisplaySink>) -> Self {
        let router = Arc::new(OutputRouter::new(config, sink));
        let supervisor = Arc::new(SessionSupervisor::new(config, router));
        let controller = CancellationController::new(Arc::clone(&supervisor));
        Self {
            supervisor,
            controller,
        }
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// Open a tab
    pub async fn open(
        &self,
        session_id: &str,
        working_directory: impl Into<PathBuf>,
        env: Vec<(String, String)>,
    ) -> Result<SessionInfo, SessionError> {
        self.supervisor
            .create_session(session_id, working_directory, env)
            .await
    }

    pub async fn send(&self, session_id: &str, text: &str) -> Result<bool, SessionError> {
        self.supervisor.send_input(session_id, text).await
    }

    /// No more input for this tab: let the agent finish and drain its output
    pub async fn end_input(&self, session_id: &str, wait: Duration) -> Result<bool, SessionError> {
        self.supervisor.end_input(session_id, wait).await
    }

    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome, SessionError> {
        self.controller.cancel(session_id).await
    }

    pub fn skip(&self, session_id: &str) -> PipelineResult<usize> {
        self.controller.skip(session_id)
    }

    /// Close a tab
    pub async fn close(&self, session_id: &str) -> bool {
        self.supervisor.destroy_session(session_id).await
    }

    /// Terminate every session; returns once no agent process is left
    pub async fn shutdown(&self) {
        self.supervisor.teardown_all().await;
    }
}

/// A line typed at the terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand<'a> {
    Cancel,
    Skip,
    Quit,
    Input(&'a str),
}

impl<'a> HostCommand<'a> {
    pub fn parse(line: &'a str) -> Self {
        match line.trim() {
            ":cancel" => Self::Cancel,
            ":skip" => Self::Skip,
            ":quit" | ":q" => Self::Quit,
            _ => Self::Input(line),
        }
    }
}

const RESET: &str = "\x1b[0m";

/// How long an agent gets to finish after stdin reaches EOF
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the renderer gets to write what is left after teardown
const RENDER_TIMEOUT: Duration = Duration::from_secs(2);

fn ansi_code(style: &Style) -> Option<&'static str> {
    match style {
        Style::Plain | Style::Identifier | Style::Punctuation => None,
        Style::Heading { level: 1 } => Some("1;4"),
        Style::Heading { .. } | Style::Bold => Some("1"),
        Style::Italic => Some("3"),
        Style::BoldItalic => Some("1;3"),
        Style::Code => Some("36"),
        Style::Bullet | Style::Number => Some("33"),
        Style::Path => Some("4;34"),
        Style::Keyword => Some("35"),
        Style::String => Some("32"),
        Style::Comment => Some("2"),
        Style::Stderr => Some("31"),
    }
}

/// Render a display event as ANSI-styled terminal text
pub fn render_event(event: &DisplayEvent) -> String {
    match &event.payload {
        DisplayPayload::Text(text) => text.clone(),
        DisplayPayload::StyledSegment(segment) => {
            let mut out = String::new();
            if let SegmentKind::CodeBlock {
                language: Some(language),
                ..
            } = &segment.kind
            {
                out.push_str(&format!("\x1b[2m[{}]{}\n", language, RESET));
            }
            for span in &segment.spans {
                match ansi_code(&span.style) {
                    Some(code) => out.push_str(&format!("\x1b[{}m{}{}", code, span.text, RESET)),
                    None => out.push_str(&span.text),
                }
            }
            out
        }
        DisplayPayload::Notice(notice) => {
            let color = match notice.level {
                NoticeLevel::Info => "36",
                NoticeLevel::Warning => "33",
                NoticeLevel::Error => "1;31",
            };
            let mut out = format!("\x1b[{}m[{}]{}\n", color, notice.message, RESET);
            if let Some(remedy) = &notice.remedy {
                out.push_str(&format!("\x1b[2m{}{}\n", remedy, RESET));
            }
            out
        }
    }
}

/// Render a display event as one line of JSON
pub fn render_json(event: &DisplayEvent) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// Terminal front end: one session in the current directory fed from stdin
pub async fn run_interactive(config: PipelineConfig) -> anyhow::Result<()> {
    let (sink, mut events) = ChannelSink::new();
    let host = SessionHost::new(&config, Arc::new(sink));
    let output = config.output;

    let mut renderer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events.recv().await {
            let rendered = match output {
                OutputFormat::Ansi => render_event(&event),
                OutputFormat::Json => match render_json(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to serialize display event: {}", e);
                        continue;
                    }
                },
            };
            if stdout.write_all(rendered.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let session_id = format!("tab-{}", Uuid::new_v4());
    let working_directory = std::env::current_dir()?;
    let result = drive(&host, &session_id, working_directory).await;

    if matches!(result, Ok(Ending::EndOfInput)) {
        match host.end_input(&session_id, DRAIN_TIMEOUT).await {
            Ok(exited) => debug!("Agent exited after end of input: {}", exited),
            Err(e) => debug!("Could not end input: {}", e),
        }
    }
    if let Err(e) = host.skip(&session_id) {
        debug!("Nothing left to show: {}", e);
    }
    host.shutdown().await;

    // The renderer stops once the last sink handle is gone
    drop(host);
    if tokio::time::timeout(RENDER_TIMEOUT, &mut renderer).await.is_err() {
        warn!("Renderer did not finish; dropping remaining output");
        renderer.abort();
    }
    info!("Host exited");
    result.map(|_| ())
}

/// Why the input loop stopped
enum Ending {
    EndOfInput,
    Quit,
}

async fn drive(
    host: &SessionHost,
    session_id: &str,
    working_directory: PathBuf,
) -> anyhow::Result<Ending> {
    host.open(session_id, working_directory, Vec::new()).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(Ending::EndOfInput);
                };
                match HostCommand::parse(&line) {
                    HostCommand::Quit => return Ok(Ending::Quit),
                    HostCommand::Cancel => {
                        // Failures already reached the user as a notice
                        let _ = host.cancel(session_id).await;
                    }
                    HostCommand::Skip => {
                        if let Err(e) = host.skip(session_id) {
                            warn!("Skip failed: {}", e);
                        }
                    }
                    HostCommand::Input(text) => {
                        host.send(session_id, text).await?;
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                let _ = host.cancel(session_id).await;
            }
        }
    }
}
