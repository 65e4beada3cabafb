//! Optional status-UI child process.
//!
//! The UI is a separate program fed `K=V` lines on stdin, `K` being `M`
//! (main message) or `S` (subtitle). Its absence must never affect the
//! authentication outcome.

use std::io::Write;
use std::process::{Child, Command, Stdio};

const UI_BINARY: &str = "gaze-ui";

pub struct StatusUi {
    child: Option<Child>,
    last_message: String,
}

impl StatusUi {
    /// Start the status UI if it is installed; a missing binary is the
    /// normal headless case.
    pub fn spawn() -> Self {
        Self::spawn_command(Command::new(UI_BINARY).arg("--auth"))
    }

    fn spawn_command(command: &mut Command) -> Self {
        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match child {
            Ok(child) => Self {
                child: Some(child),
                last_message: String::new(),
            },
            Err(e) => {
                tracing::debug!(error = %e, "no status UI available");
                Self {
                    child: None,
                    last_message: String::new(),
                }
            }
        }
    }

    /// Main message line. Repeats of the current message are suppressed.
    pub fn show_message(&mut self, text: &str) {
        if self.last_message == text {
            return;
        }
        self.last_message = text.to_string();
        self.send('M', text);
    }

    /// Subtitle line (progress detail).
    pub fn show_subtitle(&mut self, text: &str) {
        self.send('S', text);
    }

    fn send(&mut self, key: char, text: &str) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let Some(stdin) = child.stdin.as_mut() else {
            return;
        };
        if writeln!(stdin, "{key}={text}").and_then(|()| stdin.flush()).is_err() {
            // UI process went away mid-session; keep authenticating.
            tracing::debug!("status UI pipe closed");
            self.child = None;
        }
    }
}

impl Drop for StatusUi {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ui_binary_is_non_fatal() {
        let mut ui =
            StatusUi::spawn_command(&mut Command::new("gaze-ui-definitely-not-installed"));
        // Sends are no-ops, not panics.
        ui.show_message("Identifying you...");
        ui.show_subtitle("Scanned 3 frames");
    }

    #[test]
    fn lines_reach_the_child_in_kv_form() {
        // `cat` stands in for the UI; we only need the pipe to accept writes.
        let mut ui = StatusUi::spawn_command(&mut Command::new("cat"));
        assert!(ui.child.is_some());
        ui.show_message("Identifying you...");
        ui.show_message("Identifying you..."); // deduplicated
        ui.show_subtitle("Scanned 5 frames");
    }
}
