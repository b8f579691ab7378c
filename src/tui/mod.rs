use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossterm::{
    cursor::Show,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout},
    style::{Color, Style},
    widgets::Paragraph,
    Frame, Terminal,
};
use ratatui_image::{picker::Picker, protocol::StatefulProtocol, StatefulImage};
use tracing::{error, info, warn};

use deskcast::screen::{viewer::to_dynamic_image, TerminalDisplay};
use deskcast::session::Viewer;

/// The terminal state changes the viewer makes and must undo.
trait TerminalModes {
    fn enter_raw(&mut self) -> io::Result<()>;
    fn leave_raw(&mut self) -> io::Result<()>;
    fn enter_alternate(&mut self) -> io::Result<()>;
    fn leave_alternate(&mut self) -> io::Result<()>;
}

struct Crossterm;

impl TerminalModes for Crossterm {
    fn enter_raw(&mut self) -> io::Result<()> {
        enable_raw_mode()
    }

    fn leave_raw(&mut self) -> io::Result<()> {
        disable_raw_mode()
    }

    fn enter_alternate(&mut self) -> io::Result<()> {
        execute!(io::stdout(), EnterAlternateScreen)
    }

    fn leave_alternate(&mut self) -> io::Result<()> {
        execute!(io::stdout(), LeaveAlternateScreen, Show)
    }
}

/// Restores whatever part of the terminal setup succeeded, on every exit path.
struct TerminalGuard<M: TerminalModes> {
    modes: M,
    raw: bool,
    alternate: bool,
}

impl<M: TerminalModes> TerminalGuard<M> {
    fn enter(modes: M) -> io::Result<Self> {
        let mut guard = Self {
            modes,
            raw: false,
            alternate: false,
        };
        guard.modes.enter_raw()?;
        guard.raw = true;
        guard.modes.enter_alternate()?;
        guard.alternate = true;
        Ok(guard)
    }
}

impl<M: TerminalModes> Drop for TerminalGuard<M> {
    fn drop(&mut self) {
        if self.alternate {
            if let Err(e) = self.modes.leave_alternate() {
                warn!("cannot leave alternate screen: {e}");
            }
        }
        if self.raw {
            if let Err(e) = self.modes.leave_raw() {
                warn!("cannot leave raw mode: {e}");
            }
        }
    }
}

/// Full-screen terminal viewer around a [`Viewer`].
pub struct ViewerUi {
    display: Arc<TerminalDisplay>,
    picker: Picker,
    protocol: Option<StatefulProtocol>,
    status: String,
}

impl ViewerUi {
    /// `picker` must have been created before raw mode was entered.
    pub fn new(display: Arc<TerminalDisplay>, picker: Picker) -> Self {
        Self {
            display,
            picker,
            protocol: None,
            status: String::new(),
        }
    }

    pub async fn run(&mut self, viewer: &mut Viewer) -> Result<()> {
        let _guard = TerminalGuard::enter(Crossterm)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
        self.run_loop(&mut terminal, viewer).await
    }

    async fn run_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
        viewer: &mut Viewer,
    ) -> Result<()> {
        loop {
            if let Some(image) = self.display.take_latest().and_then(to_dynamic_image) {
                self.protocol = Some(self.picker.new_resize_protocol(image));
            }

            let status = status_line(
                &viewer.endpoint().to_string(),
                viewer.is_connected(),
                self.display.presented(),
                &self.status,
            );
            terminal.draw(|f| self.draw(f, &status))?;

            if !event::poll(Duration::from_millis(50))? {
                continue;
            }
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
                KeyCode::Char('r') => {
                    self.status = "reconnecting...".to_string();
                    terminal.draw(|f| self.draw(f, "reconnecting..."))?;
                    match viewer.reconnect().await {
                        Ok(()) => {
                            info!("reconnected to {}", viewer.endpoint());
                            self.status.clear();
                        }
                        Err(e) => {
                            error!("reconnect failed: {e}");
                            self.status = format!("reconnect failed: {e}");
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn draw(&mut self, f: &mut Frame, status: &str) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(1)])
            .split(f.area());

        // No block or border around the image: ratatui would clear the area
        // every frame, which flickers with Sixel/Kitty.
        if let Some(protocol) = self.protocol.as_mut() {
            f.render_stateful_widget(StatefulImage::default(), chunks[0], protocol);
        } else {
            let waiting = Paragraph::new("waiting for frames...")
                .style(Style::default().fg(Color::DarkGray))
                .alignment(Alignment::Center);
            f.render_widget(waiting, chunks[0]);
        }

        let bar = Paragraph::new(status.to_string()).style(Style::default().fg(Color::Black).bg(Color::Gray));
        f.render_widget(bar, chunks[1]);
    }
}

fn status_line(endpoint: &str, connected: bool, frames: u64, note: &str) -> String {
    let state = if connected { "connected" } else { "disconnected" };
    let mut line = format!(" {endpoint} | {state} | {frames} frames | q quit  r reconnect");
    if !note.is_empty() {
        line.push_str(" | ");
        line.push_str(note);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FakeModes {
        calls: Rc<RefCell<Vec<&'static str>>>,
        fail_alternate: bool,
    }

    impl TerminalModes for FakeModes {
        fn enter_raw(&mut self) -> io::Result<()> {
            self.calls.borrow_mut().push("enter_raw");
            Ok(())
        }

        fn leave_raw(&mut self) -> io::Result<()> {
            self.calls.borrow_mut().push("leave_raw");
            Ok(())
        }

        fn enter_alternate(&mut self) -> io::Result<()> {
            self.calls.borrow_mut().push("enter_alternate");
            if self.fail_alternate {
                return Err(io::Error::other("not a tty"));
            }
            Ok(())
        }

        fn leave_alternate(&mut self) -> io::Result<()> {
            self.calls.borrow_mut().push("leave_alternate");
            Ok(())
        }
    }

    #[test]
    fn failed_setup_still_leaves_raw_mode() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let modes = FakeModes {
            calls: calls.clone(),
            fail_alternate: true,
        };
        assert!(TerminalGuard::enter(modes).is_err());
        assert_eq!(*calls.borrow(), ["enter_raw", "enter_alternate", "leave_raw"]);
    }

    #[test]
    fn guard_restores_in_reverse_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let modes = FakeModes {
            calls: calls.clone(),
            fail_alternate: false,
        };
        let guard = TerminalGuard::enter(modes).unwrap();
        assert_eq!(calls.borrow().len(), 2);
        drop(guard);
        assert_eq!(
            *calls.borrow(),
            ["enter_raw", "enter_alternate", "leave_alternate", "leave_raw"]
        );
    }

    #[test]
    fn status_line_shows_state_and_note() {
        let line = status_line("10.0.0.7:5555", true, 42, "");
        assert!(line.contains("10.0.0.7:5555"));
        assert!(line.contains("connected"));
        assert!(line.contains("42 frames"));

        let line = status_line("h:1", false, 0, "reconnect failed: boom");
        assert!(line.contains("disconnected"));
        assert!(line.ends_with("reconnect failed: boom"));
    }
}
