mod format;

use format::{BinarySize, ClockDuration, HumanDuration};

use std::{
    collections::VecDeque,
    io::Write,
    time::{Duration, Instant},
};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    QueueableCommand,
    Result,
    style::{Print, Stylize},
    terminal::{self, Clear, ClearType},
    tty::IsTty,
};

/// Window over which the transfer speed is averaged.
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Marks where the bar goes in an interactive frame.
const BAR_PLACEHOLDER: char = '\x00';

/// Moving average of progress per second over a sliding window of time.
#[derive(Debug)]
pub struct ProgressSpeed {
    window: Duration,
    /// (timestamp, position) samples, oldest first
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressSpeed {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record the current position.
    pub fn record_value(&mut self, value: u64) {
        let now = Instant::now();
        self.samples.push_back((now, value));

        // Keep one sample older than the window so the average spans all of it
        while self.samples.len() > 2
            && now.duration_since(self.samples[1].0) >= self.window
        {
            self.samples.pop_front();
        }
    }

    /// Average units per second over the window.
    pub fn units_per_sec(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) if last.0 > first.0 => {
                last.1.saturating_sub(first.1) as f64 / (last.0 - first.0).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

/// Progress bar for byte transfers. When the total size is known, the elapsed
/// time, position, percentage, average speed, and ETA are shown. Otherwise,
/// only the elapsed time, position, and speed are shown.
pub struct ProgressBar<T: Write + IsTty> {
    /// Total size, if known
    len: Option<u64>,
    pos: u64,
    term: T,
    mode: ProgressDrawMode,
    /// Maximum rendering rate. Zero disables rate limiting.
    fps: f64,
    last_draw: Option<Instant>,
    started: Instant,
    speed: ProgressSpeed,
}

/// How the progress bar should be drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressDrawMode {
    /// Redraw the same line on every frame. Used for interactive terminals.
    Interactive,
    /// Append a new line on every frame. Used when output is redirected or
    /// interleaved with log messages.
    Append,
    /// Draw nothing.
    None,
}

impl ProgressDrawMode {
    fn for_term(term: &impl IsTty) -> Self {
        if term.is_tty() {
            Self::Interactive
        } else {
            Self::Append
        }
    }

    fn default_fps(self) -> f64 {
        match self {
            Self::Interactive => 15.0,
            Self::Append => 0.2,
            Self::None => 0.0,
        }
    }
}

impl<T: Write + IsTty> ProgressBar<T> {
    /// Create a progress bar for a transfer of `len` bytes, or of unknown
    /// size if `len` is `None`. The draw mode is picked based on whether
    /// `term` is a terminal.
    pub fn new(term: T, len: Option<u64>) -> Self {
        let mode = ProgressDrawMode::for_term(&term);

        Self {
            len,
            pos: 0,
            term,
            mode,
            fps: mode.default_fps(),
            last_draw: None,
            started: Instant::now(),
            speed: ProgressSpeed::new(SPEED_WINDOW),
        }
    }

    pub fn mode(&self) -> ProgressDrawMode {
        self.mode
    }

    /// Set the draw mode, or pick one based on the terminal if `mode` is
    /// `None`. This resets the frame rate to the mode's default.
    pub fn set_mode(&mut self, mode: Option<ProgressDrawMode>) {
        self.mode = mode.unwrap_or_else(|| ProgressDrawMode::for_term(&self.term));
        self.fps = self.mode.default_fps();
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    pub fn length(&self) -> Option<u64> {
        self.len
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Set the position and redraw immediately.
    pub fn set_position(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        self.speed.record_value(pos);
        self.draw(true)
    }

    /// Advance the position and redraw, subject to the frame rate.
    pub fn advance(&mut self, delta: u64) -> Result<()> {
        self.pos = self.pos.saturating_add(delta);
        self.speed.record_value(self.pos);
        self.draw(false)
    }

    /// Print a line above the progress bar.
    pub fn println(&mut self, msg: impl Into<String>) -> Result<()> {
        match self.mode {
            ProgressDrawMode::None => Ok(()),
            ProgressDrawMode::Append => {
                self.term
                    .queue(Print(msg.into()))?
                    .queue(Print('\n'))?
                    .flush()?;
                Ok(())
            }
            ProgressDrawMode::Interactive => {
                self.term
                    .queue(Clear(ClearType::CurrentLine))?
                    .queue(MoveToColumn(0))?
                    .queue(Print(msg.into()))?
                    .queue(Print('\n'))?;
                self.draw(true)
            }
        }
    }

    /// Finish the progress bar. In interactive mode, the last frame is kept
    /// on screen. In append mode, a final frame is printed. This is called
    /// automatically when the progress bar is dropped.
    pub fn finish(&mut self) -> Result<()> {
        match self.mode {
            ProgressDrawMode::Interactive => {
                if self.last_draw.is_some() {
                    self.term.queue(Print('\n'))?;
                }
                self.term
                    .queue(Show)?
                    .flush()?;
                self.mode = ProgressDrawMode::None;
            }
            ProgressDrawMode::Append => {
                self.draw(true)?;
                self.mode = ProgressDrawMode::None;
            }
            ProgressDrawMode::None => {}
        }
        Ok(())
    }

    /// Draw a frame. Unless `force` is true, nothing is drawn if the previous
    /// frame was drawn too recently.
    pub fn draw(&mut self, force: bool) -> Result<()> {
        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        if let (false, Some(last_draw)) = (force, self.last_draw) {
            if self.fps > 0.0 && last_draw.elapsed() < Duration::from_secs_f64(1.0 / self.fps) {
                return Ok(());
            }
        }

        let frame = match self.mode {
            ProgressDrawMode::Interactive => {
                let width = terminal::size().map(|s| s.0 as usize).unwrap_or(80);
                self.render_bar(self.render(true), width)
            }
            _ => self.render(false) + "\n",
        };

        if self.mode == ProgressDrawMode::Interactive {
            self.term
                .queue(Hide)?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?;
        }

        self.term
            .queue(Print(frame))?
            .flush()?;

        self.last_draw = Some(Instant::now());

        Ok(())
    }

    /// Render the text of a frame. If `with_bar` is true and the length is
    /// known, a placeholder for the bar is inserted before the percentage.
    fn render(&self, with_bar: bool) -> String {
        let elapsed = ClockDuration(self.started.elapsed());
        let speed = BinarySize(self.speed());

        match self.len {
            Some(len) => format!(
                "[{elapsed}] {bar}{percent:.0}% {pos}/{len} ({speed}/s, {eta})",
                bar = if with_bar { BAR_PLACEHOLDER.to_string() } else { String::new() },
                percent = self.ratio().unwrap_or(0.0) * 100.0,
                pos = BinarySize(self.pos),
                len = BinarySize(len),
                eta = HumanDuration(self.eta().unwrap_or_default()),
            ),
            None => format!(
                "[{elapsed}] {pos} ({speed}/s)",
                pos = BinarySize(self.pos),
            ),
        }
    }

    /// Replace the bar placeholder with a bar filling the remaining width.
    fn render_bar(&self, text: String, width: usize) -> String {
        let Some(ratio) = self.ratio() else {
            return text;
        };

        // The placeholder's own column is taken by the trailing space
        let bar_width = width.saturating_sub(text.chars().count());
        if bar_width == 0 {
            return text.replace(BAR_PLACEHOLDER, "");
        }

        let filled = (ratio * bar_width as f64).round() as usize;
        let bar = format!(
            "{}{} ",
            "#".repeat(filled).cyan(),
            "-".repeat(bar_width - filled).blue(),
        );

        text.replace(BAR_PLACEHOLDER, &bar)
    }

    fn ratio(&self) -> Option<f64> {
        match self.len {
            Some(0) => Some(1.0),
            Some(len) => Some((self.pos as f64 / len as f64).clamp(0.0, 1.0)),
            None => None,
        }
    }

    fn eta(&self) -> Option<Duration> {
        let remaining = self.len?.saturating_sub(self.pos);
        let speed = self.speed.units_per_sec();

        if speed > 0.0 {
            Duration::try_from_secs_f64(remaining as f64 / speed).ok()
        } else {
            None
        }
    }

    fn speed(&self) -> u64 {
        self.speed.units_per_sec() as u64
    }
}

impl<T: Write + IsTty> Drop for ProgressBar<T> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
