use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossterm::cursor::MoveToPreviousLine;
use crossterm::terminal::{Clear, ClearType};
use crossterm::QueueableCommand;

use mdr_runner::{render_snapshot, ProgressRegistry};

/// Redraws the registry snapshot in place until every job is terminal or
/// `done` is set, then draws once more.
pub fn run_live_view(
    registry: &ProgressRegistry,
    done: &AtomicBool,
    interval: Duration,
) -> io::Result<()> {
    draw_until_finished(&mut io::stdout(), registry, done, interval)
}

fn draw_until_finished<W: Write>(
    out: &mut W,
    registry: &ProgressRegistry,
    done: &AtomicBool,
    interval: Duration,
) -> io::Result<()> {
    let mut drawn = 0;
    loop {
        let finished = done.load(Ordering::SeqCst) || registry.all_terminal();
        let frame = render_snapshot(&registry.snapshot_all());
        drawn = redraw(out, &frame, drawn)?;
        if finished {
            return Ok(());
        }
        thread::sleep(interval);
    }
}

/// Replaces the previous `previous_lines` lines with `frame`; returns its line count.
pub fn redraw<W: Write>(out: &mut W, frame: &str, previous_lines: u16) -> io::Result<u16> {
    if previous_lines > 0 {
        out.queue(MoveToPreviousLine(previous_lines))?;
    }
    out.queue(Clear(ClearType::FromCursorDown))?;
    out.write_all(frame.as_bytes())?;
    out.flush()?;
    Ok(u16::try_from(frame.lines().count()).unwrap_or(u16::MAX))
}
