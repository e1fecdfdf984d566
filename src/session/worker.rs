//! Hand-off from blocking drivers to a session task
//!
//! A blocking reader runs on its own OS thread and never touches session
//! state. Each line is submitted to the session through a channel and the
//! thread waits until the session has taken it (submit-and-await).

use std::io::BufRead;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Lines buffered between the reader thread and the session
const HANDOFF_CAPACITY: usize = 1;

/// One line submitted by a blocking reader
#[derive(Debug)]
pub struct Handoff {
    pub line: String,
    processed: oneshot::Sender<()>,
}

impl Handoff {
    /// Release the reader thread to read the next line
    pub fn complete(self) {
        let _ = self.processed.send(());
    }
}

/// Start a reader thread over any blocking line source
///
/// The thread ends at EOF, on a read error, or once the receiving side is
/// dropped.
pub fn spawn_line_reader<R>(
    name: &str,
    reader: R,
) -> std::io::Result<mpsc::Receiver<Handoff>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    let thread_name = format!("{name}-reader");
    let device = name.to_string();

    thread::Builder::new().name(thread_name).spawn(move || {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(device = %device, "Blocking reader failed: {}", e);
                    break;
                }
            };

            let (processed, done) = oneshot::channel();
            if tx.blocking_send(Handoff { line, processed }).is_err() {
                break;
            }
            if done.blocking_recv().is_err() {
                break;
            }
        }
        debug!(device = %device, "Blocking reader stopped");
    })?;

    Ok(rx)
}
