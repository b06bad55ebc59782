//! Output reading logic for subprocess transport

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead, LinesCodec, LinesCodecError};

use super::config::{OutputFraming, ReadEvent};
use super::transport::SubprocessTransport;

impl SubprocessTransport {
    /// Read the subprocess output
    ///
    /// Spawns a background task that frames stdout and forwards every frame.
    /// After stdout closes the task waits for the exit watcher and sends a
    /// final [`ReadEvent::Exited`]. Calling this twice yields a receiver that
    /// only reports the exit.
    pub(super) fn read_output_impl(
        &mut self,
        framing: OutputFraming,
    ) -> mpsc::UnboundedReceiver<ReadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let stdout = self.stdout.take();
        let exit_rx = self.exit_rx.clone();
        let label = self.spec.label.clone();

        let task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                match framing {
                    OutputFraming::Lines { max_length } => {
                        let mut frames =
                            FramedRead::new(stdout, LinesCodec::new_with_max_length(max_length));
                        let mut skipped = false;
                        loop {
                            match frames.next().await {
                                Some(Ok(line)) => {
                                    skipped = false;
                                    if tx.send(ReadEvent::Line(line)).is_err() {
                                        return;
                                    }
                                }
                                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                                    log::warn!(
                                        "[{label}] dropped stdout line longer than {max_length} bytes"
                                    );
                                    skipped = true;
                                }
                                Some(Err(LinesCodecError::Io(e))) => {
                                    log::warn!("[{label}] stdout read failed: {e}");
                                    break;
                                }
                                // A decode error is followed by one `None`; reading resumes after it
                                None if skipped => skipped = false,
                                None => break,
                            }
                        }
                    }
                    OutputFraming::Chunks => {
                        let mut frames = FramedRead::new(stdout, BytesCodec::new());
                        let mut decoder = Utf8Carry::default();
                        while let Some(frame) = frames.next().await {
                            match frame {
                                Ok(bytes) => {
                                    let chunk = decoder.decode(&bytes);
                                    if !chunk.is_empty() && tx.send(ReadEvent::Chunk(chunk)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("[{label}] stdout read failed: {e}");
                                    break;
                                }
                            }
                        }
                        let rest = decoder.finish();
                        if !rest.is_empty() && tx.send(ReadEvent::Chunk(rest)).is_err() {
                            return;
                        }
                    }
                }
            }

            let code = match exit_rx {
                Some(mut exit_rx) => exit_rx
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|state| (*state).flatten()),
                None => None,
            };
            let _ = tx.send(ReadEvent::Exited { code });
        });

        if let Some(previous) = self.reader_task.replace(task) {
            previous.abort();
        }

        rx
    }
}

/// UTF-8 decoding across read boundaries
///
/// An incomplete sequence at the end of a chunk is held back and completed
/// by the next one. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Whatever is still held when the stream ends
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
