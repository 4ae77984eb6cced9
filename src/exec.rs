//! Streaming execution of remote commands.
//!
//! A [`ShellChannel`] is polled without blocking; between empty polls the
//! task sleeps for the configured interval. Stdout and stderr are yielded in
//! the order they are drained, followed by exactly one [`ExecEvent::Exit`].
//! If the channel closes without an exit status the stream simply ends,
//! and [`run`] reports that as [`Completion::ConnectionLost`].

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{Stream, StreamExt};

use crate::backend::{ChannelStatus, RemoteInstance, ShellChannel};
use crate::error::SnapError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(String),
    Stderr(String),
    Exit(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Stdout,
    Stderr,
}

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exited(i32),
    ConnectionLost,
}

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub chunk_size: usize,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            chunk_size: 4096,
        }
    }
}

/// Incremental UTF-8 decoding that carries split code points over to the
/// next chunk instead of replacing them.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = match std::str::from_utf8(&self.pending) {
            Ok(_) => 0,
            // Incomplete sequence at the end: hold it back.
            Err(e) if e.error_len().is_none() => self.pending.len() - e.valid_up_to(),
            Err(_) => 0,
        };
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

struct PollState<Ch> {
    channel: Ch,
    options: PollOptions,
    queue: VecDeque<ExecEvent>,
    stdout: Utf8Carry,
    stderr: Utf8Carry,
    finished: bool,
}

impl<Ch: ShellChannel> PollState<Ch> {
    fn drain(&mut self) {
        while let Some(data) = self.channel.recv_stdout(self.options.chunk_size) {
            if data.is_empty() {
                break;
            }
            let text = self.stdout.decode(&data);
            if !text.is_empty() {
                self.queue.push_back(ExecEvent::Stdout(text));
            }
        }
        while let Some(data) = self.channel.recv_stderr(self.options.chunk_size) {
            if data.is_empty() {
                break;
            }
            let text = self.stderr.decode(&data);
            if !text.is_empty() {
                self.queue.push_back(ExecEvent::Stderr(text));
            }
        }
    }

    fn finish(&mut self, exit: Option<i32>) {
        self.drain();
        if let Some(text) = self.stdout.flush() {
            self.queue.push_back(ExecEvent::Stdout(text));
        }
        if let Some(text) = self.stderr.flush() {
            self.queue.push_back(ExecEvent::Stderr(text));
        }
        if let Some(code) = exit {
            self.queue.push_back(ExecEvent::Exit(code));
        }
        self.finished = true;
    }
}

/// Lazily poll `channel` until the remote process exits.
pub fn stream<Ch: ShellChannel>(channel: Ch, options: PollOptions) -> impl Stream<Item = ExecEvent> {
    let state = PollState {
        channel,
        options,
        queue: VecDeque::new(),
        stdout: Utf8Carry::default(),
        stderr: Utf8Carry::default(),
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            state.drain();
            if !state.queue.is_empty() {
                continue;
            }
            match state.channel.status() {
                ChannelStatus::Running => tokio::time::sleep(state.options.interval).await,
                ChannelStatus::Exited(code) => state.finish(Some(code)),
                ChannelStatus::Closed => {
                    tracing::debug!("remote channel closed without exit status");
                    state.finish(None);
                }
            }
        }
    })
}

/// Execute `command` on `instance`, forwarding output as it arrives.
pub async fn run<I, F>(
    instance: &I,
    command: &str,
    options: PollOptions,
    mut on_output: F,
) -> Result<Completion, SnapError>
where
    I: RemoteInstance,
    F: FnMut(Output, &str),
{
    tracing::debug!(instance = %instance.id(), %command, "exec");
    let channel = instance.exec(command).await?;
    let events = stream(channel, options);
    futures_util::pin_mut!(events);

    while let Some(event) = events.next().await {
        match event {
            ExecEvent::Stdout(text) => on_output(Output::Stdout, &text),
            ExecEvent::Stderr(text) => on_output(Output::Stderr, &text),
            ExecEvent::Exit(code) => return Ok(Completion::Exited(code)),
        }
    }
    Ok(Completion::ConnectionLost)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Channel that reveals one scripted step per poll.
    struct Scripted {
        steps: VecDeque<Step>,
        out: VecDeque<Vec<u8>>,
        err: VecDeque<Vec<u8>>,
        status: ChannelStatus,
    }

    enum Step {
        Out(&'static [u8]),
        Err(&'static [u8]),
        Idle,
        Exit(i32),
        Close,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                out: VecDeque::new(),
                err: VecDeque::new(),
                status: ChannelStatus::Running,
            }
        }

        fn advance(&mut self) {
            match self.steps.pop_front() {
                Some(Step::Out(b)) => self.out.push_back(b.to_vec()),
                Some(Step::Err(b)) => self.err.push_back(b.to_vec()),
                Some(Step::Idle) | None => {}
                Some(Step::Exit(code)) => self.status = ChannelStatus::Exited(code),
                Some(Step::Close) => self.status = ChannelStatus::Closed,
            }
        }
    }

    impl ShellChannel for Scripted {
        fn recv_stdout(&mut self, _max: usize) -> Option<Vec<u8>> {
            self.out.pop_front()
        }

        fn recv_stderr(&mut self, _max: usize) -> Option<Vec<u8>> {
            self.err.pop_front()
        }

        fn status(&mut self) -> ChannelStatus {
            let status = self.status;
            self.advance();
            status
        }
    }

    fn fast() -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(1),
            chunk_size: 16,
        }
    }

    #[tokio::test]
    async fn interleaves_and_ends_with_exit() {
        let chan = Scripted::new(vec![
            Step::Out(b"one\n"),
            Step::Idle,
            Step::Err(b"warn\n"),
            Step::Out(b"two\n"),
            Step::Exit(0),
        ]);
        let events: Vec<ExecEvent> = stream(chan, fast()).collect().await;
        assert_eq!(
            events,
            vec![
                ExecEvent::Stdout("one\n".into()),
                ExecEvent::Stderr("warn\n".into()),
                ExecEvent::Stdout("two\n".into()),
                ExecEvent::Exit(0),
            ]
        );
    }

    #[tokio::test]
    async fn dropped_connection_has_no_exit() {
        let chan = Scripted::new(vec![Step::Out(b"partial"), Step::Close]);
        let events: Vec<ExecEvent> = stream(chan, fast()).collect().await;
        assert_eq!(events, vec![ExecEvent::Stdout("partial".into())]);
    }

    #[tokio::test]
    async fn split_code_points_are_rejoined() {
        let snowman = "☃".as_bytes();
        let chan = Scripted::new(vec![
            Step::Out(&[0xE2]),
            Step::Out(&[0x98, 0x83]),
            Step::Exit(0),
        ]);
        let events: Vec<ExecEvent> = stream(chan, fast()).collect().await;
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Stdout(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text.as_bytes(), snowman);
    }

    /// Reports an empty chunk on every read.
    struct EmptyReads;

    impl ShellChannel for EmptyReads {
        fn recv_stdout(&mut self, _max: usize) -> Option<Vec<u8>> {
            Some(Vec::new())
        }

        fn recv_stderr(&mut self, _max: usize) -> Option<Vec<u8>> {
            Some(Vec::new())
        }

        fn status(&mut self) -> ChannelStatus {
            ChannelStatus::Exited(0)
        }
    }

    #[tokio::test]
    async fn empty_chunks_count_as_nothing_ready() {
        let events: Vec<ExecEvent> = stream(EmptyReads, fast()).collect().await;
        assert_eq!(events, vec![ExecEvent::Exit(0)]);
    }

    #[test]
    fn carry_flushes_trailing_garbage() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(&[b'a', 0xE2]), "a");
        assert_eq!(carry.flush().as_deref(), Some("\u{FFFD}"));
        assert!(carry.flush().is_none());
    }
}
