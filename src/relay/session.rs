use crate::relay::frame::{Frame, FrameDecoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection established, nothing read yet.
    Opened,
    Receiving,
    /// Terminal marker seen.
    Closed,
    Failed,
}

/// What the relay must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Forward this delta to the client.
    Delta(String),
    /// The completion finished normally.
    Closed,
    /// The turn failed; forward one error frame.
    Failed(String),
}

/// Per-turn streaming state: the accumulated text, the frame decoder and
/// the state machine. Knows nothing about transports; the relay feeds it
/// bytes and pulls steps.
#[derive(Debug)]
pub struct StreamSession {
    state: SessionState,
    decoder: FrameDecoder,
    accumulated: String,
    deltas: usize,
    error: Option<String>,
    failure_reported: bool,
    eof: bool,
    /// Set when a read overflowed the pending cap. The turn fails once the
    /// complete frames buffered before the overflow are handed out.
    overflow: Option<String>,
}

impl StreamSession {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            state: SessionState::Opened,
            decoder: FrameDecoder::new(max_pending_bytes),
            accumulated: String::new(),
            deltas: 0,
            error: None,
            failure_reported: false,
            eof: false,
            overflow: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Closed | SessionState::Failed)
    }

    /// Concatenation of every delta handed out so far.
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn delta_count(&self) -> usize {
        self.deltas
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Buffer a provider read. Ignored once the session is terminal.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.is_terminal() || self.overflow.is_some() {
            return;
        }
        self.state = SessionState::Receiving;
        if let Err(e) = self.decoder.push(bytes) {
            self.overflow = Some(e.to_string());
        }
    }

    /// The provider closed the connection.
    pub fn end_of_stream(&mut self) {
        self.eof = true;
        self.decoder.finish();
    }

    /// Move to FAILED unless already terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        if !self.is_terminal() {
            self.state = SessionState::Failed;
            self.error = Some(message.into());
        }
    }

    /// Pull the next step. `None` means more bytes are needed, or the
    /// session already reported its terminal step.
    pub fn next_step(&mut self) -> Option<Step> {
        if self.state == SessionState::Failed {
            if self.failure_reported {
                return None;
            }
            self.failure_reported = true;
            return Some(Step::Failed(self.error.clone().unwrap_or_default()));
        }
        if self.state == SessionState::Closed {
            return None;
        }

        loop {
            match self.decoder.next_frame() {
                Some(Ok(Frame::Delta(text))) => {
                    self.accumulated.push_str(&text);
                    self.deltas += 1;
                    return Some(Step::Delta(text));
                }
                Some(Ok(Frame::Done)) => {
                    self.state = SessionState::Closed;
                    return Some(Step::Closed);
                }
                Some(Ok(Frame::Error(message))) => {
                    self.fail(format!("provider error: {message}"));
                    return self.next_step();
                }
                Some(Err(e)) => {
                    tracing::warn!("Skipping malformed stream frame: {e}");
                }
                None if self.overflow.is_some() => {
                    let message = self.overflow.take().unwrap_or_default();
                    self.fail(message);
                    return self.next_step();
                }
                None if self.eof => {
                    self.fail("stream ended before completion");
                    return self.next_step();
                }
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(session: &mut StreamSession) -> Vec<Step> {
        let mut steps = Vec::new();
        while let Some(step) = session.next_step() {
            let terminal = !matches!(step, Step::Delta(_));
            steps.push(step);
            if terminal {
                break;
            }
        }
        steps
    }

    #[test]
    fn test_opened_until_first_read() {
        let mut session = StreamSession::new(1024);
        assert_eq!(session.state(), SessionState::Opened);
        assert!(session.next_step().is_none());
        session.feed(b"data: {\"content\":\"a\"}\n");
        assert_eq!(session.state(), SessionState::Receiving);
    }

    #[test]
    fn test_hi_then_done_closes() {
        let mut session = StreamSession::new(1024);
        session.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n");
        let steps = collect(&mut session);
        assert_eq!(steps, vec![Step::Delta("Hi".into()), Step::Closed]);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.text(), "Hi");
    }

    #[test]
    fn test_eof_without_marker_fails_and_keeps_partial() {
        let mut session = StreamSession::new(1024);
        session.feed(b"{\"message\":{\"content\":\"Hel\"},\"done\":false}\n");
        assert_eq!(session.next_step(), Some(Step::Delta("Hel".into())));
        assert_eq!(session.next_step(), None);
        session.end_of_stream();
        assert_eq!(
            session.next_step(),
            Some(Step::Failed("stream ended before completion".into()))
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.text(), "Hel");
    }

    #[test]
    fn test_malformed_frame_skipped() {
        let mut session = StreamSession::new(1024);
        session.feed(b"data: {\"a\":\ndata: \"x\"\ndata: [DONE]\n");
        let steps = collect(&mut session);
        assert_eq!(steps, vec![Step::Delta("x".into()), Step::Closed]);
    }

    #[test]
    fn test_provider_error_frame_fails() {
        let mut session = StreamSession::new(1024);
        session.feed(b"data: \"par\"\ndata: {\"error\":\"overloaded\"}\n");
        let steps = collect(&mut session);
        assert_eq!(steps[0], Step::Delta("par".into()));
        assert!(matches!(&steps[1], Step::Failed(m) if m.contains("overloaded")));
        assert_eq!(session.text(), "par");
    }

    #[test]
    fn test_pending_overflow_fails() {
        let mut session = StreamSession::new(4);
        session.feed(b"data: never ending");
        assert!(matches!(session.next_step(), Some(Step::Failed(_))));
    }

    #[test]
    fn test_overflow_forwards_frames_read_before_it() {
        let mut session = StreamSession::new(16);
        session.feed(b"data: \"Hel\"\ndata: \"lo\"\ndata: a tail with no delimiter");
        assert_eq!(session.next_step(), Some(Step::Delta("Hel".into())));
        assert_eq!(session.next_step(), Some(Step::Delta("lo".into())));
        assert!(matches!(session.next_step(), Some(Step::Failed(m)) if m.contains("delimiter")));
        assert_eq!(session.text(), "Hello");
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_terminal_session_ignores_input() {
        let mut session = StreamSession::new(1024);
        session.feed(b"data: [DONE]\n");
        assert_eq!(session.next_step(), Some(Step::Closed));
        session.feed(b"data: \"late\"\n");
        assert_eq!(session.next_step(), None);
        assert_eq!(session.text(), "");
    }

    #[test]
    fn test_reassembly_invariant_to_split_points() {
        let wire = "data: {\"choices\":[{\"delta\":{\"content\":\"Gr\u{fc}\u{df}e \"}}]}\n\n\
                    data: : not json\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"aus \u{1f30d}\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"!\"},\"finish_reason\":\"stop\"}]}\n\n\
                    data: [DONE]\n\n";
        let bytes = wire.as_bytes();

        let run = |splits: &[usize]| -> String {
            let mut session = StreamSession::new(1024);
            let total = bytes.len();
            let mut last = 0;
            for &cut in splits.iter().chain(std::iter::once(&total)) {
                session.feed(&bytes[last..cut]);
                last = cut;
                while let Some(step) = session.next_step() {
                    if !matches!(step, Step::Delta(_)) {
                        break;
                    }
                }
            }
            session.end_of_stream();
            while session.next_step().is_some() {}
            assert_eq!(session.state(), SessionState::Closed);
            session.text().to_string()
        };

        let whole = run(&[]);
        assert_eq!(whole, "Gr\u{fc}\u{df}e aus \u{1f30d}!");

        for n in 1..bytes.len() {
            assert_eq!(run(&[n]), whole, "single split at {n}");
        }
        for step in [1, 2, 3, 7, 13] {
            let splits: Vec<usize> = (step..bytes.len()).step_by(step).collect();
            assert_eq!(run(&splits), whole, "every {step} bytes");
        }
    }
}
