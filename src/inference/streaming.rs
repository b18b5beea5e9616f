//! Streaming event delivery
//!
//! Status and Response events leave the chat session through a single
//! [`EventSink`], invoked synchronously on the thread running the turn.

use std::io::{self, Write};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

/// Text emitted at each turn boundary.
pub const TURN_TERMINATOR: &str = "\n";

/// Kind of event emitted by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Status update, including formatted error reports
    Status = 0,
    /// Piece of generated text, or a turn terminator
    Response = 1,
}

/// An owned event, for sinks that forward events elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub text: String,
}

/// Receiver of session events.
///
/// Returning `true` asks the generation loop to stop right away, without
/// emitting a trailing terminator.
pub trait EventSink: Send {
    fn on_event(&mut self, kind: EventKind, text: &str) -> bool;
}

impl<F> EventSink for F
where
    F: FnMut(EventKind, &str) -> bool + Send,
{
    fn on_event(&mut self, kind: EventKind, text: &str) -> bool {
        self(kind, text)
    }
}

/// Sink handle shared between a session and the engine driving it.
///
/// Each event holds the lock only for the duration of the inner call, so
/// events from either side never interleave mid-write.
#[derive(Clone)]
pub struct SharedSink(Arc<Mutex<Box<dyn EventSink>>>);

impl SharedSink {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self(Arc::new(Mutex::new(sink)))
    }
}

impl EventSink for SharedSink {
    fn on_event(&mut self, kind: EventKind, text: &str) -> bool {
        let mut sink = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        sink.on_event(kind, text)
    }
}

/// Default sink: streams response pieces verbatim and prints status lines.
pub struct ConsoleSink<W: Write + Send> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    /// Sink writing to the process stdout
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Consumes the sink and returns the underlying writer
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_event(&mut self, kind: EventKind, text: &str) -> io::Result<()> {
        match kind {
            EventKind::Status => writeln!(self.out, "Status: {text}")?,
            EventKind::Response => self.out.write_all(text.as_bytes())?,
        }
        self.out.flush()
    }
}

impl<W: Write + Send> EventSink for ConsoleSink<W> {
    fn on_event(&mut self, kind: EventKind, text: &str) -> bool {
        match self.write_event(kind, text) {
            Ok(()) => false,
            Err(e) => {
                // Nobody is reading anymore, stop generating
                tracing::warn!("Console sink write failed, stopping: {}", e);
                true
            }
        }
    }
}

/// Sink forwarding events over a channel.
///
/// Requests a stop once the receiving side has been dropped.
pub struct ChannelSink {
    tx: Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn on_event(&mut self, kind: EventKind, text: &str) -> bool {
        let event = Event {
            kind,
            text: text.to_string(),
        };
        if self.tx.send(event).is_err() {
            tracing::debug!("Receiver dropped, stopping generation");
            return true;
        }
        false
    }
}

/// Reassembles UTF-8 text from token bytes.
///
/// A token may end in the middle of a multi-byte character; the incomplete
/// suffix is held back until the next token completes it.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Appends token bytes and returns the text that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Number of bytes held back
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_console_sink_formats_events() {
        let mut sink = ConsoleSink::new(Vec::new());
        assert!(!sink.on_event(EventKind::Status, "loaded"));
        assert!(!sink.on_event(EventKind::Response, "Hel"));
        assert!(!sink.on_event(EventKind::Response, "lo"));
        assert!(!sink.on_event(EventKind::Response, TURN_TERMINATOR));

        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(written, "Status: loaded\nHello\n");
    }

    #[test]
    fn test_channel_sink_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel();
        let mut sink = ChannelSink::new(tx);

        assert!(!sink.on_event(EventKind::Response, "a"));
        let event = rx.recv().unwrap();
        assert_eq!(event.kind, EventKind::Response);
        assert_eq!(event.text, "a");

        drop(rx);
        assert!(sink.on_event(EventKind::Response, "b"));
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |kind: EventKind, text: &str| {
                seen.push((kind, text.to_string()));
                text == "stop"
            };
            assert!(!sink.on_event(EventKind::Response, "go"));
            assert!(sink.on_event(EventKind::Response, "stop"));
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_shared_sink_clones_feed_one_sink() {
        let (tx, rx) = mpsc::channel();
        let mut first = SharedSink::new(Box::new(ChannelSink::new(tx)));
        let mut second = first.clone();

        assert!(!first.on_event(EventKind::Response, "a"));
        assert!(!second.on_event(EventKind::Status, "b"));
        drop((first, second));

        let texts: Vec<String> = rx.iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_utf8_carry_split_character() {
        let mut carry = Utf8Carry::default();
        let bytes = "é".as_bytes();

        assert_eq!(carry.push(&bytes[..1]), "");
        assert_eq!(carry.pending_len(), 1);
        assert_eq!(carry.push(&bytes[1..]), "é");
        assert_eq!(carry.pending_len(), 0);
    }

    #[test]
    fn test_utf8_carry_invalid_bytes_replaced() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        assert_eq!(carry.pending_len(), 0);
    }
}
