//! Incremental `text/event-stream` parser.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Event name (`message` when the block has no `event:` field)
    pub event: String,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// `id:` field of this block, if any
    pub id: Option<String>,
    /// `retry:` field of this block, in ms
    pub retry: Option<u64>,
}

/// Feed raw body chunks, get complete events back. Lines may be split
/// anywhere across chunks; `\n`, `\r\n` and `\r` all end a line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
    last_event_id: Option<String>,
    reconnect_ms: Option<u64>,
    started: bool,
}

impl SseDecoder {
    /// Fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `id:` seen on the stream (survives across events).
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Last `retry:` seen on the stream, in ms. Applies even when its block
    /// carried no data.
    pub fn reconnect_ms(&self) -> Option<u64> {
        self.reconnect_ms
    }

    /// Consume `chunk` and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.buffer.len() {
            let end = match self.buffer[i] {
                b'\n' => i,
                b'\r' => {
                    if i + 1 == self.buffer.len() {
                        // Might be the first half of `\r\n`.
                        break;
                    }
                    let end = i;
                    if self.buffer[i + 1] == b'\n' {
                        i += 1;
                    }
                    end
                },
                _ => {
                    i += 1;
                    continue;
                },
            };
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            self.process_line(&line, &mut events);
            i += 1;
            start = i;
        }
        self.buffer.drain(..start);
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        let line = if self.started {
            line
        } else {
            self.started = true;
            line.strip_prefix('\u{feff}').unwrap_or(line)
        };

        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => {
                self.id = Some(value.to_string());
                self.last_event_id = (!value.is_empty()).then(|| value.to_string());
            },
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                    self.reconnect_ms = Some(ms);
                }
            },
            _ => {},
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: event.filter(|e| !e.is_empty()).unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: id.filter(|i| !i.is_empty()),
            retry,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_and_default_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: connected\ndata: {\"a\":1}\n\ndata: 5\nid: 7\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "connected");
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].id, None);
        assert_eq!(events[1].event, "message");
        assert_eq!(events[1].id.as_deref(), Some("7"));
        assert_eq!(decoder.last_event_id(), Some("7"));
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"da").is_empty());
        assert!(decoder.push(b"ta: one\r").is_empty());
        assert!(decoder.push(b"\ndata: two\r\n").is_empty());
        let events = decoder.push(b"\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn test_comments_and_empty_blocks_are_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\n\nevent: ping\n\nretry: 2500\ndata\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "");
        assert_eq!(events[0].retry, Some(2500));
    }

    #[test]
    fn test_retry_without_data_is_remembered() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"retry: 40

").is_empty());
        assert_eq!(decoder.reconnect_ms(), Some(40));
    }
}
