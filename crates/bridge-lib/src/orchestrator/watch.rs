//! Watch stream decoding

use super::OrchestratorError;
use crate::models::{Pod, WatchEvent, WatchEventType};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Stream of unscheduled pods announced by the watch
pub type WatchStream = ReceiverStream<Result<Pod, OrchestratorError>>;

/// Incremental decoder for newline-delimited watch events
///
/// Bytes arrive in arbitrary chunks; complete lines are decoded and only
/// `ADDED` pods without a node are returned.
#[derive(Debug, Default)]
pub struct WatchDecoder {
    buffer: Vec<u8>,
}

impl WatchDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and decode every complete line in it
    ///
    /// Decoding stops at the first malformed line; its error is the last
    /// element of the returned vector.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Pod, OrchestratorError>> {
        self.buffer.extend_from_slice(chunk);
        let mut decoded = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            match decode_line(&line) {
                Ok(Some(pod)) => decoded.push(Ok(pod)),
                Ok(None) => {}
                Err(e) => {
                    decoded.push(Err(e));
                    self.buffer.clear();
                    break;
                }
            }
        }

        decoded
    }

    /// Decode whatever is left once the connection closes
    pub fn finish(&mut self) -> Option<Result<Pod, OrchestratorError>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest).transpose()
    }
}

fn decode_line(line: &[u8]) -> Result<Option<Pod>, OrchestratorError> {
    let line = trim_whitespace(line);
    if line.is_empty() {
        return Ok(None);
    }

    let event: WatchEvent =
        serde_json::from_slice(line).map_err(|e| OrchestratorError::decode("watch event", e))?;

    match event.event_type {
        WatchEventType::Added => {
            let pod: Pod = serde_json::from_value(event.object)
                .map_err(|e| OrchestratorError::decode("watched pod", e))?;
            if pod.is_scheduled() {
                return Ok(None);
            }
            Ok(Some(pod))
        }
        WatchEventType::Error => {
            debug!(status = %event.object, "Watch returned an error event");
            Ok(None)
        }
        other => {
            debug!(event_type = ?other, "Ignoring watch event");
            Ok(None)
        }
    }
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(name: &str) -> String {
        format!(
            "{{\"type\":\"ADDED\",\"object\":{{\"metadata\":{{\"name\":\"{}\",\"uid\":\"u-{}\"}},\"spec\":{{\"containers\":[]}}}}}}\n",
            name, name
        )
    }

    #[test]
    fn test_decodes_added_pods() {
        let mut decoder = WatchDecoder::new();
        let input = format!("{}{}", added("a"), added("b"));

        let pods: Vec<_> = decoder
            .push(input.as_bytes())
            .into_iter()
            .map(|r| r.unwrap().metadata.name)
            .collect();
        assert_eq!(pods, vec!["a", "b"]);
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = WatchDecoder::new();
        let line = added("split");
        let (head, tail) = line.as_bytes().split_at(20);

        assert!(decoder.push(head).is_empty());
        let pods = decoder.push(tail);
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].as_ref().unwrap().name(), "split");
    }

    #[test]
    fn test_other_event_types_are_skipped() {
        let mut decoder = WatchDecoder::new();
        let input = concat!(
            "{\"type\":\"MODIFIED\",\"object\":{\"metadata\":{\"name\":\"m\"}}}\n",
            "{\"type\":\"DELETED\",\"object\":{\"metadata\":{\"name\":\"d\"}}}\n",
            "{\"type\":\"ERROR\",\"object\":{\"kind\":\"Status\",\"code\":410}}\n",
            "\n"
        );
        assert!(decoder.push(input.as_bytes()).is_empty());
    }

    #[test]
    fn test_scheduled_pods_are_skipped() {
        let mut decoder = WatchDecoder::new();
        let input = "{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"name\":\"x\"},\"spec\":{\"nodeName\":\"node01\"}}}\n";
        assert!(decoder.push(input.as_bytes()).is_empty());
    }

    #[test]
    fn test_malformed_line_stops_decoding() {
        let mut decoder = WatchDecoder::new();
        let input = format!("{}not json\n{}", added("a"), added("b"));

        let results = decoder.push(input.as_bytes());
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(OrchestratorError::Decode { .. })));
    }

    #[test]
    fn test_finish_decodes_unterminated_line() {
        let mut decoder = WatchDecoder::new();
        let line = added("last");
        assert!(decoder.push(line.trim_end().as_bytes()).is_empty());

        let pod = decoder.finish().unwrap().unwrap();
        assert_eq!(pod.name(), "last");
        assert!(decoder.finish().is_none());
    }
}
