//! Wire protocol between the unprivileged CLI and the privileged gateway
//!
//! One JSON object per line in each direction. Only plain values cross:
//! a request in, an [`ApplyReport`] or an [`ApplyError`] out.

use crate::domain::{AppliedSetting, DeviceCapabilities, SettingRequest};
use crate::error::{ApplyError, IpcError};
use crate::services::gateway::ApplyReport;
use crate::services::sampler::FeedEntry;

use serde::{Deserialize, Serialize};
use std::io::{self, BufRead};

/// Largest accepted message, newline included
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Request sent to the privileged side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum GatewayRequest {
    Apply {
        device: u32,
        request: SettingRequest,
    },
    Status {
        device: u32,
    },
    Capabilities {
        device: u32,
    },
    /// Restore automatic fan control and end the session
    Shutdown,
}

impl GatewayRequest {
    pub fn type_name(&self) -> &'static str {
        match self {
            GatewayRequest::Apply { .. } => "apply",
            GatewayRequest::Status { .. } => "status",
            GatewayRequest::Capabilities { .. } => "capabilities",
            GatewayRequest::Shutdown => "shutdown",
        }
    }
}

/// Applied state plus the latest telemetry for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub applied: AppliedSetting,
    pub telemetry: Option<FeedEntry>,
}

/// Response from the privileged side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum GatewayResponse {
    Applied(ApplyReport),
    Status(DeviceStatus),
    Capabilities(DeviceCapabilities),
    /// The request was well formed but the gateway refused it
    Error(ApplyError),
    /// The line was not a valid request
    BadRequest(String),
    Bye,
}

impl GatewayResponse {
    /// True if this is a legitimate answer to `request`
    pub fn answers(&self, request: &GatewayRequest) -> bool {
        match (request, self) {
            (_, GatewayResponse::Error(_) | GatewayResponse::BadRequest(_)) => true,
            (GatewayRequest::Apply { .. }, GatewayResponse::Applied(_)) => true,
            (GatewayRequest::Status { .. }, GatewayResponse::Status(_)) => true,
            (GatewayRequest::Capabilities { .. }, GatewayResponse::Capabilities(_)) => true,
            (GatewayRequest::Shutdown, GatewayResponse::Bye) => true,
            _ => false,
        }
    }
}

/// Serialize a message as one newline-terminated line
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, IpcError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::BadRequest(format!(
            "message of {} bytes exceeds the {} byte limit",
            line.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(line)
}

/// One line read from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// The peer closed the stream
    Eof,
    /// A complete line without its newline
    Message(Vec<u8>),
    /// The line was longer than the limit and has been discarded
    TooLarge,
}

/// Read one line, never buffering more than `max_len` bytes
///
/// An oversized line is consumed up to its newline so the next read starts
/// at the next message.
pub fn read_line_bounded<R: BufRead>(reader: &mut R, max_len: usize) -> io::Result<Line> {
    let mut out = Vec::new();
    let mut overflow = false;

    loop {
        let available = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            // A partial last line without a newline still counts
            return Ok(match (overflow, out.is_empty()) {
                (true, _) => Line::TooLarge,
                (false, true) => Line::Eof,
                (false, false) => Line::Message(out),
            });
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let take = newline.map_or(available.len(), |pos| pos + 1);

        if !overflow {
            let chunk = newline.map_or(available, |pos| &available[..pos]);
            if out.len() + chunk.len() + usize::from(newline.is_some()) > max_len {
                overflow = true;
                out = Vec::new();
            } else {
                out.extend_from_slice(chunk);
            }
        }
        reader.consume(take);

        if newline.is_some() {
            return Ok(if overflow {
                Line::TooLarge
            } else {
                Line::Message(out)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FanRequest;
    use std::io::Cursor;

    #[test]
    fn test_request_wire_format() {
        let request = GatewayRequest::Apply {
            device: 0,
            request: SettingRequest::new()
                .with_power_limit(300)
                .with_fan(FanRequest::manual(60)),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"cmd":"apply","data":{"device":0,"request":{"power_limit_watts":300,"fan":{"mode":"manual","duty_percent":60}}}}"#
        );

        let shutdown: GatewayRequest = serde_json::from_str(r#"{"cmd":"shutdown"}"#).unwrap();
        assert_eq!(shutdown, GatewayRequest::Shutdown);
    }

    #[test]
    fn test_error_response_carries_apply_error() {
        let response = GatewayResponse::Error(ApplyError::LockTimeout {
            device: 0,
            waited_ms: 5000,
        });
        let line = encode(&response).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let back: GatewayResponse = serde_json::from_slice(&line).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_answers() {
        let status = GatewayRequest::Status { device: 0 };
        assert!(GatewayResponse::Bye.answers(&GatewayRequest::Shutdown));
        assert!(GatewayResponse::BadRequest("x".into()).answers(&status));
        assert!(!GatewayResponse::Bye.answers(&status));
    }

    #[test]
    fn test_read_lines() {
        let mut reader = Cursor::new(b"first\nsecond\nlast".to_vec());
        assert_eq!(
            read_line_bounded(&mut reader, 64).unwrap(),
            Line::Message(b"first".to_vec())
        );
        assert_eq!(
            read_line_bounded(&mut reader, 64).unwrap(),
            Line::Message(b"second".to_vec())
        );
        assert_eq!(
            read_line_bounded(&mut reader, 64).unwrap(),
            Line::Message(b"last".to_vec())
        );
        assert_eq!(read_line_bounded(&mut reader, 64).unwrap(), Line::Eof);
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut input = vec![b'x'; 100];
        input.extend_from_slice(b"\nok\n");
        // Small buffer so the long line spans several fills
        let mut reader = io::BufReader::with_capacity(16, Cursor::new(input));

        assert_eq!(read_line_bounded(&mut reader, 32).unwrap(), Line::TooLarge);
        assert_eq!(
            read_line_bounded(&mut reader, 32).unwrap(),
            Line::Message(b"ok".to_vec())
        );
    }
}
