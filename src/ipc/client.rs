//! Unprivileged side of the boundary
//!
//! The CLI never writes to hardware itself. It starts the privileged
//! helper through the escalation command and exchanges plain messages
//! with it over the helper's stdin and stdout.

use crate::domain::{DeviceCapabilities, SettingRequest};
use crate::error::{AppError, IpcError, Result};
use crate::ipc::protocol::{
    encode, read_line_bounded, GatewayRequest, GatewayResponse, Line, MAX_MESSAGE_SIZE,
};
use crate::services::gateway::ApplyReport;

use std::ffi::OsString;
use std::io::{BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Exit codes pkexec uses when authentication is dismissed or refused
const AUTH_EXIT_CODES: [i32; 2] = [126, 127];

/// A bidirectional line channel to the privileged side
pub trait Transport {
    /// Send one encoded line
    fn send(&mut self, line: &[u8]) -> std::result::Result<(), IpcError>;

    /// Receive one line without its newline
    fn receive(&mut self) -> std::result::Result<Vec<u8>, IpcError>;
}

/// The privileged helper running as a child process
pub struct ChildTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ChildTransport {
    /// Start `escalation program args...`, or the program itself if
    /// `escalation` is empty
    pub fn spawn(
        escalation: &str,
        program: OsString,
        args: Vec<OsString>,
    ) -> std::result::Result<Self, IpcError> {
        let mut command = if escalation.is_empty() {
            Command::new(&program)
        } else {
            let mut command = Command::new(escalation);
            command.arg(&program);
            command
        };
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let display = if escalation.is_empty() {
            program.to_string_lossy().into_owned()
        } else {
            escalation.to_string()
        };
        let mut child = command.spawn().map_err(|source| IpcError::Spawn {
            command: display,
            source,
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(IpcError::Disconnected);
        };
        log::debug!("Started privileged helper (pid {})", child.id());

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    /// Map a closed pipe to the reason the helper went away
    fn closed(&mut self) -> IpcError {
        match self.child.wait() {
            Ok(status) if status.code().is_some_and(|c| AUTH_EXIT_CODES.contains(&c)) => {
                IpcError::AuthenticationFailed
            }
            Ok(status) => {
                log::debug!("Privileged helper exited with {}", status);
                IpcError::Disconnected
            }
            Err(e) => IpcError::Io(e),
        }
    }
}

impl Transport for ChildTransport {
    fn send(&mut self, line: &[u8]) -> std::result::Result<(), IpcError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(IpcError::Disconnected);
        };
        let written = stdin.write_all(line).and_then(|_| stdin.flush());
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(self.closed()),
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&mut self) -> std::result::Result<Vec<u8>, IpcError> {
        match read_line_bounded(&mut self.stdout, MAX_MESSAGE_SIZE)? {
            Line::Message(line) => Ok(line),
            Line::TooLarge => Err(IpcError::UnexpectedResponse(format!(
                "response exceeds {} bytes",
                MAX_MESSAGE_SIZE
            ))),
            Line::Eof => Err(self.closed()),
        }
    }
}

impl Drop for ChildTransport {
    fn drop(&mut self) {
        // Closing stdin ends the helper's session
        drop(self.stdin.take());
        if let Err(e) = self.child.wait() {
            log::warn!("Failed to reap privileged helper: {}", e);
        }
    }
}

/// Typed requests over a [`Transport`]
pub struct GatewayClient<T: Transport> {
    transport: T,
}

impl<T: Transport> GatewayClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Send one request and wait for its answer
    ///
    /// `Error` responses are returned as values; `BadRequest` and answers
    /// of the wrong kind are transport errors.
    pub fn request(
        &mut self,
        request: &GatewayRequest,
    ) -> std::result::Result<GatewayResponse, IpcError> {
        self.transport.send(&encode(request)?)?;
        let line = self.transport.receive()?;
        let response: GatewayResponse = serde_json::from_slice(&line)?;

        if let GatewayResponse::BadRequest(reason) = response {
            return Err(IpcError::BadRequest(reason));
        }
        if !response.answers(request) {
            return Err(IpcError::UnexpectedResponse(format!(
                "{:?} for {} request",
                response,
                request.type_name()
            )));
        }
        Ok(response)
    }

    pub fn apply(&mut self, device: u32, request: &SettingRequest) -> Result<ApplyReport> {
        let response = self.request(&GatewayRequest::Apply {
            device,
            request: request.clone(),
        })?;
        match response {
            GatewayResponse::Applied(report) => Ok(report),
            GatewayResponse::Error(e) => Err(AppError::Apply(e)),
            other => Err(unexpected(other)),
        }
    }

    pub fn capabilities(&mut self, device: u32) -> Result<DeviceCapabilities> {
        match self.request(&GatewayRequest::Capabilities { device })? {
            GatewayResponse::Capabilities(caps) => Ok(caps),
            GatewayResponse::Error(e) => Err(AppError::Apply(e)),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the helper to restore automatic fan control and exit
    pub fn shutdown(&mut self) -> Result<()> {
        match self.request(&GatewayRequest::Shutdown)? {
            GatewayResponse::Bye => Ok(()),
            GatewayResponse::Error(e) => Err(AppError::Apply(e)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: GatewayResponse) -> AppError {
    IpcError::UnexpectedResponse(format!("{:?}", response)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApplyError;
    use crate::ipc::server;
    use crate::mock::MockDevice;
    use crate::nvml::DeviceSession;
    use crate::services::gateway::{ApplyGateway, GatewayConfig};
    use crate::services::sampler::TelemetryFeed;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    /// Runs each line through an in-process server
    struct Loopback {
        gateway: ApplyGateway,
        feed: TelemetryFeed,
        pending: VecDeque<Vec<u8>>,
    }

    impl Loopback {
        fn new() -> Self {
            let session = DeviceSession::spawn(MockDevice::new(0), Duration::from_secs(1)).unwrap();
            Self {
                gateway: ApplyGateway::with_sessions(
                    vec![Arc::new(session)],
                    &GatewayConfig::default(),
                )
                .unwrap(),
                feed: TelemetryFeed::new(),
                pending: VecDeque::new(),
            }
        }
    }

    impl Transport for Loopback {
        fn send(&mut self, line: &[u8]) -> std::result::Result<(), IpcError> {
            let mut output = Vec::new();
            server::serve(Cursor::new(line.to_vec()), &mut output, &self.gateway, &self.feed)?;
            for reply in output.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                self.pending.push_back(reply.to_vec());
            }
            Ok(())
        }

        fn receive(&mut self) -> std::result::Result<Vec<u8>, IpcError> {
            self.pending.pop_front().ok_or(IpcError::Disconnected)
        }
    }

    /// Answers every request with a fixed line
    struct Canned(&'static str);

    impl Transport for Canned {
        fn send(&mut self, _line: &[u8]) -> std::result::Result<(), IpcError> {
            Ok(())
        }

        fn receive(&mut self) -> std::result::Result<Vec<u8>, IpcError> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    #[test]
    fn test_apply_and_status() {
        let mut client = GatewayClient::new(Loopback::new());

        let report = client
            .apply(0, &SettingRequest::new().with_core_offset(5000))
            .unwrap();
        assert_eq!(report.applied.core_clock_offset_mhz, Some(1500));
        assert_eq!(report.adjustments.len(), 1);

        let response = client.request(&GatewayRequest::Status { device: 0 }).unwrap();
        let GatewayResponse::Status(status) = response else {
            panic!("expected status, got {:?}", response);
        };
        assert_eq!(status.applied.core_clock_offset_mhz, Some(1500));
        assert!(status.telemetry.is_none());

        let caps = client.capabilities(0).unwrap();
        assert_eq!(caps.fan_count, 2);

        client.shutdown().unwrap();
    }

    #[test]
    fn test_gateway_error_surfaces_as_apply_error() {
        let mut client = GatewayClient::new(Loopback::new());
        let err = client
            .apply(2, &SettingRequest::new().with_power_limit(200))
            .unwrap_err();
        assert!(matches!(err, AppError::Apply(ApplyError::UnknownDevice(2))));
    }

    #[test]
    fn test_wrong_response_kind_is_rejected() {
        let mut client = GatewayClient::new(Canned(r#"{"status":"bye"}"#));
        let err = client.capabilities(0).unwrap_err();
        assert!(matches!(
            err,
            AppError::Ipc(IpcError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_bad_request_is_a_transport_error() {
        let mut client = GatewayClient::new(Canned(r#"{"status":"bad_request","data":"nope"}"#));
        let err = client.request(&GatewayRequest::Shutdown).unwrap_err();
        assert!(matches!(err, IpcError::BadRequest(ref r) if r == "nope"));
    }

    #[test]
    fn test_spawn_failure() {
        let err = ChildTransport::spawn("", "/nonexistent/nvoc-helper".into(), vec![])
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::Spawn { .. }));
    }
}
