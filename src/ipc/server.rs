//! Privileged side of the boundary
//!
//! Every line is untrusted input. A line that is too long or not a valid
//! request gets a `BadRequest` answer and the session carries on; only
//! end of input or a `Shutdown` request ends it.

use crate::error::IpcError;
use crate::ipc::protocol::{
    encode, read_line_bounded, DeviceStatus, GatewayRequest, GatewayResponse, Line,
    MAX_MESSAGE_SIZE,
};
use crate::services::gateway::ApplyGateway;
use crate::services::sampler::TelemetryFeed;

use std::io::{BufRead, Write};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its side
    Eof,
    /// The client asked for a shutdown
    Shutdown,
}

/// Answer one request
pub fn handle(
    request: GatewayRequest,
    gateway: &ApplyGateway,
    feed: &TelemetryFeed,
) -> GatewayResponse {
    match request {
        GatewayRequest::Apply { device, request } => match gateway.apply(device, &request) {
            Ok(report) => GatewayResponse::Applied(report),
            Err(e) => {
                log::warn!("GPU {}: apply refused: {}", device, e);
                GatewayResponse::Error(e)
            }
        },
        GatewayRequest::Status { device } => match gateway.applied(device) {
            Ok(applied) => GatewayResponse::Status(DeviceStatus {
                applied,
                telemetry: feed.latest(device),
            }),
            Err(e) => GatewayResponse::Error(e),
        },
        GatewayRequest::Capabilities { device } => match gateway.capabilities(device) {
            Ok(caps) => GatewayResponse::Capabilities(caps),
            Err(e) => GatewayResponse::Error(e),
        },
        GatewayRequest::Shutdown => match gateway.restore_auto() {
            Ok(()) => GatewayResponse::Bye,
            Err(e) => GatewayResponse::Error(e),
        },
    }
}

fn send<W: Write>(writer: &mut W, response: &GatewayResponse) -> Result<(), IpcError> {
    let line = match encode(response) {
        Ok(line) => line,
        // Never leave the client waiting on a response we cannot encode
        Err(e) => encode(&GatewayResponse::BadRequest(e.to_string()))?,
    };
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Serve requests until end of input or a `Shutdown`
pub fn serve<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
    gateway: &ApplyGateway,
    feed: &TelemetryFeed,
) -> Result<SessionEnd, IpcError> {
    loop {
        let line = match read_line_bounded(&mut reader, MAX_MESSAGE_SIZE)? {
            Line::Eof => {
                log::debug!("Client closed the session");
                return Ok(SessionEnd::Eof);
            }
            Line::TooLarge => {
                log::warn!("Rejected request over {} bytes", MAX_MESSAGE_SIZE);
                send(
                    &mut writer,
                    &GatewayResponse::BadRequest(format!(
                        "message exceeds {} bytes",
                        MAX_MESSAGE_SIZE
                    )),
                )?;
                continue;
            }
            Line::Message(line) => line,
        };

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let request: GatewayRequest = match serde_json::from_slice(&line) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Rejected malformed request: {}", e);
                send(&mut writer, &GatewayResponse::BadRequest(e.to_string()))?;
                continue;
            }
        };

        log::debug!("Request: {}", request.type_name());
        let shutdown = request == GatewayRequest::Shutdown;
        let response = handle(request, gateway, feed);
        send(&mut writer, &response)?;

        if shutdown {
            return Ok(SessionEnd::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AppliedFan, FanRequest, FanSpeed, SettingRequest};
    use crate::error::ApplyError;
    use crate::mock::{MockDevice, MockWrite};
    use crate::nvml::DeviceSession;
    use crate::services::gateway::GatewayConfig;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    fn gateway(device: MockDevice) -> ApplyGateway {
        let session = DeviceSession::spawn(device, Duration::from_secs(1)).unwrap();
        ApplyGateway::with_sessions(vec![Arc::new(session)], &GatewayConfig::default()).unwrap()
    }

    fn run(input: &str, gateway: &ApplyGateway) -> (SessionEnd, Vec<GatewayResponse>) {
        let mut output = Vec::new();
        let end = serve(
            Cursor::new(input.as_bytes().to_vec()),
            &mut output,
            gateway,
            &TelemetryFeed::new(),
        )
        .unwrap();
        let responses = output
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_slice(l).unwrap())
            .collect();
        (end, responses)
    }

    fn line(request: &GatewayRequest) -> String {
        String::from_utf8(encode(request).unwrap()).unwrap()
    }

    #[test]
    fn test_apply_over_the_wire() {
        let device = MockDevice::new(0);
        let hw = device.clone();
        let gateway = gateway(device);

        let input = line(&GatewayRequest::Apply {
            device: 0,
            request: SettingRequest::new().with_power_limit(9999),
        });
        let (end, responses) = run(&input, &gateway);

        assert_eq!(end, SessionEnd::Eof);
        let GatewayResponse::Applied(report) = &responses[0] else {
            panic!("unexpected response {:?}", responses[0]);
        };
        assert_eq!(report.applied.power_limit_watts, Some(400));
        assert_eq!(hw.writes(), vec![MockWrite::PowerLimit(400)]);
    }

    #[test]
    fn test_malformed_lines_do_not_end_session() {
        let gateway = gateway(MockDevice::new(0));
        let mut input = String::from("{not json\n");
        input.push_str(&"x".repeat(MAX_MESSAGE_SIZE + 10));
        input.push('\n');
        input.push_str("{\"cmd\":\"format_disk\"}\n");
        input.push_str(&line(&GatewayRequest::Status { device: 0 }));

        let (_, responses) = run(&input, &gateway);
        assert_eq!(responses.len(), 4);
        assert!(responses[..3]
            .iter()
            .all(|r| matches!(r, GatewayResponse::BadRequest(_))));
        assert!(matches!(responses[3], GatewayResponse::Status(_)));
    }

    #[test]
    fn test_gateway_errors_are_returned() {
        let gateway = gateway(MockDevice::new(0));
        let input = line(&GatewayRequest::Apply {
            device: 7,
            request: SettingRequest::new().with_power_limit(200),
        });

        let (_, responses) = run(&input, &gateway);
        assert_eq!(
            responses,
            vec![GatewayResponse::Error(ApplyError::UnknownDevice(7))]
        );
    }

    #[test]
    fn test_shutdown_restores_auto_and_ends_session() {
        let device = MockDevice::new(0);
        let hw = device.clone();
        let gateway = gateway(device);

        let mut input = line(&GatewayRequest::Apply {
            device: 0,
            request: SettingRequest::new().with_fan(FanRequest::manual(70)),
        });
        input.push_str(&line(&GatewayRequest::Shutdown));
        input.push_str(&line(&GatewayRequest::Status { device: 0 }));

        let (end, responses) = run(&input, &gateway);
        assert_eq!(end, SessionEnd::Shutdown);
        // Nothing after the shutdown is answered
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1], GatewayResponse::Bye);
        assert_eq!(gateway.applied(0).unwrap().fan, Some(AppliedFan::Auto));

        // A control loop still running cannot pin the fans again
        hw.clear_writes();
        assert_eq!(
            gateway.apply_fan_duty(0, FanSpeed::new(70).unwrap()),
            Err(ApplyError::FanModeMismatch { device: 0 })
        );
        assert!(hw.writes().is_empty());
    }
}
