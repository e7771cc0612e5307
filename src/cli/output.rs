//! Output formatting utilities
//!
//! Provides table and JSON output formatting for CLI commands.

use crate::cli::args::OutputFormat;
use crate::domain::{AppliedSetting, FanRequest, Profile, TelemetrySample};
use crate::services::boot::BootOutcome;
use crate::services::gateway::ApplyReport;
use crate::services::sampler::FeedEntry;

use serde::Serialize;
use std::io::{self, Write};

/// Format and print output based on the selected format
pub fn print_output<T: Serialize + TableDisplay>(data: &T, format: OutputFormat) -> io::Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();

    match format {
        OutputFormat::Table => {
            writeln!(handle, "{}", data.to_table())?;
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
            writeln!(handle, "{}", json)?;
        }
        OutputFormat::Compact => {
            writeln!(handle, "{}", data.to_compact())?;
        }
    }

    Ok(())
}

/// Trait for types that can be displayed as a table
pub trait TableDisplay {
    /// Format as a table string
    fn to_table(&self) -> String;

    /// Format as a compact single line
    fn to_compact(&self) -> String {
        self.to_table().replace('\n', " | ")
    }
}

fn opt<T: std::fmt::Display>(value: Option<T>, unit: &str) -> String {
    match value {
        Some(v) => format!("{}{}", v, unit),
        None => "n/a".to_string(),
    }
}

fn signed(value: Option<i32>) -> String {
    match value {
        Some(v) => format!("{:+} MHz", v),
        None => "n/a".to_string(),
    }
}

/// Telemetry and applied state of one GPU
#[derive(Debug, Clone, Serialize)]
pub struct GpuStatus {
    pub index: u32,
    pub name: String,
    pub telemetry: Option<FeedEntry>,
    pub applied: AppliedSetting,
}

fn telemetry_lines(sample: &TelemetrySample) -> String {
    let mut out = format!(
        "  Temperature: {}°C\n  Power Draw: {}\n  Clocks: {} MHz core, {} MHz memory\n",
        sample.temperature_c,
        sample
            .power_watts
            .map_or("n/a".to_string(), |w| format!("{:.1}W", w)),
        sample.core_clock_mhz,
        sample.mem_clock_mhz,
    );
    if let Some(util) = sample.utilization_percent {
        out.push_str(&format!("  Utilization: {}%\n", util));
    }
    for (i, duty) in sample.fan_duty_percent.iter().enumerate() {
        let rpm = sample
            .fan_rpm
            .get(i)
            .map_or(String::new(), |r| format!(" ({} RPM)", r));
        out.push_str(&format!("  Fan {}: {}%{}\n", i, duty, rpm));
    }
    out
}

impl TableDisplay for GpuStatus {
    fn to_table(&self) -> String {
        let mut out = format!("[{}] {}\n", self.index, self.name);

        match &self.telemetry {
            Some(FeedEntry::Fresh { sample }) => out.push_str(&telemetry_lines(sample)),
            Some(FeedEntry::Stale { last, reason, .. }) => {
                out.push_str(&format!("  Telemetry: stale ({})\n", reason));
                if let Some(sample) = last {
                    out.push_str(&telemetry_lines(sample));
                }
            }
            None => out.push_str("  Telemetry: unavailable\n"),
        }

        out.push_str(&format!(
            "  Power Limit: {}\n  Core Offset: {}\n  Memory Offset: {}\n  Fan Mode: {}",
            opt(self.applied.power_limit_watts, "W"),
            signed(self.applied.core_clock_offset_mhz),
            signed(self.applied.mem_clock_offset_mhz),
            opt(self.applied.fan.as_ref(), ""),
        ));
        out
    }

    fn to_compact(&self) -> String {
        let temp = self
            .telemetry
            .as_ref()
            .and_then(|t| t.sample())
            .map_or("n/a".to_string(), |s| format!("{}°C", s.temperature_c));
        format!(
            "{}:{} {} {} {}",
            self.index,
            self.name,
            temp,
            opt(self.applied.power_limit_watts, "W"),
            opt(self.applied.fan.as_ref(), ""),
        )
    }
}

/// Status of every selected GPU
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub driver_version: Option<String>,
    pub gpus: Vec<GpuStatus>,
}

impl TableDisplay for StatusReport {
    fn to_table(&self) -> String {
        let mut out = String::new();
        if let Some(version) = &self.driver_version {
            out.push_str(&format!("Driver Version: {}\n\n", version));
        }
        let gpus: Vec<String> = self.gpus.iter().map(|g| g.to_table()).collect();
        out.push_str(&gpus.join("\n\n"));
        out
    }

    fn to_compact(&self) -> String {
        self.gpus
            .iter()
            .map(|g| g.to_compact())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Result of applying a profile to one GPU
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutput {
    pub gpu_index: u32,
    pub profile: String,
    #[serde(flatten)]
    pub report: ApplyReport,
}

impl TableDisplay for ApplyOutput {
    fn to_table(&self) -> String {
        let applied = &self.report.applied;
        let mut out = format!(
            "✓ GPU {}: applied profile '{}'\n  Power Limit: {}\n  Core Offset: {}\n  Memory Offset: {}\n  Fan Mode: {}",
            self.gpu_index,
            self.profile,
            opt(applied.power_limit_watts, "W"),
            signed(applied.core_clock_offset_mhz),
            signed(applied.mem_clock_offset_mhz),
            opt(applied.fan.as_ref(), ""),
        );
        for adjustment in &self.report.adjustments {
            out.push_str(&format!("\n  ! {}", adjustment));
        }
        out
    }

    fn to_compact(&self) -> String {
        format!(
            "{}:{} ({} adjusted)",
            self.gpu_index,
            self.profile,
            self.report.adjustments.len()
        )
    }
}

/// One line of the profile listing
#[derive(Debug, Clone, Serialize)]
pub struct ProfileEntry {
    pub name: String,
    pub description: String,
    pub preset: bool,
    pub default: bool,
}

/// Stored profiles and built-in presets
#[derive(Debug, Clone, Serialize)]
pub struct ProfileList {
    pub profiles: Vec<ProfileEntry>,
}

impl TableDisplay for ProfileList {
    fn to_table(&self) -> String {
        if self.profiles.is_empty() {
            return "No profiles".to_string();
        }
        self.profiles
            .iter()
            .map(|p| {
                let mut line = format!("{} {}", if p.default { "*" } else { " " }, p.name);
                if p.preset {
                    line.push_str(" (preset)");
                }
                if !p.description.is_empty() {
                    line.push_str(&format!(" - {}", p.description));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn to_compact(&self) -> String {
        self.profiles
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A single profile in full
#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    #[serde(flatten)]
    pub profile: Profile,
    pub default: bool,
}

impl TableDisplay for ProfileView {
    fn to_table(&self) -> String {
        let p = &self.profile;
        let s = &p.settings;
        let mut out = format!("{}{}\n", p.name, if self.default { " (default)" } else { "" });
        if !p.description.is_empty() {
            out.push_str(&format!("  {}\n", p.description));
        }
        out.push_str(&format!(
            "  Power Limit: {}\n  Core Offset: {}\n  Memory Offset: {}\n",
            s.power_limit_watts.map_or("unchanged".to_string(), |w| format!("{}W", w)),
            s.core_clock_offset_mhz
                .map_or("unchanged".to_string(), |v| format!("{:+} MHz", v)),
            s.mem_clock_offset_mhz
                .map_or("unchanged".to_string(), |v| format!("{:+} MHz", v)),
        ));
        match &s.fan {
            None => out.push_str("  Fan: unchanged"),
            Some(FanRequest::Auto) => out.push_str("  Fan: auto"),
            Some(FanRequest::Manual { duty_percent }) => {
                out.push_str(&format!("  Fan: manual {}", opt(*duty_percent, "%")))
            }
            Some(FanRequest::Custom { curve }) => {
                out.push_str("  Fan: custom curve");
                for point in curve.iter().flat_map(|c| c.points()) {
                    out.push_str(&format!(
                        "\n    {}°C -> {}%",
                        point.temperature_c, point.duty_percent
                    ));
                }
            }
        }
        out.push_str(&format!("\n  Updated: {}", p.updated_at.to_rfc3339()));
        out
    }

    fn to_compact(&self) -> String {
        let s = &self.profile.settings;
        format!(
            "{} power={} core={} mem={} fan={}",
            self.profile.name,
            opt(s.power_limit_watts, "W"),
            signed(s.core_clock_offset_mhz),
            signed(s.mem_clock_offset_mhz),
            s.fan.as_ref().map_or("unchanged", |f| f.mode_name()),
        )
    }
}

impl TableDisplay for BootOutcome {
    fn to_table(&self) -> String {
        match self {
            BootOutcome::NoDefault => "No default profile set".to_string(),
            BootOutcome::Skipped { reason } => format!("✗ Boot apply skipped: {}", reason),
            BootOutcome::LoadFailed { reason } => {
                format!("✗ Default profile could not be loaded: {}", reason)
            }
            BootOutcome::Applied { profile, reports } => format!(
                "✓ Applied default profile '{}' to {} GPU(s)",
                profile,
                reports.len()
            ),
            BootOutcome::Failed {
                profile, errors, ..
            } => {
                let mut out = format!("✗ Default profile '{}' failed", profile);
                for failure in errors {
                    out.push_str(&format!("\n  GPU {}: {}", failure.device, failure.error));
                }
                out
            }
        }
    }
}

/// Simple message output
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub message: String,
    pub success: bool,
}

impl Message {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
        }
    }
}

impl TableDisplay for Message {
    fn to_table(&self) -> String {
        if self.success {
            format!("✓ {}", self.message)
        } else {
            format!("✗ {}", self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AppliedFan, FanCurve, FanRequest, SettingRequest};
    use chrono::Utc;

    fn applied() -> AppliedSetting {
        AppliedSetting {
            device_index: 0,
            power_limit_watts: Some(300),
            core_clock_offset_mhz: Some(150),
            mem_clock_offset_mhz: None,
            fan: Some(AppliedFan::Auto),
            updated_at: Utc::now(),
        }
    }

    fn sample() -> TelemetrySample {
        TelemetrySample {
            device_index: 0,
            timestamp: Utc::now(),
            temperature_c: 64,
            power_watts: Some(212.4),
            core_clock_mhz: 1950,
            mem_clock_mhz: 10501,
            fan_rpm: vec![1500],
            fan_duty_percent: vec![50],
            utilization_percent: Some(97),
        }
    }

    #[test]
    fn test_gpu_status_table() {
        let status = GpuStatus {
            index: 0,
            name: "NVIDIA GeForce RTX 4090".to_string(),
            telemetry: Some(FeedEntry::Fresh { sample: sample() }),
            applied: applied(),
        };

        let table = status.to_table();
        assert!(table.contains("Temperature: 64°C"));
        assert!(table.contains("212.4W"));
        assert!(table.contains("Fan 0: 50% (1500 RPM)"));
        assert!(table.contains("Core Offset: +150 MHz"));
        assert!(table.contains("Memory Offset: n/a"));
        assert!(status.to_compact().starts_with("0:NVIDIA GeForce RTX 4090 64°C"));
    }

    #[test]
    fn test_stale_telemetry_is_flagged() {
        let status = GpuStatus {
            index: 1,
            name: "GPU".to_string(),
            telemetry: Some(FeedEntry::Stale {
                last: Some(sample()),
                reason: "timed out".to_string(),
                since: Utc::now(),
            }),
            applied: applied(),
        };
        let table = status.to_table();
        assert!(table.contains("stale (timed out)"));
        assert!(table.contains("64°C"));
    }

    #[test]
    fn test_profile_list() {
        let list = ProfileList {
            profiles: vec![
                ProfileEntry {
                    name: "Gaming".to_string(),
                    description: String::new(),
                    preset: false,
                    default: true,
                },
                ProfileEntry {
                    name: "Quiet".to_string(),
                    description: "Low noise".to_string(),
                    preset: true,
                    default: false,
                },
            ],
        };
        let table = list.to_table();
        assert!(table.starts_with("* Gaming"));
        assert!(table.contains("Quiet (preset) - Low noise"));
        assert_eq!(list.to_compact(), "Gaming, Quiet");
    }

    #[test]
    fn test_profile_view_curve() {
        let view = ProfileView {
            profile: Profile::new(
                "Curve",
                SettingRequest::new().with_fan(FanRequest::custom(FanCurve::default_curve())),
            ),
            default: false,
        };
        let table = view.to_table();
        assert!(table.contains("Fan: custom curve"));
        assert!(table.contains("85°C -> 100%"));
        assert!(table.contains("Power Limit: unchanged"));
    }

    #[test]
    fn test_message_display() {
        assert!(Message::ok("Operation completed").to_table().starts_with('✓'));
    }
}
