//! Parsers for G-code words and firmware status replies
//!
//! Every parser is lenient: a malformed report yields `None` (or an empty
//! report) and the caller skips it.

use printlink_core::{FirmwareType, Position, MAX_EXTRUDERS};

/// Number following the first occurrence of `key` in `line`
///
/// Spaces between the key and the number are skipped. Accepts an optional
/// sign and a decimal fraction.
pub fn first_number_after(key: &str, line: &str) -> Option<f64> {
    let start = line.find(key)? + key.len();
    let (begin, end) = number_span(line, start)?;
    line[begin..end].parse().ok()
}

fn number_span(line: &str, from: usize) -> Option<(usize, usize)> {
    let bytes = line.as_bytes();
    let mut begin = from;
    while begin < bytes.len() && bytes[begin] == b' ' {
        begin += 1;
    }
    let mut end = begin;
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let digits_start = end;
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    let has_digit = line[digits_start..end].bytes().any(|b| b.is_ascii_digit());
    has_digit.then_some((begin, end))
}

/// Format a value the way firmware-bound G-code carries it: up to five
/// decimals, no trailing zeros
pub fn format_number(value: f64) -> String {
    let text = format!("{:.5}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

/// Replace the number after the first `key` character with `value`
pub fn replace_number_after(key: char, line: &str, value: f64) -> String {
    let Some(at) = line.find(key) else {
        return line.to_string();
    };
    let from = at + key.len_utf8();
    match number_span(line, from) {
        Some((_, end)) => format!("{}{}{}", &line[..from], format_number(value), &line[end..]),
        None => line.to_string(),
    }
}

/// Temperatures carried by one status line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemperatureReport {
    /// `(extruder index, reading)` pairs
    pub extruders: Vec<(usize, f64)>,
    /// Bed reading
    pub bed: Option<f64>,
}

/// Parse `T:` / `T<n>:` / `B:` readings
///
/// `T:` is extruder 0. Indexed readings are taken from `T0:` upward until
/// the first missing index.
pub fn parse_temperatures(line: &str) -> TemperatureReport {
    let mut report = TemperatureReport::default();
    if let Some(value) = first_number_after("T:", line) {
        report.extruders.push((0, value));
    }
    for index in 0..MAX_EXTRUDERS {
        match first_number_after(&format!("T{}:", index), line) {
            Some(value) => report.extruders.push((index, value)),
            None => break,
        }
    }
    report.bed = first_number_after("B:", line);
    report
}

/// Parse an `M114` style `X: Y: Z:` report. Missing axes read as zero.
pub fn parse_position(line: &str) -> Position {
    Position::new(
        first_number_after("X:", line).unwrap_or(0.0),
        first_number_after("Y:", line).unwrap_or(0.0),
        first_number_after("Z:", line).unwrap_or(0.0),
    )
}

/// Parse `SD printing byte <current>/<total>`
pub fn parse_sd_progress(line: &str) -> Option<(u64, u64)> {
    const PREFIX_LEN: usize = "SD printing byte ".len();
    let rest = line.get(PREFIX_LEN..)?;
    let (current, total) = rest.split_once('/')?;
    Some((current.trim().parse().ok()?, total.trim().parse().ok()?))
}

/// Sequence number of a `Resend:` or `RS:` request
pub fn parse_resend(line: &str) -> Option<usize> {
    ["Resend:", "RS:"]
        .iter()
        .find_map(|key| first_number_after(key, line))
        .filter(|n| *n >= 0.0)
        .map(|n| n as usize)
}

/// What an `M115` reply says about the firmware
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirmwareReport {
    /// Family, when recognised
    pub firmware_type: Option<FirmwareType>,
    /// Version text
    pub version: Option<String>,
    /// Device code when the version read `code^version`
    pub device_code: Option<String>,
    /// Firmware accepts SD prints addressed by URI
    pub uri_gcode_send: bool,
}

/// Parse a `FIRMWARE_NAME:` line
pub fn parse_firmware(line: &str) -> FirmwareReport {
    let mut report = FirmwareReport {
        uri_gcode_send: line.contains("URI_GCODE_SEND"),
        ..Default::default()
    };

    let Some(at) = line.find("FIRMWARE_NAME:") else {
        return report;
    };
    let rest = &line[at + "FIRMWARE_NAME:".len()..];

    let name = rest.split_whitespace().next().unwrap_or("").to_lowercase();
    report.firmware_type = if name.contains("repetier") {
        Some(FirmwareType::Repetier)
    } else if name.contains("marlin") {
        Some(FirmwareType::Marlin)
    } else if name.contains("sprinter") {
        Some(FirmwareType::Sprinter)
    } else {
        None
    };

    let end = ["SOURCE_CODE_URL", "PROTOCOL_VERSION", "MACHINE_TYPE"]
        .iter()
        .filter_map(|marker| rest.find(marker))
        .min()
        .unwrap_or(rest.len());
    let version = rest[..end].trim();
    if !version.is_empty() {
        match version.split_once('^') {
            Some((code, version)) if !version.contains('^') => {
                report.device_code = Some(code.trim().to_string());
                report.version = Some(version.trim().to_string());
            }
            _ => report.version = Some(version.to_string()),
        }
    }
    report
}
