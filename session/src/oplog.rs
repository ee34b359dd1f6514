//! Structured per-exchange operation log.
//!
//! Every completed exchange emits one line, classified by which sides of
//! the exchange exist and what the outbound packet was. Calls slower than
//! the configured threshold log at warn with a `(slow)` tag; status codes
//! are ANSI-colored by band.

use std::time::Duration;
use tether_wire::{Packet, PacketType};
use tracing::{info, warn};

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_RED: &str = "\x1b[31m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_MAGENTA: &str = "\x1b[35m";
const COLOR_GREY: &str = "\x1b[90m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    PushLaunch,
    PushHandle,
    PullLaunch,
    PullHandle,
}

impl Kind {
    fn tag(self) -> &'static str {
        match self {
            Kind::PushLaunch => "push-launch",
            Kind::PushHandle => "push-handle",
            Kind::PullLaunch => "pull-launch",
            Kind::PullHandle => "pull-handle",
        }
    }
}

fn classify(input: Option<&Packet>, output: Option<&Packet>) -> Option<Kind> {
    let out_type = output.and_then(|p| p.header.packet_type());
    let in_type = input.and_then(|p| p.header.packet_type());
    if input.is_none() || out_type == Some(PacketType::Push) {
        output?;
        return Some(Kind::PushLaunch);
    }
    if output.is_none() || in_type == Some(PacketType::Push) {
        return Some(Kind::PushHandle);
    }
    match out_type {
        Some(PacketType::Pull) => Some(Kind::PullLaunch),
        Some(PacketType::PullReply) => Some(Kind::PullHandle),
        _ => None,
    }
}

/// Color a status code by band
fn color_code(code: i32) -> String {
    let color = if code >= 500 || code < 200 {
        COLOR_RED
    } else if code >= 400 {
        COLOR_MAGENTA
    } else if code >= 300 {
        COLOR_GREY
    } else {
        COLOR_GREEN
    };
    format!("{color}{code}{COLOR_RESET}")
}

/// Pretty rendering of a packet body for the log
fn body_text(packet: &Packet) -> String {
    if packet.body.is_empty() {
        return "(empty)".into();
    }
    match packet.decode_body::<serde_json::Value>() {
        Ok(value) => {
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| "<unrenderable>".into())
        }
        Err(_) => format!("({} bytes)", packet.body.len()),
    }
}

/// Emit one operation-log line for a completed exchange.
///
/// `input` is the packet received on this session (a request for handle
/// kinds, the reply for pull-launch); `output` is the packet sent.
pub(crate) fn exchange(
    remote: &str,
    slow_after: Duration,
    print_body: bool,
    cost: Duration,
    input: Option<&Packet>,
    output: Option<&Packet>,
) {
    let Some(kind) = classify(input, output) else {
        return;
    };
    let slow = cost >= slow_after;
    let slow_tag = if slow { "(slow)" } else { "" };

    let uri = match kind {
        Kind::PushLaunch | Kind::PullLaunch => output.map(|p| p.header.uri.as_str()),
        Kind::PushHandle | Kind::PullHandle => input.map(|p| p.header.uri.as_str()),
    }
    .unwrap_or("");

    let mut line = format!(
        "[{}] remote: {} | cost: {:?}{} | uri: {:<30} |",
        kind.tag(),
        remote,
        cost,
        slow_tag,
        uri,
    );
    match kind {
        Kind::PushLaunch => {
            if let Some(out) = output {
                line.push_str(&format!(" SEND {}B", out.wire_len));
                if print_body {
                    line.push_str(&format!("\nSEND body: {}", body_text(out)));
                }
            }
        }
        Kind::PushHandle => {
            if let Some(inp) = input {
                line.push_str(&format!(" RECV {}B", inp.wire_len));
                if print_body {
                    line.push_str(&format!("\nRECV body: {}", body_text(inp)));
                }
            }
        }
        Kind::PullLaunch => {
            if let (Some(inp), Some(out)) = (input, output) {
                line.push_str(&format!(
                    " SEND {}B | RECV {} {} {}B",
                    out.wire_len,
                    color_code(inp.header.status_code),
                    inp.header.status,
                    inp.wire_len,
                ));
                if print_body {
                    line.push_str(&format!(
                        "\nSEND body: {}\nRECV body: {}",
                        body_text(out),
                        body_text(inp),
                    ));
                }
            }
        }
        Kind::PullHandle => {
            if let (Some(inp), Some(out)) = (input, output) {
                line.push_str(&format!(
                    " RECV {}B | SEND {} {} {}B",
                    inp.wire_len,
                    color_code(out.header.status_code),
                    out.header.status,
                    out.wire_len,
                ));
                if print_body {
                    line.push_str(&format!(
                        "\nRECV body: {}\nSEND body: {}",
                        body_text(inp),
                        body_text(out),
                    ));
                }
            }
        }
    }

    if slow {
        warn!("{}", line);
    } else {
        info!("{}", line);
    }
}
