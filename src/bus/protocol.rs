//! linknx wire format
//!
//! Outbound writes are a single XML-ish frame terminated by a newline and an
//! EOT byte. Inbound commands are `address=value` lines.

use crate::error::{BridgeError, Result};
use crate::signal::SignalUpdate;

/// Terminates an outbound frame
pub const FRAME_TERMINATOR: &[u8] = b"\n\x04";

/// Acknowledgements containing this marker denote a rejected write
pub const ERROR_MARKER: &str = "error";

/// One decoded inbound command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundLine {
    pub address: String,
    pub value: String,
}

/// Encode a batch of updates as one write frame
pub fn encode_write(updates: &[SignalUpdate]) -> Vec<u8> {
    let mut frame = String::from("<write>");
    for update in updates {
        frame.push_str("<object id=\"");
        escape_into(&mut frame, &update.address);
        frame.push_str("\" value=\"");
        escape_into(&mut frame, &update.value);
        frame.push_str("\"/>");
    }
    frame.push_str("</write>");

    let mut bytes = frame.into_bytes();
    bytes.extend_from_slice(FRAME_TERMINATOR);
    bytes
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

/// Whether an acknowledgement line reports a failed write
pub fn ack_is_error(ack: &str) -> bool {
    ack.to_ascii_lowercase().contains(ERROR_MARKER)
}

/// Decode an inbound `address=value` line
pub fn decode_inbound(line: &str) -> Result<InboundLine> {
    let line = line.trim();
    let (address, value) = line
        .split_once('=')
        .ok_or_else(|| BridgeError::protocol(format!("missing '=' in inbound line {line:?}")))?;

    let address = address.trim();
    if address.is_empty() {
        return Err(BridgeError::protocol(format!(
            "empty address in inbound line {line:?}"
        )));
    }

    Ok(InboundLine {
        address: address.to_string(),
        value: value.trim().to_string(),
    })
}
