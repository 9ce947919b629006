//! Startup command handoff between the launcher and a container's init.
//!
//! The launcher writes exactly one frame and closes its end: a 4-byte
//! big-endian length followed by that many bytes of a JSON array holding
//! the command's argv. The init process reads one frame and nothing more.

use std::io::{Read, Write};

use capsule_common::constants::MAX_HANDOFF_BYTES;
use capsule_common::error::{CapsuleError, Result};

fn protocol(message: impl Into<String>) -> CapsuleError {
    CapsuleError::Protocol {
        message: message.into(),
    }
}

/// Serializes `argv` into one frame and writes it.
///
/// # Errors
///
/// Returns [`CapsuleError::Protocol`] if the command is empty or the frame
/// would exceed the size bound, or [`CapsuleError::ResourceSetup`] if the
/// write fails.
pub fn write_command<W: Write>(writer: &mut W, argv: &[String]) -> Result<()> {
    if argv.is_empty() {
        return Err(protocol("refusing to send an empty command"));
    }
    let payload = serde_json::to_vec(argv)?;
    if payload.len() > MAX_HANDOFF_BYTES {
        return Err(protocol(format!(
            "command is {} bytes, limit is {MAX_HANDOFF_BYTES}",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len()).map_err(|_| protocol("command too large"))?;

    writer
        .write_all(&len.to_be_bytes())
        .and_then(|()| writer.write_all(&payload))
        .and_then(|()| writer.flush())
        .map_err(|e| CapsuleError::setup("handoff write", e))
}

/// Reads one frame and decodes the command it carries.
///
/// # Errors
///
/// Returns [`CapsuleError::Protocol`] if the channel is closed before a full
/// frame arrives, the frame is empty or oversized, or the payload is not a
/// non-empty JSON array of strings.
pub fn read_command<R: Read>(reader: &mut R) -> Result<Vec<String>> {
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .map_err(|e| protocol(format!("no command received: {e}")))?;
    let len = usize::try_from(u32::from_be_bytes(header))
        .map_err(|_| protocol("frame length overflow"))?;
    if len == 0 {
        return Err(protocol("empty command frame"));
    }
    if len > MAX_HANDOFF_BYTES {
        return Err(protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_HANDOFF_BYTES}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| protocol(format!("truncated command frame: {e}")))?;
    let argv: Vec<String> = serde_json::from_slice(&payload)
        .map_err(|e| protocol(format!("malformed command: {e}")))?;
    if argv.is_empty() || argv[0].is_empty() {
        return Err(protocol("command has no program"));
    }
    Ok(argv)
}
