//
// wire.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Binary websocket framing for Jupyter messages.
//!
//! Each websocket frame carries exactly one message. A frame starts with a
//! little-endian u64 segment count, followed by one little-endian u64 end
//! offset per segment (absolute, measured from the start of the frame), then
//! the segments themselves: the channel name, the header, parent header,
//! metadata and content as JSON, and finally any binary buffers.

use std::str::FromStr;

use crate::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};

/// Number of fixed (non-buffer) segments in a frame.
const FIXED_SEGMENTS: usize = 5;

/// Frame a message for transmission.
pub fn to_frame(msg: &JupyterMessage) -> Result<Vec<u8>, anyhow::Error> {
    let mut segments: Vec<Vec<u8>> = Vec::with_capacity(FIXED_SEGMENTS + msg.buffers.len());
    segments.push(msg.channel.to_string().into_bytes());
    segments.push(serde_json::to_vec(&msg.header)?);
    match &msg.parent_header {
        Some(parent) => segments.push(serde_json::to_vec(parent)?),
        None => segments.push(b"{}".to_vec()),
    }
    segments.push(serde_json::to_vec(&msg.metadata)?);
    segments.push(serde_json::to_vec(&msg.content)?);
    for buffer in &msg.buffers {
        segments.push(buffer.clone());
    }

    let count = segments.len();
    let header_len = 8 * (1 + count);
    let body_len: usize = segments.iter().map(|s| s.len()).sum();

    let mut frame = Vec::with_capacity(header_len + body_len);
    frame.extend_from_slice(&(count as u64).to_le_bytes());
    let mut offset = header_len;
    for segment in &segments {
        offset += segment.len();
        frame.extend_from_slice(&(offset as u64).to_le_bytes());
    }
    for segment in &segments {
        frame.extend_from_slice(segment);
    }
    Ok(frame)
}

/// Decode a single frame back into a message.
pub fn from_frame(data: &[u8]) -> Result<JupyterMessage, anyhow::Error> {
    if data.len() < 8 {
        anyhow::bail!("frame too short ({} bytes)", data.len());
    }
    let count = u64::from_le_bytes(data[0..8].try_into()?);
    // Each offset takes 8 bytes, which bounds any plausible segment count
    if count > (data.len() as u64) / 8 {
        anyhow::bail!("frame claims {} segments in {} bytes", count, data.len());
    }
    let count = count as usize;
    if count < FIXED_SEGMENTS {
        anyhow::bail!("frame has {} segments; expected at least {}", count, FIXED_SEGMENTS);
    }
    let header_len = 8 * (1 + count);
    if data.len() < header_len {
        anyhow::bail!("frame too short for {} segment offsets", count);
    }

    let mut segments: Vec<&[u8]> = Vec::with_capacity(count);
    let mut start = header_len;
    for i in 0..count {
        let field = 8 * (1 + i);
        let end = u64::from_le_bytes(data[field..field + 8].try_into()?) as usize;
        if end < start || end > data.len() {
            anyhow::bail!("segment {} has invalid bounds ({}..{})", i, start, end);
        }
        segments.push(&data[start..end]);
        start = end;
    }

    let channel = JupyterChannel::from_str(std::str::from_utf8(segments[0])?)
        .map_err(|e| anyhow::anyhow!(e))?;
    let header: JupyterMessageHeader = serde_json::from_slice(segments[1])?;
    let parent_header = parse_parent_header(segments[2])?;
    let metadata: serde_json::Value = serde_json::from_slice(segments[3])?;
    let content: serde_json::Value = serde_json::from_slice(segments[4])?;
    let buffers = segments[FIXED_SEGMENTS..]
        .iter()
        .map(|s| s.to_vec())
        .collect();

    Ok(JupyterMessage {
        header,
        parent_header,
        channel,
        content,
        metadata,
        buffers,
    })
}

fn parse_parent_header(buf: &[u8]) -> Result<Option<JupyterMessageHeader>, anyhow::Error> {
    let value: serde_json::Value = serde_json::from_slice(buf)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(ref map) if map.is_empty() => Ok(None),
        other => Ok(Some(serde_json::from_value(other)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jupyter_message::MessageOptions;

    fn message(buffers: Vec<Vec<u8>>) -> JupyterMessage {
        JupyterMessage::create(
            MessageOptions {
                msg_type: "execute_request".to_string(),
                channel: JupyterChannel::Shell,
                username: "testuser".to_string(),
                session: "c1".to_string(),
                msg_id: None,
            },
            serde_json::json!({"code": "print(1)"}),
            serde_json::json!({"tag": "t"}),
            buffers,
        )
    }

    #[test]
    fn test_frame_round_trip() {
        let msg = message(vec![]);
        let frame = to_frame(&msg).unwrap();
        let parsed = from_frame(&frame).unwrap();
        assert_eq!(parsed.header, msg.header);
        assert_eq!(parsed.channel, msg.channel);
        assert_eq!(parsed.content, msg.content);
        assert_eq!(parsed.metadata, msg.metadata);
        assert!(parsed.parent_header.is_none());
        assert!(parsed.buffers.is_empty());
    }

    #[test]
    fn test_frame_carries_buffers() {
        let msg = message(vec![vec![1, 2, 3], vec![0xff; 16]]);
        let frame = to_frame(&msg).unwrap();
        let parsed = from_frame(&frame).unwrap();
        assert_eq!(parsed.buffers.len(), 2);
        assert_eq!(parsed.buffers[0], vec![1, 2, 3]);
        assert_eq!(parsed.buffers[1], vec![0xff; 16]);
    }

    #[test]
    fn test_frame_preserves_parent_header() {
        let mut msg = message(vec![]);
        let parent = message(vec![]);
        msg.parent_header = Some(parent.header.clone());
        let frame = to_frame(&msg).unwrap();
        let parsed = from_frame(&frame).unwrap();
        assert_eq!(parsed.parent_header, Some(parent.header));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(from_frame(&[]).is_err());
        assert!(from_frame(&[0, 0, 0]).is_err());

        // A count that promises more offsets than the frame holds
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&(12u64).to_le_bytes());
        bogus.extend_from_slice(&(64u64).to_le_bytes());
        assert!(from_frame(&bogus).is_err());
    }
}
