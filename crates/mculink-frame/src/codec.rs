use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::command::Command;
use crate::crc::crc8;
use crate::error::{FrameError, Result};
use crate::message::ProtocolMessage;

/// Start-of-frame delimiter.
pub const STX: u8 = 0x55;
/// End-of-frame delimiter.
pub const ETX: u8 = 0xAA;
/// Escape prefix; an escaped byte `b` travels as `ESC, ESC ^ b`.
pub const ESC: u8 = 0x66;

/// Controller id addressing all nodes; no node may claim it.
pub const BROADCAST_ID: u8 = 0xFF;

/// Shortest well-formed frame: STX, controller, msg id, command, CRC, ETX.
pub const MIN_FRAME_LEN: usize = 6;

/// Encode a message into a wire frame.
///
/// Wire format (before escaping):
/// ```text
/// ┌─────┬────────────┬────────┬─────────┬─────────┬─────┬─────┐
/// │ STX │ Controller │ MsgId  │ Command │ Payload │ CRC │ ETX │
/// │ 1B  │ 1B         │ 1B     │ 1B      │ N bytes │ 1B  │ 1B  │
/// └─────┴────────────┴────────┴─────────┴─────────┴─────┴─────┘
/// ```
/// The CRC covers controller id through payload. Everything between the
/// delimiters is escaped, so STX and ETX appear on the wire only as frame
/// boundaries.
pub fn encode_message(msg: &ProtocolMessage) -> Result<Vec<u8>> {
    let command = msg.command.ok_or(FrameError::MissingCommand)?;

    let mut body = Vec::with_capacity(msg.payload.len() + 4);
    body.push(msg.controller_id);
    body.push(msg.msg_id);
    body.push(command.as_byte());
    body.extend_from_slice(&msg.payload);
    body.push(crc8(&body));

    let mut wire = Vec::with_capacity(body.len() + 2);
    wire.push(STX);
    for &b in &body {
        if b == STX || b == ETX || b == ESC {
            wire.push(ESC);
            wire.push(ESC ^ b);
        } else {
            wire.push(b);
        }
    }
    wire.push(ETX);
    Ok(wire)
}

/// Drain all complete frames out of `buf`, leaving the remainder in place.
///
/// The caller appends each raw chunk to `buf` and calls this; bytes that do
/// not yet form a complete frame stay in `buf` for the next call, so
/// framing is stateful across arbitrarily-split chunks.
///
/// Resynchronization rule: the scanner tracks the *latest* STX seen before
/// the first subsequent ETX, which skips past spurious STX bytes inside
/// line noise. A candidate span too short to be a frame is dropped and
/// scanning resumes past its ETX. Validation failures on a plausible span
/// yield a message with `invalid_reason` set — no byte range is ever lost
/// silently: it ends up in a message or in the remainder.
pub fn decode_messages(buf: &mut BytesMut) -> Vec<ProtocolMessage> {
    let mut messages = Vec::new();
    loop {
        let data = &buf[..];
        let mut stx_index = None;
        let mut etx_index = None;
        for (i, &b) in data.iter().enumerate() {
            if b == STX {
                stx_index = Some(i);
            } else if b == ETX && stx_index.is_some() {
                etx_index = Some(i);
                break;
            }
        }

        let (Some(stx), Some(etx)) = (stx_index, etx_index) else {
            // No terminated span; everything left is the remainder.
            return messages;
        };

        if stx + 4 < etx {
            let span = unescape(&data[stx..=etx]);
            messages.push(message_from_frame(&span));
        } else {
            trace!(span_len = etx - stx + 1, "discarding undersized frame candidate");
        }

        buf.advance(etx + 1);
        if buf.is_empty() {
            return messages;
        }
    }
}

/// Compute the CRC a well-formed frame buffer should carry: everything
/// except the leading STX and the trailing CRC and ETX positions.
pub fn calculate_crc(frame: &[u8]) -> u8 {
    if frame.len() < 3 {
        0
    } else {
        crc8(&frame[1..frame.len() - 2])
    }
}

/// Build a message from an unescaped `STX…ETX` span, recording the first
/// validation failure as the invalid reason.
fn message_from_frame(frame: &[u8]) -> ProtocolMessage {
    if frame.len() < MIN_FRAME_LEN {
        return ProtocolMessage::invalid("message too short", frame[1]);
    }
    if frame[0] != STX {
        return ProtocolMessage::invalid("message didn't start with STX", frame[1]);
    }
    if frame[frame.len() - 1] != ETX {
        return ProtocolMessage::invalid("message didn't end with ETX", frame[1]);
    }
    let Some(command) = Command::from_byte(frame[3]) else {
        return ProtocolMessage::invalid(format!("unknown command {:#04x}", frame[3]), frame[1]);
    };
    if frame[frame.len() - 2] != calculate_crc(frame) {
        return ProtocolMessage::invalid("crc mismatch", frame[1]);
    }
    ProtocolMessage::new(
        frame[1],
        frame[2],
        command,
        frame[4..frame.len() - 2].to_vec(),
    )
}

/// Collapse `ESC, x` pairs back into `ESC ^ x`. The leading STX is copied
/// untouched; a trailing lone ESC would swallow the closing ETX, which the
/// subsequent validation reports.
fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    out.push(data[0]);
    let mut i = 1;
    while i < data.len() {
        if data[i] == ESC && i + 1 < data.len() {
            out.push(ESC ^ data[i + 1]);
            i += 2;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(controller: u8, msg_id: u8, command: Command, payload: &[u8]) -> ProtocolMessage {
        ProtocolMessage::new(controller, msg_id, command, payload.to_vec())
    }

    fn decode_all(bytes: &[u8]) -> (Vec<ProtocolMessage>, Vec<u8>) {
        let mut buf = BytesMut::from(bytes);
        let messages = decode_messages(&mut buf);
        (messages, buf.to_vec())
    }

    #[test]
    fn encode_decode_roundtrip() {
        let original = msg(0x01, 0x84, Command::QueryRegister, &[0x03, 0x05, 0x07]);
        let wire = encode_message(&original).unwrap();

        let (messages, remainder) = decode_all(&wire);
        assert_eq!(messages, vec![original]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn roundtrip_with_empty_payload() {
        let original = msg(0x01, 0x34, Command::GetVersion, &[]);
        let wire = encode_message(&original).unwrap();
        assert_eq!(wire.len(), MIN_FRAME_LEN);

        let (messages, remainder) = decode_all(&wire);
        assert_eq!(messages, vec![original]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn reserved_bytes_are_escaped() {
        // Controller id, msg id and payload all collide with the framing
        // bytes; none of them may appear bare inside the frame.
        let original = msg(STX, ESC, Command::ConfigChannel, &[ETX, ESC, STX]);
        let wire = encode_message(&original).unwrap();

        for (i, &b) in wire.iter().enumerate() {
            if b == STX {
                assert!(
                    i == 0 || wire[i - 1] == ESC,
                    "bare STX at {i} inside frame"
                );
            }
            if b == ETX {
                assert!(
                    i == wire.len() - 1 || wire[i - 1] == ESC,
                    "bare ETX at {i} inside frame"
                );
            }
        }

        let (messages, remainder) = decode_all(&wire);
        assert_eq!(messages, vec![original]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn escape_pair_encoding() {
        let original = msg(ESC, ESC, Command::ConfigChannel, &[]);
        let wire = encode_message(&original).unwrap();

        assert_eq!(wire.len(), 8);
        assert_eq!(wire[1], ESC);
        assert_eq!(ESC ^ wire[2], ESC);
        assert_eq!(wire[3], ESC);
        assert_eq!(ESC ^ wire[4], ESC);
    }

    #[test]
    fn crc_flip_makes_message_invalid() {
        let original = msg(0x02, 0x11, Command::WriteRegister, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let wire = encode_message(&original).unwrap();

        // Flip one bit in every header/payload position (skip STX, CRC, ETX
        // and keep clear of values that would turn into framing bytes).
        for i in 1..wire.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = wire.clone();
                corrupted[i] ^= 1 << bit;
                if corrupted[i] == STX || corrupted[i] == ETX || corrupted[i] == ESC {
                    continue;
                }
                let (messages, _) = decode_all(&corrupted);
                assert_eq!(messages.len(), 1, "byte {i} bit {bit}");
                assert!(!messages[0].is_valid(), "byte {i} bit {bit}");
            }
        }
    }

    #[test]
    fn chunk_split_at_any_offset() {
        let original = msg(0x05, 0x42, Command::ReadChannelData, &[1, 2, 3, 4, 5]);
        let wire = encode_message(&original).unwrap();

        for split in 0..=wire.len() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&wire[..split]);
            let mut messages = decode_messages(&mut buf);
            buf.extend_from_slice(&wire[split..]);
            messages.extend(decode_messages(&mut buf));

            assert_eq!(messages, vec![original.clone()], "split at {split}");
            assert!(buf.is_empty(), "split at {split}");
        }
    }

    #[test]
    fn garbage_between_frames_is_skipped() {
        let a = msg(0x01, 0x01, Command::GetVersion, &[]);
        let b = msg(0x02, 0x02, Command::GetInfo, &[9, 9]);

        let mut wire = vec![0x00, 0x13, 0x37];
        wire.extend(encode_message(&a).unwrap());
        wire.extend([0x01, 0x02, 0x03]);
        wire.extend(encode_message(&b).unwrap());

        let (messages, remainder) = decode_all(&wire);
        assert_eq!(messages, vec![a, b]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn incomplete_frame_becomes_remainder() {
        let original = msg(0x01, 0x07, Command::DebugString, b"hello");
        let wire = encode_message(&original).unwrap();
        let cut = wire.len() - 2;

        let (messages, remainder) = decode_all(&wire[..cut]);
        assert!(messages.is_empty());
        assert_eq!(remainder, wire[..cut].to_vec());
    }

    #[test]
    fn leading_garbage_without_etx_stays_in_remainder() {
        let (messages, remainder) = decode_all(&[0x01, 0x02, STX, 0x03]);
        assert!(messages.is_empty());
        assert_eq!(remainder, vec![0x01, 0x02, STX, 0x03]);
    }

    #[test]
    fn resync_keeps_latest_stx() {
        // A spurious STX ahead of the real frame must not shift the span.
        let original = msg(0x03, 0x09, Command::Decimation, &[0x0A]);
        let wire = encode_message(&original).unwrap();

        let mut noisy = vec![STX, 0x01, 0x02];
        noisy.extend(&wire);

        let (messages, remainder) = decode_all(&noisy);
        assert_eq!(messages, vec![original]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn three_stx_before_one_etx() {
        // Only the last STX starts the candidate span.
        let original = msg(0x03, 0x0B, Command::ResetTime, &[]);
        let wire = encode_message(&original).unwrap();

        let mut noisy = vec![STX, 0x41, STX, 0x42, 0x43];
        noisy.extend(&wire);

        let (messages, remainder) = decode_all(&noisy);
        assert_eq!(messages, vec![original]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn undersized_span_discarded_without_message() {
        // STX directly followed by ETX cannot be a frame; scanning resumes
        // past the ETX and finds the real frame.
        let original = msg(0x01, 0x05, Command::GetInfo, &[]);
        let wire = encode_message(&original).unwrap();

        let mut noisy = vec![STX, 0x01, ETX];
        noisy.extend(&wire);

        let (messages, remainder) = decode_all(&noisy);
        assert_eq!(messages, vec![original]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn etx_without_stx_does_not_terminate_scan() {
        let (messages, remainder) = decode_all(&[ETX, 0x01, 0x02]);
        assert!(messages.is_empty());
        assert_eq!(remainder, vec![ETX, 0x01, 0x02]);
    }

    #[test]
    fn unknown_command_yields_invalid_message() {
        let mut frame = vec![0x00, 0x01, 0x02, 0x7F, 0x00, 0x00];
        frame[4] = calculate_crc(&frame);
        frame[0] = STX;
        frame[5] = ETX;

        let (messages, remainder) = decode_all(&frame);
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].is_valid());
        assert_eq!(messages[0].controller_id, 0x01);
        assert!(messages[0]
            .invalid_reason
            .as_deref()
            .is_some_and(|r| r.contains("unknown command")));
        assert!(remainder.is_empty());
    }

    #[test]
    fn corrupted_crc_byte_yields_invalid_message() {
        let original = msg(0x01, 0x22, Command::GetVersion, &[0x10]);
        let mut wire = encode_message(&original).unwrap();
        let crc_index = wire.len() - 2;
        wire[crc_index] ^= 0x01;
        // Keep the corruption away from framing bytes.
        assert!(wire[crc_index] != STX && wire[crc_index] != ETX && wire[crc_index] != ESC);

        let (messages, _) = decode_all(&wire);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].invalid_reason.as_deref(), Some("crc mismatch"));
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let frames: Vec<ProtocolMessage> = (1..=4)
            .map(|i| msg(i, i, Command::QueryRegister, &[i, i + 1]))
            .collect();
        let mut wire = Vec::new();
        for m in &frames {
            wire.extend(encode_message(m).unwrap());
        }

        let (messages, remainder) = decode_all(&wire);
        assert_eq!(messages, frames);
        assert!(remainder.is_empty());
    }

    #[test]
    fn calculate_crc_matches_encoder() {
        let original = msg(0x01, 0x84, Command::QueryRegister, &[0x03, 0x05, 0x07]);
        let wire = encode_message(&original).unwrap();
        // This frame has no escapes, so the wire bytes are the frame bytes.
        assert_eq!(wire[wire.len() - 2], calculate_crc(&wire));
    }

    #[test]
    fn encode_without_command_fails() {
        let bad = ProtocolMessage::invalid("synthetic", 0x01);
        assert!(matches!(
            encode_message(&bad),
            Err(FrameError::MissingCommand)
        ));
    }
}
