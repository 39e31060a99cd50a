//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode backend commands and parse server responses without
//! external dependencies, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Responses are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//!
//! TTLs travel in milliseconds (`PX`, `PEXPIRE`, `PTTL`) so sub-second
//! expirations survive the round trip.

use std::io::BufRead;
use std::time::Duration;

use skv_common::{BackendError, BackendResult, Command, KeyTtl, Reply};

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Appends the wire form of a backend command to `out`.
pub fn encode(command: &Command, out: &mut Vec<u8>) {
    let verb = command.name().as_bytes();
    match command {
        Command::Get { key }
        | Command::Del { key }
        | Command::Ttl { key }
        | Command::HGetAll { key } => encode_command(&[verb, key.as_bytes()], out),
        Command::Set { key, value, ttl } => encode_set(key, value, *ttl, false, out),
        Command::SetNx { key, value, ttl } => encode_set(key, value, *ttl, true, out),
        Command::Rename { key, new_key } => {
            encode_command(&[verb, key.as_bytes(), new_key.as_bytes()], out)
        }
        Command::Expire { key, ttl } => {
            let (millis, len) = encode_i64(duration_millis(*ttl));
            encode_command(&[verb, key.as_bytes(), &millis[..len]], out)
        }
        Command::MGet { keys } => {
            let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
            args.push(verb);
            args.extend(keys.iter().map(|key| key.as_bytes()));
            encode_command(&args, out)
        }
        Command::RPush { key, value } => encode_command(&[verb, key.as_bytes(), value.as_slice()], out),
        Command::LRange { key, start, stop } | Command::LTrim { key, start, stop } => {
            let (start, start_len) = encode_i64(*start);
            let (stop, stop_len) = encode_i64(*stop);
            encode_command(
                &[verb, key.as_bytes(), &start[..start_len], &stop[..stop_len]],
                out,
            )
        }
        Command::HSet { key, field, value } => {
            encode_command(&[verb, key.as_bytes(), field.as_bytes(), value.as_slice()], out)
        }
    }
}

fn encode_set(key: &str, value: &[u8], ttl: Option<Duration>, nx: bool, out: &mut Vec<u8>) {
    let mut args: Vec<&[u8]> = Vec::with_capacity(6);
    args.push(b"SET");
    args.push(key.as_bytes());
    args.push(value);
    let millis = ttl.map(|ttl| encode_i64(duration_millis(ttl)));
    if let Some((buf, len)) = millis.as_ref() {
        args.push(b"PX");
        args.push(&buf[..*len]);
    }
    if nx {
        args.push(b"NX");
    }
    encode_command(&args, out);
}

/// Maps a raw response onto the reply shape expected for `command`.
pub fn interpret(command: &Command, value: RespValue) -> BackendResult<Reply> {
    match value {
        RespValue::Error(message) => Err(server_error(message)),
        RespValue::Simple(_) => Ok(Reply::Ok),
        RespValue::Bulk(None) => Ok(Reply::Nil),
        RespValue::Bulk(Some(data)) => Ok(Reply::Bulk(data)),
        RespValue::Integer(value) => match command {
            Command::Ttl { .. } => Ok(Reply::Ttl(match value {
                -2 => KeyTtl::Missing,
                -1 => KeyTtl::NoExpiry,
                millis if millis >= 0 => KeyTtl::ExpiresIn(Duration::from_millis(millis as u64)),
                _ => return Err(BackendError::UnexpectedResponse),
            })),
            _ => Ok(Reply::Integer(value)),
        },
        RespValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    RespValue::Bulk(data) => out.push(data),
                    _ => return Err(BackendError::UnexpectedResponse),
                }
            }
            Ok(Reply::Array(out))
        }
    }
}

fn server_error(message: Vec<u8>) -> BackendError {
    let text = String::from_utf8_lossy(&message).into_owned();
    if text.starts_with("WRONGTYPE") {
        BackendError::WrongType
    } else if text == "ERR no such key" {
        BackendError::NoSuchKey
    } else {
        BackendError::Server(text)
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> BackendResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(BackendError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        _ => Err(BackendError::Protocol),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> BackendResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(BackendError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> BackendResult<RespValue> {
    if len <= 0 {
        return Ok(RespValue::Array(Vec::new()));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> BackendResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(BackendError::Protocol);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(BackendError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> BackendResult<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some(_) => (false, data),
        None => return Err(BackendError::Protocol),
    };
    if digits.is_empty() {
        return Err(BackendError::Protocol);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(BackendError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

fn duration_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn encode_i64(value: i64) -> ([u8; 21], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 21];
    let mut len = 0;
    let mut magnitude = value.unsigned_abs();
    if magnitude == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while magnitude > 0 {
        buf[len] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        len += 1;
    }
    if value < 0 {
        buf[len] = b'-';
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
