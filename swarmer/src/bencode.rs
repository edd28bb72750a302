//! Thin accessors over [`serde_bencode::value::Value`] for payloads whose shape
//! does not map cleanly onto a serde struct (binary keys, optional alternatives).

use std::collections::HashMap;

pub use serde_bencode::value::Value;

pub fn decode(buf: &[u8]) -> std::io::Result<Value> {
    serde_bencode::from_bytes(buf).map_err(|err| invalid(err.to_string()))
}

pub fn encode<T: serde::Serialize>(value: &T) -> std::io::Result<Vec<u8>> {
    serde_bencode::to_bytes(value).map_err(std::io::Error::other)
}

pub fn invalid(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

pub fn as_int(value: &Value) -> std::io::Result<i64> {
    match value {
        Value::Int(v) => Ok(*v),
        _ => Err(invalid("expected integer")),
    }
}

pub fn as_bytes(value: &Value) -> std::io::Result<&[u8]> {
    match value {
        Value::Bytes(v) => Ok(v),
        _ => Err(invalid("expected byte string")),
    }
}

pub fn as_str(value: &Value) -> std::io::Result<&str> {
    std::str::from_utf8(as_bytes(value)?).map_err(|_| invalid("byte string contains invalid utf-8"))
}

pub fn as_list(value: &Value) -> std::io::Result<&[Value]> {
    match value {
        Value::List(v) => Ok(v),
        _ => Err(invalid("expected list")),
    }
}

/// The raw encoded bytes of the value stored under `key` in the top level dictionary of `buf`.
pub fn raw_dict_value<'a>(buf: &'a [u8], key: &[u8]) -> std::io::Result<Option<&'a [u8]>> {
    if buf.first() != Some(&b'd') {
        return Err(invalid("expected dictionary"));
    }
    let mut pos = 1;
    while buf.get(pos) != Some(&b'e') {
        let (entry_key, value_start) = raw_string(buf, pos)?;
        let value_end = raw_value_end(buf, value_start)?;
        if entry_key == key {
            return Ok(Some(&buf[value_start..value_end]));
        }
        pos = value_end;
    }
    Ok(None)
}

/// Parse the byte string starting at `pos`, returning it and the position after it.
fn raw_string(buf: &[u8], pos: usize) -> std::io::Result<(&[u8], usize)> {
    let colon = buf[pos.min(buf.len())..]
        .iter()
        .position(|&b| b == b':')
        .map(|offset| pos + offset)
        .ok_or_else(|| invalid("unterminated string length"))?;
    let length = std::str::from_utf8(&buf[pos..colon])
        .ok()
        .and_then(|digits| digits.parse::<usize>().ok())
        .ok_or_else(|| invalid("invalid string length"))?;
    let end = colon
        .checked_add(1 + length)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| invalid("string past end of input"))?;
    Ok((&buf[colon + 1..end], end))
}

/// Position just past the value starting at `pos`.
fn raw_value_end(buf: &[u8], mut pos: usize) -> std::io::Result<usize> {
    let mut depth = 0usize;
    loop {
        match buf.get(pos) {
            Some(b'i') => {
                let end = buf[pos..]
                    .iter()
                    .position(|&b| b == b'e')
                    .ok_or_else(|| invalid("unterminated integer"))?;
                pos += end + 1;
            }
            Some(b'l') | Some(b'd') => {
                depth += 1;
                pos += 1;
                continue;
            }
            Some(b'e') if depth > 0 => {
                depth -= 1;
                pos += 1;
            }
            Some(b'0'..=b'9') => pos = raw_string(buf, pos)?.1,
            _ => return Err(invalid("malformed value")),
        }
        if depth == 0 {
            return Ok(pos);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Dict<'a>(&'a HashMap<Vec<u8>, Value>);

impl<'a> Dict<'a> {
    pub fn from_value(value: &'a Value) -> std::io::Result<Self> {
        match value {
            Value::Dict(dict) => Ok(Self(dict)),
            _ => Err(invalid("expected dictionary")),
        }
    }

    pub fn find_value(&self, key: &[u8]) -> Option<&'a Value> {
        self.0.get(key)
    }

    pub fn require_value(&self, key: &[u8]) -> std::io::Result<&'a Value> {
        self.find_value(key).ok_or_else(|| {
            invalid(format!(
                "missing key '{}'",
                String::from_utf8_lossy(key)
            ))
        })
    }

    pub fn find_int(&self, key: &[u8]) -> std::io::Result<Option<i64>> {
        self.find_value(key).map(as_int).transpose()
    }

    pub fn require_int(&self, key: &[u8]) -> std::io::Result<i64> {
        as_int(self.require_value(key)?)
    }

    pub fn require_bytes(&self, key: &[u8]) -> std::io::Result<&'a [u8]> {
        as_bytes(self.require_value(key)?)
    }

    pub fn find_str(&self, key: &[u8]) -> std::io::Result<Option<&'a str>> {
        self.find_value(key).map(as_str).transpose()
    }

    pub fn require_str(&self, key: &[u8]) -> std::io::Result<&'a str> {
        as_str(self.require_value(key)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dict_access() {
        let value = decode(b"d3:fooi42e3:bar4:spam4:listli1ei2eee").unwrap();
        let dict = Dict::from_value(&value).unwrap();
        assert_eq!(dict.require_int(b"foo").unwrap(), 42);
        assert_eq!(dict.require_str(b"bar").unwrap(), "spam");
        assert_eq!(as_list(dict.require_value(b"list").unwrap()).unwrap().len(), 2);
        assert_eq!(dict.find_int(b"missing").unwrap(), None);
        assert!(dict.require_int(b"bar").is_err());
    }

    #[test]
    fn raw_value_keeps_original_bytes() {
        let buf = b"d1:ai1e4:infod1:zi1e1:al2:xyee1:ble";
        assert_eq!(
            raw_dict_value(buf, b"info").unwrap(),
            Some(&b"d1:zi1e1:al2:xyee"[..])
        );
        assert_eq!(raw_dict_value(buf, b"b").unwrap(), Some(&b"le"[..]));
        assert_eq!(raw_dict_value(buf, b"missing").unwrap(), None);
        assert!(raw_dict_value(b"d4:infod", b"info").is_err());
    }

    #[test]
    fn malformed_input() {
        let err = decode(b"d3:foo").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
