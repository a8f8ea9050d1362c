use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 能力表中的取值。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapabilityValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for CapabilityValue {
    fn from(value: bool) -> Self {
        CapabilityValue::Bool(value)
    }
}

impl From<i64> for CapabilityValue {
    fn from(value: i64) -> Self {
        CapabilityValue::Int(value)
    }
}

impl From<&str> for CapabilityValue {
    fn from(value: &str) -> Self {
        CapabilityValue::Str(value.to_owned())
    }
}

/// 能力表解码失败的原因。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability map truncated")]
    Truncated,
    #[error("capability key or value is not utf-8")]
    InvalidUtf8,
    #[error("unknown capability value tag {0}")]
    UnknownTag(u8),
}

const TAG_BOOL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_STR: u8 = 2;

/// 字符串键到取值的能力表，连接建立后由对端声明。
///
/// 编码：`u32` 条目数，随后每个条目为 `u32` 键长 + 键 + `u8` 标签 + 取值；
/// 整数为 `i64` 小端，字符串为 `u32` 长度 + 字节，布尔为单字节。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilityMap {
    entries: BTreeMap<String, CapabilityValue>,
}

impl CapabilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<CapabilityValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&CapabilityValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CapabilityValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// 合并另一张表，同名键以新值为准。
    pub fn merge(&mut self, other: CapabilityMap) {
        self.entries.extend(other.entries);
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u32_le(self.entries.len() as u32);
        for (key, value) in &self.entries {
            put_str(&mut out, key);
            match value {
                CapabilityValue::Bool(flag) => {
                    out.put_u8(TAG_BOOL);
                    out.put_u8(u8::from(*flag));
                }
                CapabilityValue::Int(number) => {
                    out.put_u8(TAG_INT);
                    out.put_i64_le(*number);
                }
                CapabilityValue::Str(text) => {
                    out.put_u8(TAG_STR);
                    put_str(&mut out, text);
                }
            }
        }
        out.freeze()
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, CapabilityError> {
        let count = take_u32(&mut input)?;
        let mut map = CapabilityMap::new();
        for _ in 0..count {
            let key = take_str(&mut input)?;
            if input.remaining() < 1 {
                return Err(CapabilityError::Truncated);
            }
            let value = match input.get_u8() {
                TAG_BOOL => {
                    if input.remaining() < 1 {
                        return Err(CapabilityError::Truncated);
                    }
                    CapabilityValue::Bool(input.get_u8() != 0)
                }
                TAG_INT => {
                    if input.remaining() < 8 {
                        return Err(CapabilityError::Truncated);
                    }
                    CapabilityValue::Int(input.get_i64_le())
                }
                TAG_STR => CapabilityValue::Str(take_str(&mut input)?),
                other => return Err(CapabilityError::UnknownTag(other)),
            };
            map.entries.insert(key, value);
        }
        Ok(map)
    }
}

fn put_str(out: &mut BytesMut, text: &str) {
    out.put_u32_le(text.len() as u32);
    out.put_slice(text.as_bytes());
}

fn take_u32(input: &mut &[u8]) -> Result<u32, CapabilityError> {
    if input.remaining() < 4 {
        return Err(CapabilityError::Truncated);
    }
    Ok(input.get_u32_le())
}

fn take_str(input: &mut &[u8]) -> Result<String, CapabilityError> {
    let len = take_u32(input)? as usize;
    if input.remaining() < len {
        return Err(CapabilityError::Truncated);
    }
    let (head, tail) = input.split_at(len);
    let text = std::str::from_utf8(head)
        .map_err(|_| CapabilityError::InvalidUtf8)?
        .to_owned();
    *input = tail;
    Ok(text)
}
