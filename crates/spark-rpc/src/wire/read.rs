use std::borrow::Cow;
use std::ops::Deref;

use super::error::StreamError;
use super::opcode::*;
use super::stream::{Stream, view_in};
use super::value::{Array, Map, Value};

/// 非拷贝字符串读取的结果。
///
/// - `safe == false`：视图直接借用流的某个分段，只在本次调用内、且流未被改写时有效；
/// - `safe == true`：字符串跨越分段或为空，已拷贝为独立内存，可以长期持有。
#[derive(Debug, PartialEq, Eq)]
pub struct StrView<'a> {
    text: Cow<'a, str>,
    safe: bool,
}

impl<'a> StrView<'a> {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }

    pub fn into_owned(self) -> String {
        self.text.into_owned()
    }
}

impl Deref for StrView<'_> {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

/// 非拷贝字节串读取的结果，`safe` 语义同 [`StrView`]。
#[derive(Debug, PartialEq, Eq)]
pub struct BytesView<'a> {
    bytes: Cow<'a, [u8]>,
    safe: bool,
}

impl<'a> BytesView<'a> {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }

    pub fn into_owned(self) -> Vec<u8> {
        self.bytes.into_owned()
    }
}

impl Deref for BytesView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

/// 非空容器头部的解析结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ContainerHeader {
    pub is_map: bool,
    pub count: usize,
    pub head_len: usize,
    pub total: usize,
}

/// 字符串 / 字节串正文所在区间。
#[derive(Clone, Copy)]
struct Span {
    start: usize,
    len: usize,
    total: usize,
}

impl Stream {
    pub fn peek_opcode(&self) -> Option<u8> {
        self.byte_at(self.read_pos)
    }

    /// 读游标处值的类型名；到达末尾时为 `"<eof>"`。
    pub fn peek_type_name(&self) -> &'static str {
        self.peek_opcode().map_or("<eof>", opcode_type_name)
    }

    fn opcode_at(&self, pos: usize) -> Result<u8, StreamError> {
        self.byte_at(pos).ok_or(StreamError::Truncated)
    }

    fn mismatch(&self, pos: usize, expected: &'static str) -> StreamError {
        match self.byte_at(pos) {
            Some(op) => StreamError::TypeMismatch {
                expected,
                found: opcode_type_name(op),
            },
            None => StreamError::Truncated,
        }
    }

    fn bounded(&self, pos: usize, total: usize) -> Result<usize, StreamError> {
        if pos + total > self.write_pos {
            Err(StreamError::Truncated)
        } else {
            Ok(total)
        }
    }

    /// `pos` 处完整值的总长度（含操作码），不做内部结构校验。
    pub(crate) fn value_len_at(&self, pos: usize) -> Result<usize, StreamError> {
        let op = self.opcode_at(pos)?;
        match SKIP_TABLE[op as usize] {
            INVALID => Err(StreamError::InvalidOpcode(op)),
            VARIABLE => {
                let total = self.u32_at(pos + 1)? as usize;
                let min = match op {
                    ARRAY_LONG | MAP_LONG => 9,
                    STRING_LONG => 6,
                    _ => 5,
                };
                if total < min {
                    return Err(StreamError::BadLength);
                }
                self.bounded(pos, total)
            }
            fixed => self.bounded(pos, fixed as usize),
        }
    }

    pub(crate) fn container_header_at(&self, pos: usize) -> Result<ContainerHeader, StreamError> {
        let op = self.opcode_at(pos)?;
        let (is_map, count, head_len) = match op {
            ARRAY_EMPTY => (false, 0, 1),
            MAP_EMPTY => (true, 0, 1),
            o if o > ARRAY_EMPTY && o <= ARRAY_SHORT_LAST => {
                (false, (o - ARRAY_EMPTY) as usize, 5)
            }
            o if o > MAP_EMPTY && o <= MAP_SHORT_LAST => (true, (o - MAP_EMPTY) as usize, 5),
            ARRAY_LONG | MAP_LONG => {
                let count = self.u32_at(pos + 5)? as usize;
                if count <= SHORT_CONTAINER_MAX {
                    return Err(StreamError::BadLength);
                }
                (op == MAP_LONG, count, 9)
            }
            _ => return Err(self.mismatch(pos, "array or map")),
        };
        let total = if head_len == 1 {
            1
        } else {
            self.u32_at(pos + 1)? as usize
        };
        let min_body = if is_map { 2 * count } else { count };
        if total < head_len + min_body {
            return Err(StreamError::BadLength);
        }
        self.bounded(pos, total)?;
        Ok(ContainerHeader {
            is_map,
            count,
            head_len,
            total,
        })
    }

    fn string_span_at(&self, pos: usize) -> Result<Span, StreamError> {
        let op = self.opcode_at(pos)?;
        let span = match op {
            STRING_EMPTY => {
                return Ok(Span {
                    start: pos + 1,
                    len: 0,
                    total: 1,
                });
            }
            o if o > STRING_EMPTY && o <= STRING_SHORT_LAST => {
                let len = (o - STRING_EMPTY) as usize;
                Span {
                    start: pos + 1,
                    len,
                    total: len + 2,
                }
            }
            STRING_LONG => {
                let total = self.u32_at(pos + 1)? as usize;
                if total < 6 || total - 6 <= SHORT_PAYLOAD_MAX {
                    return Err(StreamError::BadLength);
                }
                Span {
                    start: pos + 5,
                    len: total - 6,
                    total,
                }
            }
            _ => return Err(self.mismatch(pos, "string")),
        };
        self.bounded(pos, span.total)?;
        if self.byte_at(span.start + span.len) != Some(0) {
            return Err(StreamError::MissingNul);
        }
        Ok(span)
    }

    fn bytes_span_at(&self, pos: usize) -> Result<Span, StreamError> {
        let op = self.opcode_at(pos)?;
        let span = match op {
            BYTES_EMPTY => Span {
                start: pos + 1,
                len: 0,
                total: 1,
            },
            o if o > BYTES_EMPTY && o <= BYTES_SHORT_LAST => {
                let len = (o - BYTES_EMPTY) as usize;
                Span {
                    start: pos + 1,
                    len,
                    total: len + 1,
                }
            }
            BYTES_LONG => {
                let total = self.u32_at(pos + 1)? as usize;
                if total < 5 || total - 5 <= SHORT_PAYLOAD_MAX {
                    return Err(StreamError::BadLength);
                }
                Span {
                    start: pos + 5,
                    len: total - 5,
                    total,
                }
            }
            _ => return Err(self.mismatch(pos, "bytes")),
        };
        self.bounded(pos, span.total)?;
        Ok(span)
    }

    pub(crate) fn bool_at(&self, pos: usize) -> Result<(bool, usize), StreamError> {
        match self.opcode_at(pos)? {
            TRUE => Ok((true, 1)),
            FALSE => Ok((false, 1)),
            _ => Err(self.mismatch(pos, "bool")),
        }
    }

    fn fixed<const N: usize>(&self, pos: usize) -> Result<[u8; N], StreamError> {
        let mut raw = [0u8; N];
        self.copy_to(pos, &mut raw)?;
        Ok(raw)
    }

    pub(crate) fn int64_at(&self, pos: usize) -> Result<(i64, usize), StreamError> {
        let op = self.opcode_at(pos)?;
        match op {
            INT64_TINY_FIRST..=INT64_TINY_LAST => Ok((op as i64 - INT64_TINY_BIAS, 1)),
            INT64_16 => {
                let raw = u16::from_le_bytes(self.fixed(pos + 1)?);
                Ok((raw as i64 - (1i64 << 15), 3))
            }
            INT64_32 => {
                let raw = u32::from_le_bytes(self.fixed(pos + 1)?);
                Ok((raw as i64 - (1i64 << 31), 5))
            }
            INT64_64 => {
                let raw = u64::from_le_bytes(self.fixed(pos + 1)?);
                Ok(((raw ^ (1u64 << 63)) as i64, 9))
            }
            _ => Err(self.mismatch(pos, "int64")),
        }
    }

    pub(crate) fn uint64_at(&self, pos: usize) -> Result<(u64, usize), StreamError> {
        let op = self.opcode_at(pos)?;
        match op {
            UINT64_TINY_FIRST..=UINT64_TINY_LAST => Ok(((op - UINT64_TINY_FIRST) as u64, 1)),
            UINT64_16 => Ok((u16::from_le_bytes(self.fixed(pos + 1)?) as u64, 3)),
            UINT64_32 => Ok((u32::from_le_bytes(self.fixed(pos + 1)?) as u64, 5)),
            UINT64_64 => Ok((u64::from_le_bytes(self.fixed(pos + 1)?), 9)),
            _ => Err(self.mismatch(pos, "uint64")),
        }
    }

    pub(crate) fn float64_at(&self, pos: usize) -> Result<(f64, usize), StreamError> {
        match self.opcode_at(pos)? {
            FLOAT64_ZERO => Ok((0.0, 1)),
            FLOAT64 => Ok((f64::from_le_bytes(self.fixed(pos + 1)?), 9)),
            _ => Err(self.mismatch(pos, "float64")),
        }
    }

    pub(crate) fn string_at(&self, pos: usize) -> Result<(String, usize), StreamError> {
        let span = self.string_span_at(pos)?;
        let raw = self.view(span.start, span.len)?.into_owned();
        let text = String::from_utf8(raw).map_err(|_| StreamError::InvalidUtf8)?;
        Ok((text, span.total))
    }

    pub(crate) fn bytes_at(&self, pos: usize) -> Result<(Vec<u8>, usize), StreamError> {
        let span = self.bytes_span_at(pos)?;
        Ok((self.view(span.start, span.len)?.into_owned(), span.total))
    }

    fn array_at(&self, pos: usize, depth: usize) -> Result<(Array, usize), StreamError> {
        let header = self.container_header_at(pos)?;
        if header.is_map {
            return Err(self.mismatch(pos, "array"));
        }
        if depth > MAX_NESTING_DEPTH {
            return Err(StreamError::ReadOverflow(MAX_NESTING_DEPTH));
        }
        let mut items = Vec::with_capacity(header.count);
        let mut cursor = pos + header.head_len;
        for _ in 0..header.count {
            let (item, len) = self.value_at(cursor, depth)?;
            items.push(item);
            cursor += len;
        }
        if cursor != pos + header.total {
            return Err(StreamError::BadLength);
        }
        Ok((items, header.total))
    }

    fn map_at(&self, pos: usize, depth: usize) -> Result<(Map, usize), StreamError> {
        let header = self.container_header_at(pos)?;
        if !header.is_map {
            return Err(self.mismatch(pos, "map"));
        }
        if depth > MAX_NESTING_DEPTH {
            return Err(StreamError::ReadOverflow(MAX_NESTING_DEPTH));
        }
        let mut map = Map::with_capacity(header.count);
        let mut cursor = pos + header.head_len;
        for _ in 0..header.count {
            let (key, key_len) = self.string_at(cursor)?;
            cursor += key_len;
            let (item, len) = self.value_at(cursor, depth)?;
            cursor += len;
            map.insert(key, item);
        }
        if cursor != pos + header.total {
            return Err(StreamError::BadLength);
        }
        Ok((map, header.total))
    }

    /// 按操作码解码 `pos` 处的值；`depth` 为外层容器数量。
    fn value_at(&self, pos: usize, depth: usize) -> Result<(Value, usize), StreamError> {
        let op = self.opcode_at(pos)?;
        match op {
            NIL => Ok((Value::Nil, 1)),
            TRUE | FALSE => self.bool_at(pos).map(|(v, n)| (Value::Bool(v), n)),
            FLOAT64_ZERO | FLOAT64 => self.float64_at(pos).map(|(v, n)| (Value::Float64(v), n)),
            INT64_16 | INT64_32 | INT64_64 | INT64_TINY_FIRST..=INT64_TINY_LAST => {
                self.int64_at(pos).map(|(v, n)| (Value::Int64(v), n))
            }
            UINT64_16 | UINT64_32 | UINT64_64 | UINT64_TINY_FIRST..=UINT64_TINY_LAST => {
                self.uint64_at(pos).map(|(v, n)| (Value::Uint64(v), n))
            }
            STRING_EMPTY..=STRING_LONG => self.string_at(pos).map(|(v, n)| (Value::String(v), n)),
            BYTES_EMPTY..=BYTES_LONG => self.bytes_at(pos).map(|(v, n)| (Value::Bytes(v), n)),
            ARRAY_EMPTY..=ARRAY_LONG => self
                .array_at(pos, depth + 1)
                .map(|(v, n)| (Value::Array(v), n)),
            MAP_EMPTY..=MAP_LONG => self.map_at(pos, depth + 1).map(|(v, n)| (Value::Map(v), n)),
            _ => Err(StreamError::InvalidOpcode(op)),
        }
    }

    /// 解码 `pos` 处的完整值，不移动游标。
    pub(crate) fn decode_at(&self, pos: usize) -> Result<Value, StreamError> {
        self.value_at(pos, 0).map(|(value, _)| value)
    }

    /// 校验 `pos` 处的值能被 [`Stream::read_value`] 完整解码，返回其总长度。
    ///
    /// 与解码走同一套规则（UTF-8、容器长度自洽、嵌套深度），但不构造解码结果。
    pub(crate) fn check_value_at(&self, pos: usize) -> Result<usize, StreamError> {
        self.checked_len_at(pos, 0)
    }

    fn checked_string_at(&self, pos: usize) -> Result<usize, StreamError> {
        let span = self.string_span_at(pos)?;
        std::str::from_utf8(&self.view(span.start, span.len)?)
            .map_err(|_| StreamError::InvalidUtf8)?;
        Ok(span.total)
    }

    fn checked_len_at(&self, pos: usize, depth: usize) -> Result<usize, StreamError> {
        let op = self.opcode_at(pos)?;
        match op {
            STRING_EMPTY..=STRING_LONG => self.checked_string_at(pos),
            BYTES_EMPTY..=BYTES_LONG => self.bytes_span_at(pos).map(|span| span.total),
            ARRAY_EMPTY..=MAP_LONG => {
                let header = self.container_header_at(pos)?;
                if depth + 1 > MAX_NESTING_DEPTH {
                    return Err(StreamError::ReadOverflow(MAX_NESTING_DEPTH));
                }
                let mut cursor = pos + header.head_len;
                for _ in 0..header.count {
                    if header.is_map {
                        cursor += self.checked_string_at(cursor)?;
                    }
                    cursor += self.checked_len_at(cursor, depth + 1)?;
                }
                if cursor != pos + header.total {
                    return Err(StreamError::BadLength);
                }
                Ok(header.total)
            }
            _ => self.value_len_at(pos),
        }
    }

    /// `pos` 处字符串的原始正文（不含 NUL），用于不分配内存的键比较。
    pub(crate) fn string_bytes_at(&self, pos: usize) -> Result<Cow<'_, [u8]>, StreamError> {
        let span = self.string_span_at(pos)?;
        self.view(span.start, span.len)
    }

    /// 成功时推进读游标；失败时游标不动。
    fn commit<T>(&mut self, decoded: Result<(T, usize), StreamError>) -> Result<T, StreamError> {
        let (value, len) = decoded?;
        self.read_pos += len;
        Ok(value)
    }

    pub fn read_nil(&mut self) -> Result<(), StreamError> {
        match self.opcode_at(self.read_pos)? {
            NIL => {
                self.read_pos += 1;
                Ok(())
            }
            _ => Err(self.mismatch(self.read_pos, "nil")),
        }
    }

    pub fn read_bool(&mut self) -> Result<bool, StreamError> {
        let decoded = self.bool_at(self.read_pos);
        self.commit(decoded)
    }

    pub fn read_int64(&mut self) -> Result<i64, StreamError> {
        let decoded = self.int64_at(self.read_pos);
        self.commit(decoded)
    }

    pub fn read_uint64(&mut self) -> Result<u64, StreamError> {
        let decoded = self.uint64_at(self.read_pos);
        self.commit(decoded)
    }

    pub fn read_float64(&mut self) -> Result<f64, StreamError> {
        let decoded = self.float64_at(self.read_pos);
        self.commit(decoded)
    }

    /// 读取并校验 UTF-8；缺少 NUL 结尾或编码非法时游标不动。
    pub fn read_string(&mut self) -> Result<String, StreamError> {
        let decoded = self.string_at(self.read_pos);
        self.commit(decoded)
    }

    /// 非拷贝读取字符串，同样强制 UTF-8 校验，`safe` 标记见 [`StrView`]。
    pub fn read_unsafe_string(&mut self) -> Result<StrView<'_>, StreamError> {
        let span = self.string_span_at(self.read_pos)?;
        let raw = view_in(&self.segments, self.write_pos, span.start, span.len)?;
        let view = match raw {
            Cow::Borrowed(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| StreamError::InvalidUtf8)?;
                StrView {
                    text: Cow::Borrowed(text),
                    safe: text.is_empty(),
                }
            }
            Cow::Owned(bytes) => StrView {
                text: Cow::Owned(String::from_utf8(bytes).map_err(|_| StreamError::InvalidUtf8)?),
                safe: true,
            },
        };
        self.read_pos += span.total;
        Ok(view)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, StreamError> {
        let decoded = self.bytes_at(self.read_pos);
        self.commit(decoded)
    }

    pub fn read_unsafe_bytes(&mut self) -> Result<BytesView<'_>, StreamError> {
        let span = self.bytes_span_at(self.read_pos)?;
        let raw = view_in(&self.segments, self.write_pos, span.start, span.len)?;
        let safe = span.len == 0 || matches!(raw, Cow::Owned(_));
        self.read_pos += span.total;
        Ok(BytesView { bytes: raw, safe })
    }

    pub fn read_array(&mut self) -> Result<Array, StreamError> {
        let decoded = self.array_at(self.read_pos, 1);
        self.commit(decoded)
    }

    pub fn read_map(&mut self) -> Result<Map, StreamError> {
        let decoded = self.map_at(self.read_pos, 1);
        self.commit(decoded)
    }

    /// 依据操作码解码下一个值。
    pub fn read_value(&mut self) -> Result<Value, StreamError> {
        let decoded = self.value_at(self.read_pos, 0);
        self.commit(decoded)
    }

    /// 跳过下一个值，返回其总长度；值越过 `end` 时报错且游标不动。
    pub fn read_skip_item(&mut self, end: usize) -> Result<usize, StreamError> {
        let len = self.value_len_at(self.read_pos)?;
        if self.read_pos + len > end {
            return Err(StreamError::Truncated);
        }
        self.read_pos += len;
        Ok(len)
    }

    /// 把 `from` 读游标处的一个值逐段拷贝到本流末尾，并推进 `from` 的读游标。
    pub fn splice_next_value(&mut self, from: &mut Stream) -> Result<usize, StreamError> {
        let pos = from.read_pos;
        let len = self.copy_value_from(from, pos)?;
        from.read_pos += len;
        Ok(len)
    }

    /// 把 `src` 中 `pos` 处的一个值追加到本流末尾。
    pub(crate) fn copy_value_from(&mut self, src: &Stream, pos: usize) -> Result<usize, StreamError> {
        let len = src.value_len_at(pos)?;
        self.append_range_from(src, pos, len)?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::{SEGMENT_SIZE, STREAM_BODY_POS, Stream, StreamError};

    #[test]
    fn unsafe_string_flags_cross_segment_copy() {
        let mut stream = Stream::new();
        stream.write_string("inside").expect("写入失败");
        let padding = SEGMENT_SIZE - stream.write_pos() - 3;
        stream.write_bytes(&vec![0u8; padding - 5]).expect("写入失败");
        stream.write_string("straddles").expect("写入失败");

        let first = stream.read_unsafe_string().expect("读取失败");
        assert_eq!(first.as_str(), "inside");
        assert!(!first.is_safe());
        stream.read_bytes().expect("读取失败");
        let second = stream.read_unsafe_string().expect("读取失败");
        assert_eq!(&*second, "straddles");
        assert!(second.is_safe());
    }

    #[test]
    fn string_without_nul_is_rejected_atomically() {
        let mut stream = Stream::new();
        stream.put_bytes(&[128 + 2, b'o', b'k', 7]);
        assert_eq!(stream.read_string(), Err(StreamError::MissingNul));
        assert_eq!(stream.read_pos(), STREAM_BODY_POS);
    }

    #[test]
    fn type_mismatch_names_observed_type() {
        let mut stream = Stream::new();
        stream.write_string("x").expect("写入失败");
        assert_eq!(
            stream.read_int64(),
            Err(StreamError::TypeMismatch {
                expected: "int64",
                found: "string"
            })
        );
        assert_eq!(stream.peek_type_name(), "string");
    }

    #[test]
    fn skip_respects_end_bound() {
        let mut stream = Stream::new();
        stream.write_string("abc").expect("写入失败");
        let end = stream.write_pos();
        assert_eq!(stream.read_skip_item(end - 1), Err(StreamError::Truncated));
        assert_eq!(stream.read_skip_item(end), Ok(5));
        assert!(stream.is_read_finish());
    }

    #[test]
    fn check_agrees_with_full_decode() {
        let cases: [&[u8]; 5] = [
            &[130, 0xFF, 0xFE, 0],
            &[65, 6, 0, 0, 0, 0],
            &[97, 10, 0, 0, 0, 130, 0xFF, 0xFE, 0, 54],
            &[65, 7, 0, 0, 0, 54, 54],
            &[97, 9, 0, 0, 0, 129, b'k', 0, 54],
        ];
        for raw in cases {
            let mut stream = Stream::new();
            stream.put_bytes(raw);
            let checked = stream.check_value_at(STREAM_BODY_POS);
            let decoded = stream.read_value();
            assert_eq!(checked.is_ok(), decoded.is_ok(), "{raw:?}");
            if let Ok(len) = checked {
                assert_eq!(len, raw.len());
            }
        }
    }
}
