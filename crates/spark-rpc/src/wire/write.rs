use super::error::StreamError;
use super::opcode::*;
use super::stream::Stream;
use super::value::{Map, Value};

/// 运行时视图的写入钩子。
///
/// `Value::Rt*` 只记录了竞技场中的位置，真正的字节由持有竞技场的一方拷贝；
/// 执行器在 `Runtime::ok` 等路径上提供实现，其余场景使用 [`DetachedRuntime`] 直接拒绝。
pub(crate) trait RuntimeWriter {
    fn write_runtime(&self, dst: &mut Stream, value: &Value) -> Result<(), StreamError>;
}

pub(crate) struct DetachedRuntime;

impl RuntimeWriter for DetachedRuntime {
    fn write_runtime(&self, _dst: &mut Stream, value: &Value) -> Result<(), StreamError> {
        Err(StreamError::unsupported(format!(
            "{} is not bound to the current invocation",
            value.type_name()
        )))
    }
}

impl Stream {
    pub fn write_nil(&mut self) {
        self.put_u8(NIL);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.put_u8(if v { TRUE } else { FALSE });
    }

    pub fn write_float64(&mut self, v: f64) {
        if v == 0.0 {
            self.put_u8(FLOAT64_ZERO);
        } else {
            self.put_u8(FLOAT64);
            self.put_bytes(&v.to_le_bytes());
        }
    }

    /// 按取值范围选择最短编码：小整数 1 字节，其次 16/32/64 位偏置编码。
    pub fn write_int64(&mut self, v: i64) {
        if (INT64_TINY_MIN..=INT64_TINY_MAX).contains(&v) {
            self.put_u8((v + INT64_TINY_BIAS) as u8);
        } else if (-(1i64 << 15)..(1i64 << 15)).contains(&v) {
            self.put_u8(INT64_16);
            self.put_bytes(&((v + (1i64 << 15)) as u16).to_le_bytes());
        } else if (-(1i64 << 31)..(1i64 << 31)).contains(&v) {
            self.put_u8(INT64_32);
            self.put_bytes(&((v + (1i64 << 31)) as u32).to_le_bytes());
        } else {
            self.put_u8(INT64_64);
            self.put_bytes(&((v as u64) ^ (1u64 << 63)).to_le_bytes());
        }
    }

    pub fn write_uint64(&mut self, v: u64) {
        if v <= UINT64_TINY_MAX {
            self.put_u8(UINT64_TINY_FIRST + v as u8);
        } else if v <= u64::from(u16::MAX) {
            self.put_u8(UINT64_16);
            self.put_bytes(&(v as u16).to_le_bytes());
        } else if v <= u64::from(u32::MAX) {
            self.put_u8(UINT64_32);
            self.put_bytes(&(v as u32).to_le_bytes());
        } else {
            self.put_u8(UINT64_64);
            self.put_bytes(&v.to_le_bytes());
        }
    }

    pub fn write_string(&mut self, v: &str) -> Result<(), StreamError> {
        let len = v.len();
        if len == 0 {
            self.put_u8(STRING_EMPTY);
        } else if len <= SHORT_PAYLOAD_MAX {
            self.put_u8(STRING_EMPTY + len as u8);
            self.put_bytes(v.as_bytes());
            self.put_u8(0);
        } else {
            let total = checked_total(len + 6, len)?;
            self.put_u8(STRING_LONG);
            self.put_bytes(&total.to_le_bytes());
            self.put_bytes(v.as_bytes());
            self.put_u8(0);
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> Result<(), StreamError> {
        let len = v.len();
        if len == 0 {
            self.put_u8(BYTES_EMPTY);
        } else if len <= SHORT_PAYLOAD_MAX {
            self.put_u8(BYTES_EMPTY + len as u8);
            self.put_bytes(v);
        } else {
            let total = checked_total(len + 5, len)?;
            self.put_u8(BYTES_LONG);
            self.put_bytes(&total.to_le_bytes());
            self.put_bytes(v);
        }
        Ok(())
    }

    pub fn write_array(&mut self, v: &[Value]) -> Result<(), StreamError> {
        self.write_array_at_depth(v, 1, &DetachedRuntime)
    }

    pub fn write_map(&mut self, v: &Map) -> Result<(), StreamError> {
        self.write_map_at_depth(v, 1, &DetachedRuntime)
    }

    /// 写入任意动态值。
    ///
    /// # 契约
    /// - 失败时写游标回到调用前的位置，错误中的路径指向首个失败元素；
    /// - `Value::Rt*` 在此入口一律返回 `Unsupported`，它们只能经由 `Runtime` 写出。
    pub fn write_value(&mut self, v: &Value) -> Result<(), StreamError> {
        self.write_value_with(v, &DetachedRuntime)
    }

    pub(crate) fn write_value_with(
        &mut self,
        v: &Value,
        rt: &dyn RuntimeWriter,
    ) -> Result<(), StreamError> {
        let start = self.write_pos();
        let result = self.write_value_at_depth(v, 0, rt);
        if result.is_err() {
            self.set_write_pos(start);
        }
        result
    }

    fn write_value_at_depth(
        &mut self,
        v: &Value,
        depth: usize,
        rt: &dyn RuntimeWriter,
    ) -> Result<(), StreamError> {
        match v {
            Value::Nil => self.write_nil(),
            Value::Bool(b) => self.write_bool(*b),
            Value::Int64(i) => self.write_int64(*i),
            Value::Uint64(u) => self.write_uint64(*u),
            Value::Float64(f) => self.write_float64(*f),
            Value::String(s) => self.write_string(s)?,
            Value::Bytes(b) => self.write_bytes(b)?,
            Value::Array(items) => self.write_array_at_depth(items, depth + 1, rt)?,
            Value::Map(map) => self.write_map_at_depth(map, depth + 1, rt)?,
            Value::RtValue(_) | Value::RtArray(_) | Value::RtMap(_) => {
                rt.write_runtime(self, v)?;
            }
        }
        Ok(())
    }

    fn write_array_at_depth(
        &mut self,
        items: &[Value],
        depth: usize,
        rt: &dyn RuntimeWriter,
    ) -> Result<(), StreamError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(StreamError::WriteOverflow {
                path: String::new(),
            });
        }
        if items.is_empty() {
            self.put_u8(ARRAY_EMPTY);
            return Ok(());
        }
        let start = self.write_pos();
        let head_len = self.reserve_container_head(items.len());
        for (index, item) in items.iter().enumerate() {
            if let Err(err) = self.write_value_at_depth(item, depth, rt) {
                self.set_write_pos(start);
                return Err(err.prefixed(&format!("[{index}]")));
            }
        }
        self.patch_container_head(start, head_len, ARRAY_EMPTY, ARRAY_LONG, items.len())
    }

    fn write_map_at_depth(
        &mut self,
        map: &Map,
        depth: usize,
        rt: &dyn RuntimeWriter,
    ) -> Result<(), StreamError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(StreamError::WriteOverflow {
                path: String::new(),
            });
        }
        if map.is_empty() {
            self.put_u8(MAP_EMPTY);
            return Ok(());
        }
        let start = self.write_pos();
        let head_len = self.reserve_container_head(map.len());
        for (key, item) in map {
            let written = self
                .write_string(key)
                .and_then(|()| self.write_value_at_depth(item, depth, rt));
            if let Err(err) = written {
                self.set_write_pos(start);
                return Err(err.prefixed(&format!("[{key:?}]")));
            }
        }
        self.patch_container_head(start, head_len, MAP_EMPTY, MAP_LONG, map.len())
    }

    /// 以已编码的元素拼装容器：`fill` 负责写入 `count` 个元素（映射为键值对），
    /// 失败时整体回滚。运行时视图据此把竞技场中的原始字节直接搬进目标流。
    pub(crate) fn write_raw_container(
        &mut self,
        is_map: bool,
        count: usize,
        fill: impl FnOnce(&mut Stream) -> Result<(), StreamError>,
    ) -> Result<(), StreamError> {
        let (empty_op, long_op) = if is_map {
            (MAP_EMPTY, MAP_LONG)
        } else {
            (ARRAY_EMPTY, ARRAY_LONG)
        };
        if count == 0 {
            self.put_u8(empty_op);
            return Ok(());
        }
        let start = self.write_pos();
        let head_len = self.reserve_container_head(count);
        if let Err(err) = fill(self) {
            self.set_write_pos(start);
            return Err(err);
        }
        self.patch_container_head(start, head_len, empty_op, long_op, count)
    }

    fn reserve_container_head(&mut self, count: usize) -> usize {
        let head_len = if count > SHORT_CONTAINER_MAX { 9 } else { 5 };
        self.put_bytes(&[0u8; 9][..head_len]);
        head_len
    }

    /// 回填容器头：操作码、4 字节总长度，长容器再加 4 字节元素数。
    fn patch_container_head(
        &mut self,
        start: usize,
        head_len: usize,
        empty_op: u8,
        long_op: u8,
        count: usize,
    ) -> Result<(), StreamError> {
        let total = self.write_pos() - start;
        let total = match checked_total(total, total) {
            Ok(total) => total,
            Err(err) => {
                self.set_write_pos(start);
                return Err(err);
            }
        };
        let mut head = [0u8; 9];
        if head_len == 9 {
            head[0] = long_op;
            head[5..9].copy_from_slice(&(count as u32).to_le_bytes());
        } else {
            head[0] = empty_op + count as u8;
        }
        head[1..5].copy_from_slice(&total.to_le_bytes());
        self.put_at(start, &head[..head_len]);
        Ok(())
    }
}

fn checked_total(total: usize, len: usize) -> Result<u32, StreamError> {
    u32::try_from(total).map_err(|_| StreamError::LengthOverflow {
        path: String::new(),
        len,
    })
}

#[cfg(test)]
mod tests {
    use crate::wire::{STREAM_BODY_POS, Stream, Value};

    fn body_of(write: impl FnOnce(&mut Stream)) -> Vec<u8> {
        let mut stream = Stream::new();
        write(&mut stream);
        let body = stream.body_bytes();
        stream.release();
        body
    }

    #[test]
    fn tiny_integers_take_one_byte() {
        assert_eq!(body_of(|s| s.write_int64(-7)), vec![14]);
        assert_eq!(body_of(|s| s.write_int64(32)), vec![53]);
        assert_eq!(body_of(|s| s.write_uint64(9)), vec![63]);
        assert_eq!(body_of(|s| s.write_float64(0.0)), vec![4]);
    }

    #[test]
    fn signed_boundaries_select_opcode() {
        assert_eq!(body_of(|s| s.write_int64(-8))[0], 6);
        assert_eq!(body_of(|s| s.write_int64((1 << 15) - 1))[0], 6);
        assert_eq!(body_of(|s| s.write_int64(1 << 15))[0], 7);
        assert_eq!(body_of(|s| s.write_int64(-(1 << 15)))[0], 6);
        assert_eq!(body_of(|s| s.write_int64(-(1 << 15) - 1))[0], 7);
        assert_eq!(body_of(|s| s.write_int64(-(1 << 31)))[0], 7);
        assert_eq!(body_of(|s| s.write_int64(-(1 << 31) - 1))[0], 8);
        assert_eq!(body_of(|s| s.write_int64(i64::MIN)), {
            let mut expected = vec![8];
            expected.extend_from_slice(&0u64.to_le_bytes());
            expected
        });
    }

    #[test]
    fn container_total_counts_whole_value() {
        let body = body_of(|s| {
            s.write_array(&[Value::Bool(true), Value::Nil])
                .expect("写入数组失败")
        });
        assert_eq!(body, vec![66, 7, 0, 0, 0, 2, 1]);
    }

    #[test]
    fn overflow_inside_map_reports_quoted_key() {
        let mut inner = Value::Nil;
        for _ in 0..64 {
            inner = Value::Array(vec![inner]);
        }
        let mut map = crate::wire::Map::new();
        map.insert("k".to_owned(), inner);
        let mut stream = Stream::new();
        stream.write_bool(true);
        let before = stream.write_pos();
        let err = stream
            .write_value(&Value::Array(vec![Value::Int64(1), Value::Map(map)]))
            .expect_err("第 65 层应当溢出");
        let expected = format!("[1][\"k\"]{}", "[0]".repeat(62));
        assert_eq!(err.path(), Some(expected.as_str()));
        assert_eq!(stream.write_pos(), before);
        assert_eq!(before, STREAM_BODY_POS + 1);
    }
}
