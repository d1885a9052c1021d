use std::sync::Arc;

use crate::executor::ExecutorCore;
use crate::wire::{
    PosRecord, RuntimeWriter, STREAM_BODY_POS, Stream, StreamError, Value, opcode_type_name,
};

use super::{RTArray, RTMap, RTValue, Runtime};

/// 槽位区间：`[start, start + len)` 为有效元素，`cap` 之前的空间已预留。
#[derive(Clone, Copy, Debug, Default)]
struct SlabRange {
    start: usize,
    len: usize,
    cap: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct MapItem {
    key: PosRecord,
    value: PosRecord,
}

/// 执行器竞技场。
///
/// # 教案式说明
/// - **意图 (Why)**：`RTValue`/`RTArray`/`RTMap` 只保存位置，真正的字节集中存放在这里，
///   一次顶层调用结束后整体复位，不为单个值单独分配或释放；
/// - **契约 (What)**：
///   - `stream` 保存所有被引用的编码值；`items`/`entries` 是扁平槽位，
///     每个运行时数组 / 映射占用其中一段 [`SlabRange`]；
///   - 区间写满时整段搬迁到槽位末尾并翻倍容量，旧区间作废；
///   - [`Arena::reset`] 只清空游标与长度，保留已分配的容量；
/// - **风险 (Trade-offs)**：被覆盖或删除的值不会回收，单次调用内频繁 `set` 会让竞技场持续增长。
pub(crate) struct Arena {
    stream: Box<Stream>,
    items: Vec<PosRecord>,
    entries: Vec<MapItem>,
    arrays: Vec<SlabRange>,
    maps: Vec<SlabRange>,
}

impl Arena {
    pub(crate) fn new(buffer_size: usize) -> Self {
        let slots = (buffer_size / (2 * std::mem::size_of::<PosRecord>())).max(16);
        Self {
            stream: Stream::new(),
            items: Vec::with_capacity(slots),
            entries: Vec::with_capacity(slots),
            arrays: Vec::new(),
            maps: Vec::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.stream.set_write_pos_to_body_start();
        self.items.clear();
        self.entries.clear();
        self.arrays.clear();
        self.maps.clear();
    }

    pub(crate) fn stream(&self) -> &Stream {
        &self.stream
    }

    fn record_at(&self, pos: usize) -> PosRecord {
        let is_string = self
            .stream
            .byte_at(pos)
            .is_some_and(|op| opcode_type_name(op) == "string");
        PosRecord::new(pos, is_string)
    }

    /// 把 `src` 读游标处的值搬进竞技场，并推进 `src` 的读游标。
    ///
    /// 值必须能被完整解码；校验失败时竞技场与 `src` 的读游标都不变。
    pub(crate) fn import_next(&mut self, src: &mut Stream) -> Result<PosRecord, StreamError> {
        src.check_value_at(src.read_pos())?;
        let pos = self.stream.write_pos();
        self.stream.splice_next_value(src)?;
        Ok(self.record_at(pos))
    }

    /// 编码一个动态值并追加到竞技场；值内引用的运行时视图必须属于 `owner`。
    pub(crate) fn append_value(
        &mut self,
        value: &Value,
        owner: &Runtime,
    ) -> Result<PosRecord, StreamError> {
        let mut scratch = Stream::new();
        let written = scratch.write_value_with(value, &ArenaWriter::new(self, owner));
        let result = written.and_then(|()| {
            let at = self.stream.write_pos();
            self.stream
                .append_range_from(&scratch, STREAM_BODY_POS, scratch.body_len())?;
            Ok(self.record_at(at))
        });
        scratch.release();
        result
    }

    fn append_key(&mut self, key: &str) -> Result<PosRecord, StreamError> {
        let at = self.stream.write_pos();
        self.stream.write_string(key)?;
        Ok(PosRecord::new(at, true))
    }

    // ---- 数组 ----

    pub(crate) fn new_array(&mut self, cap: usize) -> usize {
        let start = self.items.len();
        self.items.resize(start + cap, PosRecord::default());
        self.arrays.push(SlabRange { start, len: 0, cap });
        self.arrays.len() - 1
    }

    /// 为竞技场中 `pos` 处的编码数组建立运行时视图。
    pub(crate) fn array_from_value(&mut self, pos: usize) -> Result<usize, StreamError> {
        let header = self.stream.container_header_at(pos)?;
        if header.is_map {
            return Err(StreamError::TypeMismatch {
                expected: "array",
                found: "map",
            });
        }
        let index = self.new_array(header.count);
        let mut cursor = pos + header.head_len;
        for _ in 0..header.count {
            let record = self.record_at(cursor);
            cursor += self.stream.value_len_at(cursor)?;
            self.array_push(index, record);
        }
        Ok(index)
    }

    pub(crate) fn array_len(&self, index: usize) -> usize {
        self.arrays.get(index).map_or(0, |range| range.len)
    }

    pub(crate) fn array_get(&self, index: usize, i: usize) -> Option<PosRecord> {
        let range = self.arrays.get(index)?;
        (i < range.len).then(|| self.items[range.start + i])
    }

    pub(crate) fn array_set(&mut self, index: usize, i: usize, record: PosRecord) -> bool {
        match self.arrays.get(index) {
            Some(range) if i < range.len => {
                self.items[range.start + i] = record;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn array_push(&mut self, index: usize, record: PosRecord) {
        let Some(mut range) = self.arrays.get(index).copied() else {
            return;
        };
        if range.len == range.cap {
            let new_cap = (range.cap * 2).max(4);
            let new_start = self.items.len();
            self.items
                .extend_from_within(range.start..range.start + range.len);
            self.items
                .resize(new_start + new_cap, PosRecord::default());
            range.start = new_start;
            range.cap = new_cap;
        }
        self.items[range.start + range.len] = record;
        range.len += 1;
        self.arrays[index] = range;
    }

    pub(crate) fn array_delete(&mut self, index: usize, i: usize) -> bool {
        let Some(range) = self.arrays.get_mut(index) else {
            return false;
        };
        if i >= range.len {
            return false;
        }
        let (start, len) = (range.start, range.len);
        self.items.copy_within(start + i + 1..start + len, start + i);
        range.len -= 1;
        true
    }

    // ---- 映射 ----

    pub(crate) fn new_map(&mut self, cap: usize) -> usize {
        let start = self.entries.len();
        self.entries.resize(start + cap, MapItem::default());
        self.maps.push(SlabRange { start, len: 0, cap });
        self.maps.len() - 1
    }

    pub(crate) fn map_from_value(&mut self, pos: usize) -> Result<usize, StreamError> {
        let header = self.stream.container_header_at(pos)?;
        if !header.is_map {
            return Err(StreamError::TypeMismatch {
                expected: "map",
                found: "array",
            });
        }
        let index = self.new_map(header.count);
        let mut cursor = pos + header.head_len;
        for _ in 0..header.count {
            let key = PosRecord::new(cursor, true);
            std::str::from_utf8(&self.stream.string_bytes_at(cursor)?)
                .map_err(|_| StreamError::InvalidUtf8)?;
            cursor += self.stream.value_len_at(cursor)?;
            let value = self.record_at(cursor);
            cursor += self.stream.value_len_at(cursor)?;
            self.map_push(index, MapItem { key, value });
        }
        Ok(index)
    }

    fn map_push(&mut self, index: usize, item: MapItem) {
        let Some(mut range) = self.maps.get(index).copied() else {
            return;
        };
        if range.len == range.cap {
            let new_cap = (range.cap * 2).max(4);
            let new_start = self.entries.len();
            self.entries
                .extend_from_within(range.start..range.start + range.len);
            self.entries.resize(new_start + new_cap, MapItem::default());
            range.start = new_start;
            range.cap = new_cap;
        }
        self.entries[range.start + range.len] = item;
        range.len += 1;
        self.maps[index] = range;
    }

    fn map_find(&self, index: usize, key: &str) -> Option<usize> {
        let range = self.maps.get(index)?;
        (range.start..range.start + range.len).find(|slot| {
            self.stream
                .string_bytes_at(self.entries[*slot].key.pos())
                .is_ok_and(|raw| *raw == *key.as_bytes())
        })
    }

    pub(crate) fn map_len(&self, index: usize) -> usize {
        self.maps.get(index).map_or(0, |range| range.len)
    }

    pub(crate) fn map_get(&self, index: usize, key: &str) -> Option<PosRecord> {
        self.map_find(index, key).map(|slot| self.entries[slot].value)
    }

    pub(crate) fn map_set(
        &mut self,
        index: usize,
        key: &str,
        value: PosRecord,
    ) -> Result<(), StreamError> {
        if let Some(slot) = self.map_find(index, key) {
            self.entries[slot].value = value;
            return Ok(());
        }
        let key = self.append_key(key)?;
        self.map_push(index, MapItem { key, value });
        Ok(())
    }

    pub(crate) fn map_delete(&mut self, index: usize, key: &str) -> bool {
        let Some(slot) = self.map_find(index, key) else {
            return false;
        };
        let range = &mut self.maps[index];
        let end = range.start + range.len;
        self.entries.copy_within(slot + 1..end, slot);
        range.len -= 1;
        true
    }

    pub(crate) fn map_keys(&self, index: usize) -> Result<Vec<String>, StreamError> {
        let Some(range) = self.maps.get(index) else {
            return Ok(Vec::new());
        };
        self.entries[range.start..range.start + range.len]
            .iter()
            .map(|item| self.stream.string_at(item.key.pos()).map(|(key, _)| key))
            .collect()
    }

    /// 把运行时数组按原始字节写入 `dst`。
    fn write_array_into(&self, dst: &mut Stream, index: usize) -> Result<(), StreamError> {
        let len = self.array_len(index);
        let start = self.arrays.get(index).map_or(0, |range| range.start);
        dst.write_raw_container(false, len, |dst| {
            for record in &self.items[start..start + len] {
                dst.copy_value_from(&self.stream, record.pos())?;
            }
            Ok(())
        })
    }

    fn write_map_into(&self, dst: &mut Stream, index: usize) -> Result<(), StreamError> {
        let len = self.map_len(index);
        let start = self.maps.get(index).map_or(0, |range| range.start);
        dst.write_raw_container(true, len, |dst| {
            for item in &self.entries[start..start + len] {
                dst.copy_value_from(&self.stream, item.key.pos())?;
                dst.copy_value_from(&self.stream, item.value.pos())?;
            }
            Ok(())
        })
    }
}

/// 在持有竞技场的前提下把运行时视图写入目标流。
///
/// 视图必须属于同一执行器的同一次调用（`owner`），否则按不受支持的值拒绝。
pub(crate) struct ArenaWriter<'a> {
    arena: &'a Arena,
    core: *const ExecutorCore,
    id: u64,
}

impl<'a> ArenaWriter<'a> {
    pub(crate) fn new(arena: &'a Arena, owner: &Runtime) -> Self {
        Self {
            arena,
            core: Arc::as_ptr(owner.core()),
            id: owner.id(),
        }
    }

    fn owns(&self, rt: &Runtime) -> bool {
        std::ptr::eq(Arc::as_ptr(rt.core()), self.core) && rt.id() == self.id
    }
}

impl RuntimeWriter for ArenaWriter<'_> {
    fn write_runtime(&self, dst: &mut Stream, value: &Value) -> Result<(), StreamError> {
        let foreign = || {
            StreamError::unsupported(format!(
                "{} belongs to another invocation",
                value.type_name()
            ))
        };
        match value {
            Value::RtValue(RTValue { rt, pos, err }) => {
                if !self.owns(rt) {
                    return Err(foreign());
                }
                if let Some(err) = err {
                    return Err(StreamError::unsupported(format!(
                        "RTValue carries an error: {}",
                        err.message()
                    )));
                }
                dst.copy_value_from(self.arena.stream(), pos.pos()).map(|_| ())
            }
            Value::RtArray(RTArray { rt, index }) => {
                if !self.owns(rt) {
                    return Err(foreign());
                }
                self.arena.write_array_into(dst, *index)
            }
            Value::RtMap(RTMap { rt, index }) => {
                if !self.owns(rt) {
                    return Err(foreign());
                }
                self.arena.write_map_into(dst, *index)
            }
            other => dst.write_value(other),
        }
    }
}
