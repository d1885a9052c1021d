use crate::error::{RpcError, codes};
use crate::wire::{Array, Map, PosRecord, StreamError, Value};

use super::{Arena, RTArray, RTMap, Runtime};

/// 竞技场中单个编码值的惰性视图。
///
/// 数组元素、映射取值与嵌套调用的结果都以 `RTValue` 交给处理函数；嵌套调用失败时
/// 视图不指向任何字节，而是携带上游错误，所有取值方法直接返回该错误。
#[derive(Clone, Debug, PartialEq)]
pub struct RTValue {
    pub(crate) rt: Runtime,
    pub(crate) pos: PosRecord,
    pub(crate) err: Option<RpcError>,
}

fn view_error(err: StreamError) -> RpcError {
    match err {
        StreamError::TypeMismatch { .. } => codes::RUNTIME_TYPE_MISMATCH.with_message(err.to_string()),
        other => other.into(),
    }
}

impl RTValue {
    pub(crate) fn new(rt: Runtime, pos: PosRecord) -> Self {
        Self { rt, pos, err: None }
    }

    pub(crate) fn failed(rt: Runtime, err: RpcError) -> Self {
        Self {
            rt,
            pos: PosRecord::default(),
            err: Some(err),
        }
    }

    /// 上游错误（仅嵌套调用失败或越界访问时存在）。
    pub fn err(&self) -> Option<&RpcError> {
        self.err.as_ref()
    }

    fn read<T>(&self, f: impl FnOnce(&Arena, usize) -> Result<T, StreamError>) -> Result<T, RpcError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let pos = self.pos.pos();
        self.rt.with_arena(|arena| f(&*arena, pos).map_err(view_error))
    }

    pub fn is_nil(&self) -> Result<bool, RpcError> {
        self.read(|arena, pos| Ok(arena.stream().decode_at(pos)?.is_nil()))
    }

    pub fn to_bool(&self) -> Result<bool, RpcError> {
        self.read(|arena, pos| arena.stream().bool_at(pos).map(|(v, _)| v))
    }

    pub fn to_int64(&self) -> Result<i64, RpcError> {
        self.read(|arena, pos| arena.stream().int64_at(pos).map(|(v, _)| v))
    }

    pub fn to_uint64(&self) -> Result<u64, RpcError> {
        self.read(|arena, pos| arena.stream().uint64_at(pos).map(|(v, _)| v))
    }

    pub fn to_float64(&self) -> Result<f64, RpcError> {
        self.read(|arena, pos| arena.stream().float64_at(pos).map(|(v, _)| v))
    }

    pub fn to_string(&self) -> Result<String, RpcError> {
        self.read(|arena, pos| arena.stream().string_at(pos).map(|(v, _)| v))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RpcError> {
        self.read(|arena, pos| arena.stream().bytes_at(pos).map(|(v, _)| v))
    }

    pub fn to_array(&self) -> Result<Array, RpcError> {
        self.read(|arena, pos| match arena.stream().decode_at(pos)? {
            Value::Array(items) => Ok(items),
            other => Err(StreamError::TypeMismatch {
                expected: "array",
                found: other.type_name(),
            }),
        })
    }

    pub fn to_map(&self) -> Result<Map, RpcError> {
        self.read(|arena, pos| match arena.stream().decode_at(pos)? {
            Value::Map(map) => Ok(map),
            other => Err(StreamError::TypeMismatch {
                expected: "map",
                found: other.type_name(),
            }),
        })
    }

    /// 完整解码为动态值。
    pub fn to_value(&self) -> Result<Value, RpcError> {
        self.read(|arena, pos| arena.stream().decode_at(pos))
    }

    /// 以运行时数组视图访问，元素不解码。
    pub fn to_rt_array(&self) -> Result<RTArray, RpcError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let pos = self.pos.pos();
        let index = self
            .rt
            .with_arena(|arena| arena.array_from_value(pos).map_err(view_error))?;
        Ok(RTArray::new(self.rt.clone(), index))
    }

    pub fn to_rt_map(&self) -> Result<RTMap, RpcError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let pos = self.pos.pos();
        let index = self
            .rt
            .with_arena(|arena| arena.map_from_value(pos).map_err(view_error))?;
        Ok(RTMap::new(self.rt.clone(), index))
    }
}
