use crate::error::{RpcError, codes};
use crate::wire::{Array, Value};

use super::{RTValue, Runtime};

/// 竞技场中的运行时数组。
///
/// 元素以位置记录保存，`get` 不解码；`set`/`append` 把新值编码后追加到竞技场流末尾。
#[derive(Clone, Debug, PartialEq)]
pub struct RTArray {
    pub(crate) rt: Runtime,
    pub(crate) index: usize,
}

impl RTArray {
    pub(crate) fn new(rt: Runtime, index: usize) -> Self {
        Self { rt, index }
    }

    pub fn size(&self) -> Result<usize, RpcError> {
        self.rt.with_arena(|arena| Ok(arena.array_len(self.index)))
    }

    /// 越界时返回携带 [`codes::RUNTIME_ARRAY_INDEX`] 的视图。
    pub fn get(&self, i: usize) -> RTValue {
        let found = self.rt.with_arena(|arena| {
            arena.array_get(self.index, i).ok_or_else(|| {
                codes::RUNTIME_ARRAY_INDEX
                    .with_message(format!("RTArray index {i} is out of range"))
            })
        });
        match found {
            Ok(pos) => RTValue::new(self.rt.clone(), pos),
            Err(err) => RTValue::failed(self.rt.clone(), err),
        }
    }

    pub fn set(&self, i: usize, value: impl Into<Value>) -> Result<(), RpcError> {
        let value = value.into();
        self.rt.with_arena(|arena| {
            if i >= arena.array_len(self.index) {
                return Err(codes::RUNTIME_ARRAY_INDEX
                    .with_message(format!("RTArray index {i} is out of range")));
            }
            let record = arena.append_value(&value, &self.rt)?;
            arena.array_set(self.index, i, record);
            Ok(())
        })
    }

    pub fn append(&self, value: impl Into<Value>) -> Result<(), RpcError> {
        let value = value.into();
        self.rt.with_arena(|arena| {
            let record = arena.append_value(&value, &self.rt)?;
            arena.array_push(self.index, record);
            Ok(())
        })
    }

    /// 删除第 `i` 个元素，其后的元素前移。
    pub fn delete(&self, i: usize) -> Result<(), RpcError> {
        self.rt.with_arena(|arena| {
            if arena.array_delete(self.index, i) {
                Ok(())
            } else {
                Err(codes::RUNTIME_ARRAY_INDEX
                    .with_message(format!("RTArray index {i} is out of range")))
            }
        })
    }

    pub fn to_array(&self) -> Result<Array, RpcError> {
        self.rt.with_arena(|arena| {
            (0..arena.array_len(self.index))
                .filter_map(|i| arena.array_get(self.index, i))
                .map(|record| arena.stream().decode_at(record.pos()).map_err(RpcError::from))
                .collect()
        })
    }
}
