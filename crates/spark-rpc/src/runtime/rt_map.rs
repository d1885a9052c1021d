use crate::error::{RpcError, codes};
use crate::wire::{Map, Value};

use super::{RTValue, Runtime};

/// 竞技场中的运行时映射，键按插入顺序保存。
#[derive(Clone, Debug, PartialEq)]
pub struct RTMap {
    pub(crate) rt: Runtime,
    pub(crate) index: usize,
}

impl RTMap {
    pub(crate) fn new(rt: Runtime, index: usize) -> Self {
        Self { rt, index }
    }

    pub fn size(&self) -> Result<usize, RpcError> {
        self.rt.with_arena(|arena| Ok(arena.map_len(self.index)))
    }

    /// 键不存在时返回携带 [`codes::RUNTIME_MAP_KEY`] 的视图。
    pub fn get(&self, key: &str) -> RTValue {
        let found = self.rt.with_arena(|arena| {
            arena.map_get(self.index, key).ok_or_else(|| {
                codes::RUNTIME_MAP_KEY.with_message(format!("RTMap key {key:?} does not exist"))
            })
        });
        match found {
            Ok(pos) => RTValue::new(self.rt.clone(), pos),
            Err(err) => RTValue::failed(self.rt.clone(), err),
        }
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), RpcError> {
        let value = value.into();
        self.rt.with_arena(|arena| {
            let record = arena.append_value(&value, &self.rt)?;
            arena.map_set(self.index, key, record)?;
            Ok(())
        })
    }

    /// 返回键是否存在过。
    pub fn delete(&self, key: &str) -> Result<bool, RpcError> {
        self.rt.with_arena(|arena| Ok(arena.map_delete(self.index, key)))
    }

    pub fn keys(&self) -> Result<Vec<String>, RpcError> {
        self.rt
            .with_arena(|arena| arena.map_keys(self.index).map_err(RpcError::from))
    }

    pub fn to_map(&self) -> Result<Map, RpcError> {
        self.rt.with_arena(|arena| {
            let keys = arena.map_keys(self.index)?;
            let mut map = Map::with_capacity(keys.len());
            for key in keys {
                if let Some(record) = arena.map_get(self.index, &key) {
                    let value = arena.stream().decode_at(record.pos())?;
                    map.insert(key, value);
                }
            }
            Ok(map)
        })
    }
}
