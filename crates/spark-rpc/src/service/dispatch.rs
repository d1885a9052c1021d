//! 派发缓存。
//!
//! 默认派发路径把每个参数解码为 `Box<dyn Any>` 再逐个向下转型；对于热点签名，可以预先
//! 为每个 kind-string 实例化一个单态的 `dispatchN::<A1, …, An>`，注册时按 kind-string
//! 挂到动作上，调用时直接解码为具体类型并调用处理函数。
//!
//! [`Processor::build_cache`](crate::Processor::build_cache) 会把当前动作表中出现过的全部
//! kind-string 生成为一段 Rust 源码，内容形如：
//!
//! ```text
//! pub fn dispatch_cache() -> spark_rpc::DispatchCache {
//!     let mut cache = spark_rpc::DispatchCache::new();
//!     cache.insert("BI", spark_rpc::dispatch::dispatch2::<bool, i64>);
//!     cache
//! }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Write as _};

use crate::runtime::{RTArray, RTMap, RTValue, Return, Runtime};
use crate::wire::{Array, Map, Stream, opcode_type_name};

use super::signature::ArgKind;

/// 派发函数：`0` 表示处理函数已被调用；`n > 0` 表示第 `n` 个业务参数解码失败；
/// `-1` 表示参数之后仍有多余字节。
pub type DispatchFn = fn(&Runtime, &mut Stream, &(dyn Any + Send + Sync)) -> i32;

/// 处理函数的具体类型与派发函数不一致，调用方应回退到默认路径。
pub(crate) const DISPATCH_MISMATCH: i32 = i32::MIN;

/// 可由派发函数直接解码的参数类型。
pub trait ActionArg: Sized + Send + 'static {
    /// 解码下一个参数；失败时读游标保持不变。
    fn read_arg(rt: &Runtime, stream: &mut Stream) -> Option<Self>;
}

macro_rules! plain_arg {
    ($($ty:ty => $read:ident;)*) => {
        $(
            impl ActionArg for $ty {
                fn read_arg(_rt: &Runtime, stream: &mut Stream) -> Option<Self> {
                    stream.$read().ok()
                }
            }
        )*
    };
}

plain_arg! {
    bool => read_bool;
    i64 => read_int64;
    u64 => read_uint64;
    f64 => read_float64;
    String => read_string;
    Vec<u8> => read_bytes;
    Array => read_array;
    Map => read_map;
}

impl ActionArg for RTValue {
    fn read_arg(rt: &Runtime, stream: &mut Stream) -> Option<Self> {
        let pos = rt.core().state().arena.import_next(stream).ok()?;
        Some(RTValue::new(rt.clone(), pos))
    }
}

fn import_container(rt: &Runtime, stream: &mut Stream, is_map: bool) -> Option<usize> {
    let family = opcode_type_name(stream.peek_opcode()?);
    if family != if is_map { "map" } else { "array" } {
        return None;
    }
    let start = stream.read_pos();
    let mut state = rt.core().state();
    let imported = state.arena.import_next(stream).ok().and_then(|pos| {
        if is_map {
            state.arena.map_from_value(pos.pos()).ok()
        } else {
            state.arena.array_from_value(pos.pos()).ok()
        }
    });
    if imported.is_none() {
        stream.set_read_pos(start);
    }
    imported
}

impl ActionArg for RTArray {
    fn read_arg(rt: &Runtime, stream: &mut Stream) -> Option<Self> {
        import_container(rt, stream, false).map(|index| RTArray::new(rt.clone(), index))
    }
}

impl ActionArg for RTMap {
    fn read_arg(rt: &Runtime, stream: &mut Stream) -> Option<Self> {
        import_container(rt, stream, true).map(|index| RTMap::new(rt.clone(), index))
    }
}

macro_rules! define_dispatch {
    ($($name:ident => ($($arg:ident),*);)*) => {
        $(
            #[allow(non_snake_case, unused_mut, unused_variables, unused_assignments)]
            pub fn $name<$($arg: ActionArg),*>(
                rt: &Runtime,
                stream: &mut Stream,
                handler: &(dyn Any + Send + Sync),
            ) -> i32 {
                let Some(handler) =
                    handler.downcast_ref::<Box<dyn Fn(Runtime, $($arg),*) -> Return + Send + Sync>>()
                else {
                    return DISPATCH_MISMATCH;
                };
                let mut index = 0;
                $(
                    index += 1;
                    let Some($arg) = <$arg as ActionArg>::read_arg(rt, stream) else {
                        return index;
                    };
                )*
                if stream.can_read() {
                    return -1;
                }
                let _ = handler(rt.clone(), $($arg),*);
                0
            }
        )*
    };
}

define_dispatch! {
    dispatch0 => ();
    dispatch1 => (A1);
    dispatch2 => (A1, A2);
    dispatch3 => (A1, A2, A3);
    dispatch4 => (A1, A2, A3, A4);
    dispatch5 => (A1, A2, A3, A4, A5);
    dispatch6 => (A1, A2, A3, A4, A5, A6);
    dispatch7 => (A1, A2, A3, A4, A5, A6, A7);
    dispatch8 => (A1, A2, A3, A4, A5, A6, A7, A8);
    dispatch9 => (A1, A2, A3, A4, A5, A6, A7, A8, A9);
    dispatch10 => (A1, A2, A3, A4, A5, A6, A7, A8, A9, A10);
    dispatch11 => (A1, A2, A3, A4, A5, A6, A7, A8, A9, A10, A11);
    dispatch12 => (A1, A2, A3, A4, A5, A6, A7, A8, A9, A10, A11, A12);
}

/// kind-string 到派发函数的映射。
#[derive(Clone, Default)]
pub struct DispatchCache {
    entries: HashMap<String, DispatchFn>,
}

impl fmt::Debug for DispatchCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchCache")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DispatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: &str, dispatch: DispatchFn) -> &mut Self {
        self.entries.insert(kind.to_owned(), dispatch);
        self
    }

    pub fn get(&self, kind: &str) -> Option<DispatchFn> {
        self.entries.get(kind).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 已登记的 kind-string，按字典序排列。
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// 生成派发缓存模块源码；`kinds` 中无法识别或参数过多的条目被跳过。
pub(crate) fn render_cache_module(module: &str, kinds: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "//! Dispatch cache for `{module}`. Generated, do not edit.");
    out.push('\n');
    out.push_str("pub fn dispatch_cache() -> spark_rpc::DispatchCache {\n");
    out.push_str("    let mut cache = spark_rpc::DispatchCache::new();\n");
    for kind in kinds {
        let Some(types) = kind
            .bytes()
            .map(|code| ArgKind::from_code(code).map(ArgKind::rust_type))
            .collect::<Option<Vec<_>>>()
        else {
            continue;
        };
        if types.len() > 12 {
            continue;
        }
        let generics = if types.is_empty() {
            String::new()
        } else {
            format!("::<{}>", types.join(", "))
        };
        let _ = writeln!(
            out,
            "    cache.insert({kind:?}, spark_rpc::dispatch::dispatch{}{generics});",
            types.len()
        );
    }
    out.push_str("    cache\n}\n");
    out
}
