//! 处理函数签名匹配。
//!
//! 处理函数写作普通闭包 `Fn(Runtime, A1, …, An) -> Return`，注册时逐个比对参数类型的
//! `TypeId` 与封闭类型集合，得到每个参数的种类字节；拼接结果即动作的 kind-string，
//! 同时作为派发缓存的键。

use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

use crate::runtime::{RTArray, RTMap, RTValue, Return, Runtime};
use crate::wire::{Array, Map, Stream};

use super::dispatch::{ActionArg, DISPATCH_MISMATCH};

/// 处理函数参数的封闭类型集合。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Bool,
    Int64,
    Uint64,
    Float64,
    String,
    Bytes,
    Array,
    Map,
    RtValue,
    RtArray,
    RtMap,
}

impl ArgKind {
    pub const ALL: [ArgKind; 11] = [
        ArgKind::Bool,
        ArgKind::Int64,
        ArgKind::Uint64,
        ArgKind::Float64,
        ArgKind::String,
        ArgKind::Bytes,
        ArgKind::Array,
        ArgKind::Map,
        ArgKind::RtValue,
        ArgKind::RtArray,
        ArgKind::RtMap,
    ];

    /// kind-string 中的种类字节。
    pub const fn code(self) -> u8 {
        match self {
            ArgKind::Bool => b'B',
            ArgKind::Int64 => b'I',
            ArgKind::Uint64 => b'U',
            ArgKind::Float64 => b'F',
            ArgKind::String => b'S',
            ArgKind::Bytes => b'X',
            ArgKind::Array => b'A',
            ArgKind::Map => b'M',
            ArgKind::RtValue => b'V',
            ArgKind::RtArray => b'Y',
            ArgKind::RtMap => b'Z',
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// 参数不匹配时报告的期望类型名，与流中的值族名称一致。
    pub const fn type_name(self) -> &'static str {
        match self {
            ArgKind::Bool => "bool",
            ArgKind::Int64 => "int64",
            ArgKind::Uint64 => "uint64",
            ArgKind::Float64 => "float64",
            ArgKind::String => "string",
            ArgKind::Bytes => "bytes",
            ArgKind::Array => "array",
            ArgKind::Map => "map",
            ArgKind::RtValue => "RTValue",
            ArgKind::RtArray => "RTArray",
            ArgKind::RtMap => "RTMap",
        }
    }

    /// 生成派发缓存代码时使用的 Rust 类型路径。
    pub(crate) const fn rust_type(self) -> &'static str {
        match self {
            ArgKind::Bool => "bool",
            ArgKind::Int64 => "i64",
            ArgKind::Uint64 => "u64",
            ArgKind::Float64 => "f64",
            ArgKind::String => "String",
            ArgKind::Bytes => "Vec<u8>",
            ArgKind::Array => "spark_rpc::Array",
            ArgKind::Map => "spark_rpc::Map",
            ArgKind::RtValue => "spark_rpc::RTValue",
            ArgKind::RtArray => "spark_rpc::RTArray",
            ArgKind::RtMap => "spark_rpc::RTMap",
        }
    }

    pub(crate) fn of<T: 'static>() -> Option<Self> {
        let id = TypeId::of::<T>();
        let kind = if id == TypeId::of::<bool>() {
            ArgKind::Bool
        } else if id == TypeId::of::<i64>() {
            ArgKind::Int64
        } else if id == TypeId::of::<u64>() {
            ArgKind::Uint64
        } else if id == TypeId::of::<f64>() {
            ArgKind::Float64
        } else if id == TypeId::of::<String>() {
            ArgKind::String
        } else if id == TypeId::of::<Vec<u8>>() {
            ArgKind::Bytes
        } else if id == TypeId::of::<Array>() {
            ArgKind::Array
        } else if id == TypeId::of::<Map>() {
            ArgKind::Map
        } else if id == TypeId::of::<RTValue>() {
            ArgKind::RtValue
        } else if id == TypeId::of::<RTArray>() {
            ArgKind::RtArray
        } else if id == TypeId::of::<RTMap>() {
            ArgKind::RtMap
        } else {
            return None;
        };
        Some(kind)
    }

    /// 按种类从流中解码一个参数并擦除类型。
    fn decode(self, rt: &Runtime, stream: &mut Stream) -> Option<Box<dyn Any + Send>> {
        fn boxed<T: ActionArg>(rt: &Runtime, stream: &mut Stream) -> Option<Box<dyn Any + Send>> {
            T::read_arg(rt, stream).map(|value| Box::new(value) as Box<dyn Any + Send>)
        }
        match self {
            ArgKind::Bool => boxed::<bool>(rt, stream),
            ArgKind::Int64 => boxed::<i64>(rt, stream),
            ArgKind::Uint64 => boxed::<u64>(rt, stream),
            ArgKind::Float64 => boxed::<f64>(rt, stream),
            ArgKind::String => boxed::<String>(rt, stream),
            ArgKind::Bytes => boxed::<Vec<u8>>(rt, stream),
            ArgKind::Array => boxed::<Array>(rt, stream),
            ArgKind::Map => boxed::<Map>(rt, stream),
            ArgKind::RtValue => boxed::<RTValue>(rt, stream),
            ArgKind::RtArray => boxed::<RTArray>(rt, stream),
            ArgKind::RtMap => boxed::<RTMap>(rt, stream),
        }
    }
}

/// 英文序数词：1st、2nd、3rd、4th、11th、21st……
pub(crate) fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

type ErasedInvoke = Arc<dyn Fn(Runtime, Vec<Box<dyn Any + Send>>) -> Option<Return> + Send + Sync>;

/// 注册后的处理函数。
///
/// - `typed` 保存 `Box<dyn Fn(Runtime, A1, …) -> Return + Send + Sync>`，供派发缓存按具体类型取回；
/// - `invoke` 是擦除类型后的调用入口，默认路径逐个解码参数后经由它调用。
#[doc(hidden)]
#[derive(Clone)]
pub struct HandlerEntry {
    kind: String,
    arg_kinds: Vec<ArgKind>,
    invoke: ErasedInvoke,
    typed: Arc<dyn Any + Send + Sync>,
}

impl HandlerEntry {
    fn new(arg_kinds: Vec<ArgKind>, invoke: ErasedInvoke, typed: Arc<dyn Any + Send + Sync>) -> Self {
        let kind = arg_kinds.iter().map(|kind| kind.code() as char).collect();
        Self {
            kind,
            arg_kinds,
            invoke,
            typed,
        }
    }

    pub(crate) fn kind(&self) -> &str {
        &self.kind
    }

    pub(crate) fn arg_kinds(&self) -> &[ArgKind] {
        &self.arg_kinds
    }

    pub(crate) fn typed(&self) -> &(dyn Any + Send + Sync) {
        &*self.typed
    }

    /// 默认派发路径：返回值约定与 [`DispatchFn`](super::DispatchFn) 相同。
    pub(crate) fn invoke_reflective(&self, rt: &Runtime, stream: &mut Stream) -> i32 {
        let mut args = Vec::with_capacity(self.arg_kinds.len());
        for (index, kind) in self.arg_kinds.iter().enumerate() {
            match kind.decode(rt, stream) {
                Some(arg) => args.push(arg),
                None => return index as i32 + 1,
            }
        }
        if stream.can_read() {
            return -1;
        }
        match (self.invoke)(rt.clone(), args) {
            Some(_) => 0,
            None => DISPATCH_MISMATCH,
        }
    }
}

/// 可注册为动作处理函数的闭包。
///
/// 为 0 到 12 个业务参数的 `Fn(Runtime, A1, …, An) -> Return` 实现；参数类型不在封闭集合中时
/// `into_handler` 返回形如 `handler 2nd argument type i32 is not supported` 的描述
/// （`Runtime` 计为第 1 个参数）。
pub trait IntoHandler<Args>: Send + Sync + 'static {
    #[doc(hidden)]
    fn into_handler(self) -> Result<HandlerEntry, String>;
}

macro_rules! impl_into_handler {
    ($($arg:ident),*) => {
        impl<F, $($arg,)*> IntoHandler<($($arg,)*)> for F
        where
            F: Fn(Runtime, $($arg),*) -> Return + Send + Sync + 'static,
            $($arg: Send + 'static,)*
        {
            #[allow(non_snake_case, unused_mut, unused_variables, unused_assignments)]
            fn into_handler(self) -> Result<HandlerEntry, String> {
                let mut arg_kinds = Vec::new();
                let mut position = 1usize;
                $(
                    position += 1;
                    arg_kinds.push(ArgKind::of::<$arg>().ok_or_else(|| {
                        format!(
                            "handler {} argument type {} is not supported",
                            ordinal(position),
                            type_name::<$arg>()
                        )
                    })?);
                )*
                let typed: Box<dyn Fn(Runtime, $($arg),*) -> Return + Send + Sync> = Box::new(self);
                let typed: Arc<dyn Any + Send + Sync> = Arc::new(typed);
                let erased = Arc::clone(&typed);
                let invoke: ErasedInvoke = Arc::new(move |rt: Runtime, args: Vec<Box<dyn Any + Send>>| {
                    let handler: &(dyn Any + Send + Sync) = &*erased;
                    let handler = handler
                        .downcast_ref::<Box<dyn Fn(Runtime, $($arg),*) -> Return + Send + Sync>>()?;
                    let mut args = args.into_iter();
                    $(let $arg = *args.next()?.downcast::<$arg>().ok()?;)*
                    Some(handler(rt, $($arg),*))
                });
                Ok(HandlerEntry::new(arg_kinds, invoke, typed))
            }
        }
    };
}

impl_into_handler!();
impl_into_handler!(A1);
impl_into_handler!(A1, A2);
impl_into_handler!(A1, A2, A3);
impl_into_handler!(A1, A2, A3, A4);
impl_into_handler!(A1, A2, A3, A4, A5);
impl_into_handler!(A1, A2, A3, A4, A5, A6);
impl_into_handler!(A1, A2, A3, A4, A5, A6, A7);
impl_into_handler!(A1, A2, A3, A4, A5, A6, A7, A8);
impl_into_handler!(A1, A2, A3, A4, A5, A6, A7, A8, A9);
impl_into_handler!(A1, A2, A3, A4, A5, A6, A7, A8, A9, A10);
impl_into_handler!(A1, A2, A3, A4, A5, A6, A7, A8, A9, A10, A11);
impl_into_handler!(A1, A2, A3, A4, A5, A6, A7, A8, A9, A10, A11, A12);
