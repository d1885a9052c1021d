//! 集成测试：处理函数内的竞技场视图。
//!
//! ## 设计意图（Why）
//! - `RTValue` / `RTArray` / `RTMap` 只记录位置，修改时把新值追加进竞技场；
//! - 写回响应时按原始字节拷贝，结果必须与等价的动态值一致。
//!
//! ## 测试策略（How）
//! - 在处理函数内部用 `expect` 断言中间状态，失败会以 panic 错误响应暴露给测试线程。

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use spark_rpc::{Map, RTArray, RTMap, RTValue, Runtime, Service, ServiceMeta, Value, codes};
use support::{Harness, raw_request};

fn sample_map() -> Map {
    let mut map = Map::new();
    map.insert("name".to_owned(), Value::from("spark"));
    map.insert("drop".to_owned(), Value::Nil);
    map
}

/// 数组与映射视图的增删改查，最终把映射整体写回响应。
#[test]
fn array_and_map_views_edit_in_place() {
    let service = Service::new().on("Reshape", |rt: Runtime, items: RTArray, meta: RTMap| {
        assert_eq!(items.size().expect("读取长度失败"), 3);
        assert_eq!(items.get(1).to_int64().expect("读取元素失败"), 2);
        let missing = items.get(9);
        let err = missing.err().expect("越界访问应当携带错误");
        assert!(err.is(&codes::RUNTIME_ARRAY_INDEX));
        assert_eq!(err.message(), "RTArray index 9 is out of range");

        items.append(4i64).expect("追加失败");
        items.set(0, "first").expect("改写失败");
        items.delete(1).expect("删除失败");
        assert!(items.delete(7).is_err());
        let mismatch = items.get(0).to_int64().expect_err("字符串不能读作整数");
        assert!(mismatch.is(&codes::RUNTIME_TYPE_MISMATCH));

        assert_eq!(meta.get("name").to_string().expect("读取失败"), "spark");
        assert!(meta.get("absent").err().is_some_and(|err| err.is(&codes::RUNTIME_MAP_KEY)));
        assert!(meta.delete("drop").expect("删除失败"));
        assert!(!meta.delete("drop").expect("删除失败"));
        meta.set("count", items.size().expect("读取长度失败") as u64)
            .expect("写入失败");
        meta.set("items", items).expect("写入失败");
        rt.ok(meta)
    });
    let harness = Harness::start(vec![ServiceMeta::new("views", service, Map::new())]);

    let args = [
        Value::Array(vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)]),
        Value::Map(sample_map()),
    ];
    let reply = harness.call(1, "#.views:Reshape", &args).value();

    let mut expected = Map::new();
    expected.insert("name".to_owned(), Value::from("spark"));
    expected.insert("count".to_owned(), Value::from(3u64));
    expected.insert(
        "items".to_owned(),
        Value::Array(vec![Value::from("first"), Value::from(3i64), Value::from(4i64)]),
    );
    assert_eq!(reply, Value::Map(expected));
}

/// 任意值以 `RTValue` 传入后原样写回，字节级一致。
#[test]
fn rt_value_echo_is_lossless() {
    let service = Service::new().on("Echo", |rt: Runtime, v: RTValue| rt.ok(v));
    let harness = Harness::start(vec![ServiceMeta::new("views", service, Map::new())]);

    let payload = Value::Array(vec![
        Value::Map(sample_map()),
        Value::from(vec![7u8; 600]),
        Value::from("x".repeat(700)),
        Value::from(-1.5f64),
    ]);
    assert_eq!(harness.call(1, "#.views:Echo", &[payload.clone()]).value(), payload);
}

/// 在竞技场中新建容器并嵌套写回。
#[test]
fn fresh_containers_nest_into_response() {
    let service = Service::new().on("Build", |rt: Runtime, n: u64| {
        let list = rt.new_rt_array(0).expect("创建数组失败");
        for i in 0..n {
            list.append(i).expect("追加失败");
        }
        let outer = rt.new_rt_map(1).expect("创建映射失败");
        outer.set("list", list.clone()).expect("写入失败");
        outer.set("len", list.size().expect("读取长度失败") as u64).expect("写入失败");
        let keys: HashSet<String> = outer.keys().expect("读取键失败").into_iter().collect();
        assert_eq!(keys.len(), 2);
        rt.ok(outer)
    });
    let harness = Harness::start(vec![ServiceMeta::new("views", service, Map::new())]);

    let reply = harness.call(1, "#.views:Build", &[Value::from(40u64)]).value();
    let reply = reply.as_map().expect("响应应为映射");
    assert_eq!(reply.get("len"), Some(&Value::from(40u64)));
    let list = reply.get("list").and_then(Value::as_array).expect("应当包含数组");
    assert_eq!(list.len(), 40);
    assert_eq!(list[39], Value::from(39u64));
}

/// `RTValue` 可以转为数组视图；非数组值转换失败。
#[test]
fn rt_value_converts_to_container_views() {
    let service = Service::new().on("Sum", |rt: Runtime, v: RTValue, other: RTValue| {
        let items = match v.to_rt_array() {
            Ok(items) => items,
            Err(err) => return rt.error(err),
        };
        let mut total = 0i64;
        for i in 0..items.size().unwrap_or_default() {
            total += items.get(i).to_int64().unwrap_or_default();
        }
        assert!(other.to_rt_array().is_err(), "字符串不是数组");
        assert!(other.to_rt_map().is_err(), "字符串不是映射");
        rt.ok(total)
    });
    let harness = Harness::start(vec![ServiceMeta::new("views", service, Map::new())]);

    let values = Value::Array((1..=10i64).map(Value::from).collect());
    let reply = harness.call(1, "#.views:Sum", &[values, Value::from("x")]);
    assert_eq!(reply.value(), Value::from(55i64));
}

/// 上一次调用留下的视图不属于当前调用，写回时以不支持的值拒绝。
#[test]
fn views_from_previous_invocation_are_rejected() {
    let stash: Arc<Mutex<Option<RTArray>>> = Arc::new(Mutex::new(None));
    let keep = Arc::clone(&stash);
    let reuse = Arc::clone(&stash);
    let service = Service::new()
        .on("Keep", move |rt: Runtime, items: RTArray| {
            *keep.lock() = Some(items);
            rt.ok(())
        })
        .on("Reuse", move |rt: Runtime| match reuse.lock().take() {
            Some(stale) => rt.ok(stale),
            None => rt.error("nothing kept"),
        });
    let harness = Harness::start(vec![ServiceMeta::new("views", service, Map::new())]);

    let items = Value::Array(vec![Value::from(1i64)]);
    assert_eq!(harness.call(1, "#.views:Keep", &[items]).value(), Value::Nil);
    let (code, message) = harness.call(2, "#.views:Reuse", &[]).error();
    assert_eq!(code, codes::UNSUPPORTED_VALUE.code());
    assert_eq!(message, "value is not supported: RTArray belongs to another invocation");
    assert!(stash.lock().is_none(), "旧视图应当已被取走");
}

/// 动态视图参数与具体类型参数走同一套校验：非法 UTF-8 与残缺容器都以参数不匹配拒绝，
/// 处理函数不会被调用。
#[test]
fn malformed_view_arguments_are_rejected() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (echo_hits, keys_hits) = (Arc::clone(&hits), Arc::clone(&hits));
    let service = Service::new()
        .on("Echo", move |rt: Runtime, v: RTValue| {
            echo_hits.fetch_add(1, Ordering::SeqCst);
            rt.ok(v)
        })
        .on("Keys", move |rt: Runtime, m: RTMap| {
            keys_hits.fetch_add(1, Ordering::SeqCst);
            rt.ok(m)
        })
        .on("Text", |rt: Runtime, s: String| rt.ok(s));
    let harness = Harness::start(vec![ServiceMeta::new("views", service, Map::new())]);

    let bad_text: &[u8] = &[130, 0xFF, 0xFE, 0];
    let cases: [(&str, &[u8], &str); 5] = [
        ("#.views:Echo", bad_text, "want RTValue, got string"),
        ("#.views:Echo", &[65, 6, 0, 0, 0, 0], "want RTValue, got array"),
        ("#.views:Echo", &[65, 9, 0, 0, 0, 130, 0xFF, 0xFE, 0], "want RTValue, got array"),
        ("#.views:Keys", &[97, 10, 0, 0, 0, 130, 0xFF, 0xFE, 0, 54], "want RTMap, got map"),
        ("#.views:Text", bad_text, "want string, got string"),
    ];
    for (callback_id, (target, raw, detail)) in (1u64..).zip(cases) {
        assert!(harness.processor.submit(raw_request(callback_id, target, raw)));
        let (code, message) = harness.responses.reply(callback_id).error();
        assert_eq!(code, codes::ARGUMENTS_NOT_MATCH.code(), "{target} 应当拒绝残缺参数");
        assert_eq!(message, format!("{target} 2nd argument does not match: {detail}"));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0, "残缺参数不应触发处理函数");

    let good: &[u8] = &[97, 9, 0, 0, 0, 129, b'k', 0, 54];
    assert!(harness.processor.submit(raw_request(9, "#.views:Keys", good)));
    let mut expected = Map::new();
    expected.insert("k".to_owned(), Value::from(0u64));
    assert_eq!(harness.responses.reply(9).value(), Value::Map(expected));
}
