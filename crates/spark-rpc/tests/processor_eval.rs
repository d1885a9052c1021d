//! 集成测试：请求求值流程。
//!
//! ## 设计意图（Why）
//! - 每个请求恰好得到一个响应：成功值、处理函数报告的错误，或求值流程合成的错误；
//! - 合成错误的消息是对外契约，客户端据此定位问题，因此逐字断言。
//!
//! ## 测试策略（How）
//! - 使用两个执行器的小规模处理器，返回通道接到 mpsc 通道上按 `callback_id` 取回响应。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use spark_rpc::{Map, ProcessorConfig, RTValue, Runtime, Service, ServiceMeta, Value, codes};
use support::{Harness, Reply, decode_reply, request, small_config};

fn arith() -> ServiceMeta {
    let service = Service::new()
        .on("Add", |rt: Runtime, a: i64, b: i64| rt.ok(a + b))
        .on("Op", |rt: Runtime| rt.ok(()))
        .on("Fail", |rt: Runtime, reason: String| rt.error(reason))
        .on("Boom", |rt: Runtime| -> spark_rpc::Return {
            let _ = &rt;
            panic!("boom")
        });
    ServiceMeta::new("svc", service, Map::new())
}

/// 目标不存在时返回 `target <path> does not exist`。
#[test]
fn unknown_target_is_reported() {
    let harness = Harness::start(vec![arith()]);
    let (code, message) = harness.call(1, "#.unknown:Op", &[]).error();
    assert_eq!(code, codes::TARGET_NOT_EXIST.code());
    assert_eq!(message, "target #.unknown:Op does not exist");
}

/// 请求深度达到 `max_call_depth` 时在派发前拒绝。
#[test]
fn call_depth_overflow_is_reported() {
    let config = ProcessorConfig {
        max_call_depth: 3,
        ..small_config()
    };
    let harness = Harness::start_with(config, vec![arith()], None).expect("处理器应当启动");
    let mut stream = request(1, "#.svc:Op", &[]);
    stream.set_depth(3);
    assert!(harness.processor.submit(stream));

    let (code, message) = harness.responses.reply(1).error();
    assert_eq!(code, codes::CALL_OVERFLOW.code());
    assert_eq!(message, "call #.svc:Op level(3) overflows");

    let mut stream = request(2, "#.svc:Op", &[]);
    stream.set_depth(2);
    assert!(harness.processor.submit(stream));
    assert_eq!(harness.responses.reply(2), Reply::Ok(Value::Nil));
}

/// 成功响应的头部沿用请求头部，正文为 `0` 与返回值。
#[test]
fn successful_call_echoes_header() {
    let harness = Harness::start(vec![arith()]);
    let mut stream = request(9, "#.svc:Add", &[Value::from(40i64), Value::from(2i64)]);
    stream.set_session_id(77);
    stream.set_target_id(5);
    assert!(harness.processor.submit(stream));

    let mut response = harness.responses.stream(9);
    assert_eq!(response.session_id(), 77);
    assert_eq!(response.target_id(), 5);
    assert_eq!(decode_reply(&mut response), Reply::Ok(Value::from(42i64)));
    response.release();

    let stats = harness
        .processor
        .action_stats("#.svc:Add")
        .expect("动作应当存在");
    assert_eq!(stats.kind, "II");
    assert_eq!(stats.perf.total, 1);
    assert_eq!(stats.perf.failures, 0);
}

/// 参数类型不符时指出第几个参数、期望类型与实际类型；`Runtime` 计为第 1 个参数。
#[test]
fn argument_mismatch_names_position_and_types() {
    let harness = Harness::start(vec![arith()]);
    let (code, message) = harness
        .call(1, "#.svc:Add", &[Value::from(1i64), Value::from("two")])
        .error();
    assert_eq!(code, codes::ARGUMENTS_NOT_MATCH.code());
    assert_eq!(
        message,
        "#.svc:Add 3rd argument does not match: want int64, got string"
    );

    let (_, message) = harness.call(2, "#.svc:Add", &[Value::from(1i64)]).error();
    assert_eq!(
        message,
        "#.svc:Add 3rd argument does not match: want int64, got <eof>"
    );
}

/// 参数之后仍有多余字节时以流错误拒绝，处理函数不被调用。
#[test]
fn trailing_bytes_are_a_stream_error() {
    let harness = Harness::start(vec![arith()]);
    let (code, message) = harness
        .call(
            1,
            "#.svc:Add",
            &[Value::from(1i64), Value::from(2i64), Value::from(3i64)],
        )
        .error();
    assert_eq!(code, codes::STREAM.code());
    assert_eq!(message, "stream error");
    let stats = harness
        .processor
        .action_stats("#.svc:Add")
        .expect("动作应当存在");
    assert_eq!(stats.perf.failures, 1);
}

/// 处理函数报告的普通错误以动作错误码写回。
#[test]
fn handler_error_is_returned() {
    let harness = Harness::start(vec![arith()]);
    let (code, message) = harness
        .call(1, "#.svc:Fail", &[Value::from("quota exceeded")])
        .error();
    assert_eq!(code, codes::ACTION.code());
    assert_eq!(message, "quota exceeded");
}

/// 处理函数 panic 被捕获为错误响应，执行器继续服务后续请求。
#[test]
fn handler_panic_becomes_error_and_executor_survives() {
    let harness = Harness::start(vec![arith()]);
    for callback_id in 1..=4 {
        let (code, message) = harness.call(callback_id, "#.svc:Boom", &[]).error();
        assert_eq!(code, codes::ACTION_PANIC.code());
        assert_eq!(message, "#.svc:Boom panic: boom");
    }
    assert_eq!(
        harness
            .call(5, "#.svc:Add", &[Value::from(2i64), Value::from(3i64)])
            .value(),
        Value::from(5i64)
    );
}

/// 嵌套调用：内层动作看到的调用方是外层动作路径，深度为外层加一。
#[test]
fn nested_call_carries_caller_and_depth() {
    let outer = Service::new().on("Outer", |rt: Runtime| {
        let inner = rt.call("#.b:Inner", &[Value::from(7i64)]);
        if inner.err().is_some() {
            return rt.error(&inner);
        }
        let depth = rt.depth().expect("外层应当可以读取深度");
        let out = rt.new_rt_map(2).expect("应当可以创建映射");
        out.set("outer_depth", u64::from(depth)).expect("写入失败");
        out.set("inner", inner).expect("写入失败");
        rt.ok(out)
    });
    let inner = Service::new().on("Inner", |rt: Runtime, seed: i64| {
        let mut seen = Map::new();
        seen.insert(
            "from".to_owned(),
            Value::from(rt.caller().expect("内层应当可以读取调用方")),
        );
        seen.insert(
            "depth".to_owned(),
            Value::from(u64::from(rt.depth().expect("内层应当可以读取深度"))),
        );
        seen.insert("seed".to_owned(), Value::from(seed));
        rt.ok(seen)
    });
    let harness = Harness::start(vec![
        ServiceMeta::new("a", outer, Map::new()),
        ServiceMeta::new("b", inner, Map::new()),
    ]);

    let reply = harness.call(1, "#.a:Outer", &[]).value();
    let reply = reply.as_map().expect("响应应为映射");
    assert_eq!(reply.get("outer_depth"), Some(&Value::from(0u64)));
    let seen = reply
        .get("inner")
        .and_then(Value::as_map)
        .expect("内层结果应为映射");
    assert_eq!(seen.get("from"), Some(&Value::from("#.a:Outer")));
    assert_eq!(seen.get("depth"), Some(&Value::from(1u64)));
    assert_eq!(seen.get("seed"), Some(&Value::from(7i64)));
}

/// 嵌套调用失败时上游错误原样透传给外层。
#[test]
fn nested_failure_propagates_upstream_error() {
    let outer = Service::new().on("Outer", |rt: Runtime| {
        let inner: RTValue = rt.call("#.missing:Op", &[]);
        match inner.to_value() {
            Ok(value) => rt.ok(value),
            Err(err) => rt.error(err),
        }
    });
    let harness = Harness::start(vec![ServiceMeta::new("a", outer, Map::new())]);
    let (code, message) = harness.call(1, "#.a:Outer", &[]).error();
    assert_eq!(code, codes::TARGET_NOT_EXIST.code());
    assert_eq!(message, "target #.missing:Op does not exist");
}

/// 递归调用在达到深度上限时停止，错误逐层透传。
#[test]
fn recursion_stops_at_depth_limit() {
    let service = Service::new().on("Dive", |rt: Runtime| {
        let next = rt.call("#.deep:Dive", &[]);
        rt.error(&next)
    });
    let config = ProcessorConfig {
        max_call_depth: 4,
        ..small_config()
    };
    let harness = Harness::start_with(config, vec![ServiceMeta::new("deep", service, Map::new())], None)
        .expect("处理器应当启动");
    let (code, message) = harness.call(1, "#.deep:Dive", &[]).error();
    assert_eq!(code, codes::CALL_OVERFLOW.code());
    assert_eq!(message, "call #.deep:Dive level(4) overflows");
}

/// 并发请求分散到全部执行器上，每个请求恰好得到一个响应。
#[test]
fn concurrent_requests_each_get_one_reply() {
    let harness = Harness::start(vec![arith()]);
    for callback_id in 1..=64u64 {
        let args = [Value::from(callback_id as i64), Value::from(1i64)];
        assert!(harness.processor.submit(request(callback_id, "#.svc:Add", &args)));
    }
    for callback_id in 1..=64u64 {
        assert_eq!(
            harness.responses.reply(callback_id),
            Reply::Ok(Value::from(callback_id as i64 + 1))
        );
    }
    let stats = harness
        .processor
        .action_stats("#.svc:Add")
        .expect("动作应当存在");
    assert_eq!(stats.perf.total, 64);
}

/// 关闭后拒绝新请求；重复关闭是幂等的。
#[test]
fn submit_after_close_is_rejected() {
    let harness = Harness::start(vec![arith()]);
    assert!(harness.processor.close());
    assert!(!harness.processor.is_running());
    assert!(!harness.processor.submit(request(1, "#.svc:Op", &[])));
    assert!(harness.processor.close());
    assert!(harness.processor.service_paths().is_empty());
}

/// 关闭期限内未返回的处理函数被汇总为一条内核报告。
#[test]
fn close_timeout_reports_stuck_actions() {
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Arc::new(Mutex::new(started_tx));
    let service = Service::new().on("Sleep", move |rt: Runtime| {
        let _ = started_tx.lock().send(());
        std::thread::sleep(Duration::from_millis(400));
        rt.ok(())
    });
    let config = ProcessorConfig {
        close_timeout_ms: 50,
        ..small_config()
    };
    let harness = Harness::start_with(config, vec![ServiceMeta::new("slow", service, Map::new())], None)
        .expect("处理器应当启动");
    assert!(harness.processor.submit(request(1, "#.slow:Sleep", &[])));
    started_rx
        .recv_timeout(support::WAIT)
        .expect("处理函数应当开始执行");

    assert!(!harness.processor.close(), "仍有处理函数未返回");
    let report = harness.responses.report(&codes::CLOSE_TIMEOUT, "#.slow:Sleep");
    assert_eq!(
        report.message(),
        "actions did not return before close timeout: #.slow:Sleep (1)"
    );
}

/// 执行器全部忙碌时提交方阻塞等待，执行器归还后请求照常完成。
#[test]
fn submit_waits_for_a_free_executor() {
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let started_tx = Arc::new(Mutex::new(started_tx));
    let gate_rx = Arc::new(Mutex::new(gate_rx));
    let service = Service::new()
        .on("Hold", move |rt: Runtime| {
            let _ = started_tx.lock().send(());
            match gate_rx.lock().recv_timeout(support::WAIT) {
                Ok(()) => rt.ok("released"),
                Err(_) => rt.error("gate was never opened"),
            }
        })
        .on("Add", |rt: Runtime, a: i64, b: i64| rt.ok(a + b));
    let harness = Harness::start(vec![ServiceMeta::new("busy", service, Map::new())]);
    assert_eq!(harness.processor.config().effective_threads(), 2);

    for callback_id in [1, 2] {
        assert!(harness.processor.submit(request(callback_id, "#.busy:Hold", &[])));
        started_rx.recv_timeout(support::WAIT).expect("处理函数应当开始执行");
    }

    std::thread::scope(|scope| {
        let pending = scope.spawn(|| {
            harness
                .processor
                .submit(request(3, "#.busy:Add", &[Value::from(1i64), Value::from(2i64)]))
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!pending.is_finished(), "没有空闲执行器时提交应当等待");
        gate_tx.send(()).expect("闸门应当打开");
        gate_tx.send(()).expect("闸门应当打开");
        assert!(pending.join().expect("提交线程不应 panic"));
    });

    assert_eq!(harness.responses.reply(1).value(), Value::from("released"));
    assert_eq!(harness.responses.reply(2).value(), Value::from("released"));
    assert_eq!(harness.responses.reply(3).value(), Value::from(3i64));
}

/// 关闭期限为零时，空闲执行器不会被误报为未返回的动作。
#[test]
fn close_timeout_ignores_idle_executors() {
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Arc::new(Mutex::new(started_tx));
    let service = Service::new().on("Sleep", move |rt: Runtime| {
        let _ = started_tx.lock().send(());
        std::thread::sleep(Duration::from_millis(300));
        rt.ok(())
    });
    let config = ProcessorConfig {
        num_of_threads: 6,
        close_timeout_ms: 0,
        ..small_config()
    };
    let harness = Harness::start_with(config, vec![ServiceMeta::new("idle", service, Map::new())], None)
        .expect("处理器应当启动");
    assert!(harness.processor.submit(request(1, "#.idle:Sleep", &[])));
    started_rx
        .recv_timeout(support::WAIT)
        .expect("处理函数应当开始执行");

    assert!(!harness.processor.close(), "仍有处理函数未返回");
    let report = harness.responses.report(&codes::CLOSE_TIMEOUT, "#.idle:Sleep");
    assert_eq!(
        report.message(),
        "actions did not return before close timeout: #.idle:Sleep (1)"
    );
}

/// 同一动作被大量调用后，耗时统计落在首个分桶内。
#[test]
fn perf_counters_track_every_call() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let service = Service::new().on("Hit", move |rt: Runtime| {
        rt.ok(counter.fetch_add(1, Ordering::SeqCst) as u64)
    });
    let harness = Harness::start(vec![ServiceMeta::new("svc", service, Map::new())]);
    for callback_id in 1..=10 {
        harness.call(callback_id, "#.svc:Hit", &[]).value();
    }
    let stats = harness
        .processor
        .action_stats("#.svc:Hit")
        .expect("动作应当存在");
    assert_eq!(stats.kind, "");
    assert_eq!(stats.perf.total, 10);
    assert_eq!(stats.perf.buckets.iter().sum::<u64>(), 10);
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}
