//! 属性测试：任意动态值与任意切分方式下的编解码不变量。
//!
//! ## 设计意图（Why）
//! - 读取必须恰好消费写入的字节：解码后读游标等于写游标，跳读长度等于编码长度；
//! - 传输层可能以任意粒度交付字节，帧编解码器的输出不能依赖切分方式；
//! - 值可以从任意写偏移开始，跨越 512 字节分段边界时读写结果不变。

use bytes::BytesMut;
use proptest::collection::{hash_map, vec};
use proptest::prelude::*;
use spark_rpc::wire::{SEGMENT_SIZE, STREAM_BODY_POS};
use spark_rpc::{FrameCodec, Map, Stream, Value};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Nil),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        any::<i32>().prop_map(|v| Value::from(f64::from(v) / 8.0)),
        "\\PC{0,80}".prop_map(Value::from),
        vec(any::<u8>(), 0..80).prop_map(Value::from),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..8).prop_map(Value::Array),
            hash_map("[a-z]{1,6}", inner, 0..8).prop_map(Value::Map),
        ]
    })
}

/// 写入填充值，使写游标恰好落在 `target`。
fn pad_to(stream: &mut Stream, target: usize) {
    loop {
        let gap = target - stream.write_pos();
        let written = match gap {
            0 => return,
            // 长字节串：操作码 + 4 字节总长 + 至少 63 字节正文。
            68.. => stream.write_bytes(&vec![0u8; gap - 5]),
            2..=63 => stream.write_bytes(&vec![0u8; gap - 1]),
            _ => {
                stream.write_nil();
                Ok(())
            }
        };
        written.expect("填充应当可写");
    }
}

fn straddling_sample() -> Value {
    let mut map = Map::new();
    map.insert("name".to_owned(), Value::from("段"));
    map.insert("blob".to_owned(), Value::from(vec![0xA5u8; 70]));
    map.insert("text".to_owned(), Value::from("é".repeat(40)));
    Value::Array(vec![
        Value::from(-40_000i64),
        Value::Map(map),
        Value::from(u64::MAX),
        Value::from(0.5f64),
        Value::from("x".repeat(62)),
    ])
}

/// 从正文起点到第四个分段之内的每一个写偏移，同一个值都能原样读回。
#[test]
fn every_write_offset_round_trips() {
    let value = straddling_sample();
    for offset in STREAM_BODY_POS..=3 * SEGMENT_SIZE + 64 {
        let mut stream = Stream::new();
        pad_to(&mut stream, offset);
        assert_eq!(stream.write_pos(), offset);
        stream.write_value(&value).expect("样本应当可写");

        assert!(stream.set_read_pos(offset));
        assert_eq!(stream.read_value().expect("样本应当可读"), value, "偏移 {offset}");
        assert_eq!(stream.read_pos(), stream.write_pos(), "偏移 {offset}");
        stream.release();
    }
}

proptest! {
    #[test]
    fn decoded_value_consumes_exactly_what_was_written(v in value(), prefix in any::<u64>()) {
        let mut stream = Stream::new();
        stream.write_uint64(prefix);
        let start = stream.write_pos();
        stream.write_value(&v).expect("任意值都应当可写");
        let encoded_len = stream.write_pos() - start;

        prop_assert_eq!(stream.read_uint64().expect("前缀应当可读"), prefix);
        let skip_from = stream.read_pos();
        let skipped = stream.read_skip_item(stream.write_pos()).expect("应当可以跳过");
        prop_assert_eq!(skipped, encoded_len);

        stream.set_read_pos(skip_from);
        let decoded = stream.read_value().expect("应当可以读回");
        prop_assert_eq!(decoded, v);
        prop_assert_eq!(stream.read_pos(), stream.write_pos());
        stream.release();
    }

    #[test]
    fn frames_survive_arbitrary_chunking(
        v in value(),
        callback_id in 1u64..,
        cuts in vec(1usize..97, 1..16),
    ) {
        let codec = FrameCodec::new();
        let mut original = Stream::new();
        original.set_callback_id(callback_id);
        original.write_value(&v).expect("任意值都应当可写");
        let mut wire = BytesMut::new();
        codec.encode(&original, &mut wire).expect("编码失败");
        let bytes = wire.to_vec();

        let mut inbound = BytesMut::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();
        while offset < bytes.len() {
            let step = (*cut.next().unwrap_or(&1)).min(bytes.len() - offset);
            inbound.extend_from_slice(&bytes[offset..offset + step]);
            offset += step;
            while let Some(stream) = codec.decode(&mut inbound).expect("解码失败") {
                decoded.push(stream);
            }
        }

        prop_assert_eq!(decoded.len(), 1);
        let frame = decoded.pop().expect("应当恰好一帧");
        prop_assert_eq!(frame.to_bytes(), original.to_bytes());
        prop_assert!(inbound.is_empty());
        frame.release();
        original.release();
    }

    #[test]
    fn values_round_trip_from_any_offset(
        v in value(),
        offset in STREAM_BODY_POS..=3 * SEGMENT_SIZE + 64,
    ) {
        let mut stream = Stream::new();
        pad_to(&mut stream, offset);
        stream.write_value(&v).expect("任意值都应当可写");
        prop_assert!(stream.set_read_pos(offset));
        prop_assert_eq!(stream.read_value().expect("应当可以读回"), v);
        prop_assert_eq!(stream.read_pos(), stream.write_pos());
        stream.release();
    }
}
