use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};

use crate::error::{RpcError, codes};
use crate::wire::{FrameCodec, Stream};

use super::{StreamConn, StreamReceiver};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Outbound {
    frames: Vec<Vec<u8>>,
}

/// 进程内回环连接。
///
/// 客户端一侧以 [`MemoryConn::send`] 或 [`MemoryConn::feed`] 写入字节，经 [`FrameCodec`] 切帧后
/// 同步交给接收方；服务端写出的流按线上格式编码后保存，测试可用
/// [`MemoryConn::wait_for_frames`] 等待并取回。
pub struct MemoryConn {
    id: u64,
    codec: FrameCodec,
    receiver: Weak<dyn StreamReceiver>,
    this: Weak<MemoryConn>,
    inbound: Mutex<BytesMut>,
    outbound: Mutex<Outbound>,
    written: Condvar,
    closed: AtomicBool,
}

impl MemoryConn {
    /// 建立连接并触发接收方的 `on_open`。
    pub fn connect(receiver: &Arc<dyn StreamReceiver>) -> Arc<Self> {
        Self::with_codec(receiver, FrameCodec::new())
    }

    pub fn with_codec(receiver: &Arc<dyn StreamReceiver>, codec: FrameCodec) -> Arc<Self> {
        let conn = Arc::new_cyclic(|this| Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            codec,
            receiver: Arc::downgrade(receiver),
            this: this.clone(),
            inbound: Mutex::new(BytesMut::new()),
            outbound: Mutex::new(Outbound::default()),
            written: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        let dyn_conn: Arc<dyn StreamConn> = conn.clone();
        receiver.on_open(&dyn_conn);
        conn
    }

    fn as_dyn(&self) -> Option<Arc<dyn StreamConn>> {
        self.this.upgrade().map(|conn| conn as Arc<dyn StreamConn>)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 以线上格式发送一个流并释放它。
    pub fn send(&self, stream: Box<Stream>) -> Result<(), RpcError> {
        let mut wire = BytesMut::new();
        let encoded = self.codec.encode(&stream, &mut wire);
        stream.release();
        encoded?;
        self.feed(&wire);
        Ok(())
    }

    /// 送入任意切分的原始字节；凑齐完整帧后逐个交给接收方。
    pub fn feed(&self, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }
        let (Some(receiver), Some(conn)) = (self.receiver.upgrade(), self.as_dyn()) else {
            return;
        };
        let mut frames = Vec::new();
        let failure = {
            let mut inbound = self.inbound.lock();
            inbound.extend_from_slice(bytes);
            loop {
                match self.codec.decode(&mut inbound) {
                    Ok(Some(stream)) => frames.push(stream),
                    Ok(None) => break None,
                    Err(err) => break Some(err),
                }
            }
        };
        for stream in frames {
            receiver.on_read_stream(&conn, stream);
        }
        if let Some(err) = failure {
            receiver.on_error(&conn, err.into());
            self.close();
        }
    }

    /// 等待服务端累计写出至少 `count` 帧，超时返回 `false`。
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outbound = self.outbound.lock();
        while outbound.frames.len() < count {
            if self.written.wait_until(&mut outbound, deadline).timed_out() {
                return outbound.frames.len() >= count;
            }
        }
        true
    }

    /// 服务端写出的全部帧的原始字节（含长度前缀）。
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().frames.clone()
    }

    /// 把服务端写出的全部帧解码为流。
    pub fn written_streams(&self) -> Result<Vec<Box<Stream>>, RpcError> {
        let mut streams = Vec::new();
        for frame in self.written_frames() {
            let mut wire = BytesMut::from(frame.as_slice());
            if let Some(stream) = self.codec.decode(&mut wire)? {
                streams.push(stream);
            }
        }
        Ok(streams)
    }
}

impl StreamConn for MemoryConn {
    fn conn_id(&self) -> u64 {
        self.id
    }

    fn write_stream_and_release(&self, stream: Box<Stream>) -> Result<(), RpcError> {
        if self.is_closed() {
            stream.release();
            return Err(codes::TRANSPORT_CONN.with_message(format!("connection {} is closed", self.id)));
        }
        let mut wire = BytesMut::new();
        let encoded = self.codec.encode(&stream, &mut wire);
        stream.release();
        encoded?;
        self.outbound.lock().frames.push(wire.to_vec());
        self.written.notify_all();
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(receiver), Some(conn)) = (self.receiver.upgrade(), self.as_dyn()) {
            receiver.on_close(&conn);
        }
        self.written.notify_all();
    }
}

impl std::fmt::Debug for MemoryConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConn")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("written", &self.outbound.lock().frames.len())
            .finish()
    }
}
