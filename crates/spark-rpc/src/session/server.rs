use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use dashmap::DashMap;

use crate::config::SessionConfig;
use crate::error::{RpcError, codes};
use crate::executor::write_error_body;
use crate::processor::{ReturnSink, StreamSubmitter};
use crate::transport::{StreamConn, StreamReceiver};
use crate::wire::Stream;

use super::channel::Admission;
use super::context::{Session, parse_token};
use super::control::{self, ConnectInfo, ControlKind};

/// 一次清扫的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 断线超过 `session_timeout` 被移除的会话数。
    pub evicted_sessions: usize,
    /// 心跳超时被关闭的连接数。
    pub closed_connections: usize,
    /// 超过 `cache_timeout` 被清除的缓存回复数。
    pub cleared_replies: usize,
}

/// 会话服务端：连接事件的接收方，同时是处理器的返回通道。
///
/// # 教案式说明
/// - **意图 (Why)**：在传输层与处理器之间实现会话令牌、通道去重与回复重发；
/// - **契约 (What)**：
///   - `callback_id == 0` 的流是控制帧：握手、`Ping`/`Pong`；其余流必须来自已握手的连接；
///   - 每个请求按 `callback_id % num_of_channels` 进入通道，同一编号最多被执行一次；
///   - 处理器返回的响应只有在编号仍为通道当前序号时才发送并缓存，超过传输上限的响应被替换为
///     [`codes::TRANSPORT_LIMIT`] 错误；
///   - 无法解析的控制帧与未握手连接上的请求：写回错误后关闭连接；
/// - **执行 (How)**：会话表与连接绑定表都是 `DashMap`，读取后立即克隆 `Arc` 并释放分片锁，
///   所有写连接的操作都在会话自己的互斥锁内完成；
/// - **风险 (Trade-offs)**：清扫线程按 `sweep_interval` 轮询全部会话，会话数量极大时应调大周期。
pub struct SessionServer {
    config: SessionConfig,
    sessions: DashMap<u64, Arc<Session>>,
    bindings: DashMap<u64, u64>,
    next_id: AtomicU64,
    submitter: OnceLock<Arc<dyn StreamSubmitter>>,
}

impl SessionServer {
    /// 校验配置后创建服务端；无法运行的配置（如零个通道）以 [`codes::CONFIG_INVALID`] 拒绝。
    pub fn new(config: SessionConfig) -> Result<Arc<Self>, RpcError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            sessions: DashMap::new(),
            bindings: DashMap::new(),
            next_id: AtomicU64::new(1),
            submitter: OnceLock::new(),
        }))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 绑定请求的去向；只能绑定一次，重复绑定返回 `false`。
    pub fn bind_submitter(&self, submitter: Arc<dyn StreamSubmitter>) -> bool {
        self.submitter.set(submitter).is_ok()
    }

    /// 供 [`Processor::new`](crate::Processor::new) 使用的返回通道；只持有弱引用。
    pub fn return_sink(self: &Arc<Self>) -> ReturnSink {
        let server = Arc::downgrade(self);
        Arc::new(move |stream: Box<Stream>| match server.upgrade() {
            Some(server) => server.on_return(stream),
            None => stream.release(),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn session_of(&self, conn: &Arc<dyn StreamConn>) -> Option<Arc<Session>> {
        let id = self.bindings.get(&conn.conn_id()).map(|entry| *entry.value())?;
        self.session(id)
    }

    /// 处理器返回的响应。
    pub fn on_return(&self, mut stream: Box<Stream>) {
        let session_id = stream.session_id();
        let callback_id = stream.callback_id();
        let session = match self.session(session_id) {
            Some(session) if callback_id != 0 => session,
            _ => {
                tracing::debug!(session_id, callback_id, "response without live session dropped");
                stream.release();
                return;
            }
        };
        if stream.len() > self.config.trans_limit {
            let err = codes::TRANSPORT_LIMIT.with_message(format!(
                "stream length {} exceeds transport limit {}",
                stream.len(),
                self.config.trans_limit
            ));
            write_error_body(&mut stream, &err);
        }
        match session.on_return(stream, Instant::now()) {
            Some(outgoing) => {
                session.send(outgoing);
            }
            None => tracing::debug!(session_id, callback_id, "stale response dropped"),
        }
    }

    /// 写回一个控制帧错误并关闭连接。
    fn reject(&self, conn: &Arc<dyn StreamConn>, err: RpcError) {
        tracing::warn!(conn = conn.conn_id(), code = err.code(), error = %err, "connection rejected");
        let mut stream = Stream::new();
        stream.set_callback_id(0);
        write_error_body(&mut stream, &err);
        let _ = conn.write_stream_and_release(stream);
        conn.close();
    }

    fn resume(&self, token: &str) -> Option<Arc<Session>> {
        let (id, _) = parse_token(token)?;
        self.session(id).filter(|session| session.token() == token)
    }

    fn on_connect(&self, conn: &Arc<dyn StreamConn>, mut stream: Box<Stream>) {
        let token = stream.read_string();
        stream.release();
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                return self.reject(
                    conn,
                    codes::BAD_CONTROL_STREAM.with_message(format!("control stream is illegal: {err}")),
                );
            }
        };

        let now = Instant::now();
        let session = match self.resume(&token) {
            Some(session) => session,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let session = Arc::new(Session::new(id, self.config.num_of_channels, now));
                self.sessions.insert(id, Arc::clone(&session));
                session
            }
        };

        if let Some(previous) = self.bindings.insert(conn.conn_id(), session.id())
            && previous != session.id()
            && let Some(old) = self.session(previous)
        {
            old.unbind(conn.conn_id(), now);
        }
        if let Some(replaced) = session.bind(Arc::clone(conn), now)
            && replaced.conn_id() != conn.conn_id()
        {
            self.bindings.remove(&replaced.conn_id());
            replaced.close();
        }

        let resumed = !token.is_empty() && token == session.token();
        tracing::info!(session_id = session.id(), conn = conn.conn_id(), resumed, "session connected");
        match ConnectInfo::new(session.token(), &self.config).to_stream(session.id()) {
            Ok(reply) => {
                if let Err(err) = conn.write_stream_and_release(reply) {
                    tracing::warn!(session_id = session.id(), error = %err, "connect response not delivered");
                }
            }
            Err(err) => self.reject(conn, err),
        }
    }

    fn on_control(&self, conn: &Arc<dyn StreamConn>, mut stream: Box<Stream>) {
        let kind = control::read_kind(&mut stream);
        if let Some(session) = self.session_of(conn) {
            session.touch(Instant::now());
        }
        match kind {
            Ok(ControlKind::ConnectRequest) => self.on_connect(conn, stream),
            Ok(ControlKind::Ping) => {
                if control::ping_to_pong(&mut stream) {
                    let _ = conn.write_stream_and_release(stream);
                } else {
                    stream.release();
                }
            }
            Ok(ControlKind::Pong) => stream.release(),
            Ok(ControlKind::ConnectResponse) => {
                stream.release();
                self.reject(
                    conn,
                    codes::BAD_CONTROL_STREAM
                        .with_message("control stream is illegal: unexpected connect response"),
                );
            }
            Err(err) => {
                stream.release();
                self.reject(conn, err);
            }
        }
    }

    fn on_request(&self, conn: &Arc<dyn StreamConn>, mut stream: Box<Stream>) {
        let Some(session) = self.session_of(conn) else {
            stream.release();
            return self.reject(conn, codes::SECURITY_ILLEGAL_SESSION.error());
        };
        stream.set_session_id(session.id());
        session.touch(Instant::now());
        match session.admit(stream.callback_id()) {
            Admission::Forward => {
                let header = stream.header();
                let submitted = match self.submitter.get() {
                    Some(submitter) => submitter.submit(stream),
                    None => {
                        stream.release();
                        false
                    }
                };
                if !submitted {
                    let mut response = Stream::new();
                    response.set_header(&header);
                    write_error_body(&mut response, &codes::PROCESSOR_CLOSED.error());
                    self.on_return(response);
                }
            }
            Admission::Replay(cached) => {
                tracing::debug!(session_id = session.id(), callback_id = cached.callback_id(), "cached reply replayed");
                stream.release();
                session.send(cached);
            }
            Admission::Discard => stream.release(),
        }
    }

    /// 清扫一次：清除过期缓存、关闭心跳超时的连接、移除断线过久的会话。
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            report.cleared_replies += session.sweep_replies(now, self.config.cache_timeout());
            if let Some(offline) = session.disconnected_for(now) {
                if offline > self.config.session_timeout() {
                    self.sessions.remove(&session.id());
                    report.evicted_sessions += 1;
                    tracing::info!(session_id = session.id(), "session evicted");
                }
                continue;
            }
            if session.idle_for(now) > self.config.heartbeat_timeout()
                && let Some(conn) = session.detach(now)
            {
                self.bindings.remove(&conn.conn_id());
                conn.close();
                report.closed_connections += 1;
                tracing::info!(session_id = session.id(), conn = conn.conn_id(), "heartbeat timeout");
            }
        }
        report
    }

    /// 启动后台清扫线程，句柄析构时停止。
    pub fn spawn_sweeper(self: &Arc<Self>) -> Result<SweeperHandle, RpcError> {
        let server = Arc::downgrade(self);
        let interval = self.config.sweep_interval();
        let (stop, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("spark-rpc-session-sweeper".to_owned())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    let Some(server) = server.upgrade() else {
                        break;
                    };
                    let report = server.sweep(Instant::now());
                    if report != SweepReport::default() {
                        tracing::debug!(?report, "session sweep");
                    }
                }
            })
            .map_err(|err| codes::KERNEL.with_message(format!("failed to spawn session sweeper: {err}")))?;
        Ok(SweeperHandle {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl StreamReceiver for SessionServer {
    fn on_open(&self, conn: &Arc<dyn StreamConn>) {
        tracing::debug!(conn = conn.conn_id(), "connection opened");
    }

    fn on_read_stream(&self, conn: &Arc<dyn StreamConn>, stream: Box<Stream>) {
        if stream.callback_id() == 0 {
            self.on_control(conn, stream);
        } else {
            self.on_request(conn, stream);
        }
    }

    fn on_error(&self, conn: &Arc<dyn StreamConn>, err: RpcError) {
        tracing::warn!(conn = conn.conn_id(), code = err.code(), error = %err, "connection error");
    }

    fn on_close(&self, conn: &Arc<dyn StreamConn>) {
        let Some((_, session_id)) = self.bindings.remove(&conn.conn_id()) else {
            return;
        };
        if let Some(session) = self.session(session_id) {
            session.unbind(conn.conn_id(), Instant::now());
        }
        tracing::debug!(conn = conn.conn_id(), session_id, "connection closed");
    }
}

impl std::fmt::Debug for SessionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServer")
            .field("sessions", &self.sessions.len())
            .field("connections", &self.bindings.len())
            .finish()
    }
}

/// 清扫线程句柄。
#[derive(Debug)]
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("session sweeper panicked");
        }
    }
}
