use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::transport::StreamConn;
use crate::wire::Stream;

use super::channel::{Admission, Channel};

/// 令牌中安全串的十六进制长度。
const SECRET_LEN: usize = 32;

/// 由会话编号、当前时间与进程随机种子派生安全串。
fn derive_secret(id: u64) -> String {
    let mut seed = RandomState::new().build_hasher();
    seed.write_u64(id);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    let mut hasher = Sha256::new();
    hasher.update(id.to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(seed.finish().to_le_bytes());
    let mut secret = hex::encode(hasher.finalize());
    secret.truncate(SECRET_LEN);
    secret
}

/// 把 `"<id>-<secret>"` 拆成编号与安全串。
pub(crate) fn parse_token(token: &str) -> Option<(u64, &str)> {
    let (id, secret) = token.split_once('-')?;
    let id = id.parse().ok()?;
    (!secret.is_empty()).then_some((id, secret))
}

/// 一个客户端的长期会话：通道环、安全令牌、当前绑定的连接。
pub(crate) struct Session {
    id: u64,
    token: String,
    conn: Mutex<Option<Arc<dyn StreamConn>>>,
    channels: Mutex<Vec<Channel>>,
    last_active: Mutex<Instant>,
    disconnected_at: Mutex<Option<Instant>>,
}

impl Session {
    pub(crate) fn new(id: u64, num_of_channels: usize, now: Instant) -> Self {
        Self {
            id,
            token: format!("{id}-{}", derive_secret(id)),
            conn: Mutex::new(None),
            channels: Mutex::new((0..num_of_channels).map(|_| Channel::default()).collect()),
            last_active: Mutex::new(now),
            disconnected_at: Mutex::new(Some(now)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub(crate) fn touch(&self, now: Instant) {
        *self.last_active.lock() = now;
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }

    /// 绑定新连接，返回被替换的旧连接。
    pub(crate) fn bind(&self, conn: Arc<dyn StreamConn>, now: Instant) -> Option<Arc<dyn StreamConn>> {
        *self.disconnected_at.lock() = None;
        self.touch(now);
        self.conn.lock().replace(conn)
    }

    /// 仅当当前绑定的就是 `conn_id` 时解绑。
    pub(crate) fn unbind(&self, conn_id: u64, now: Instant) -> Option<Arc<dyn StreamConn>> {
        let mut conn = self.conn.lock();
        if conn.as_ref().is_some_and(|bound| bound.conn_id() == conn_id) {
            *self.disconnected_at.lock() = Some(now);
            return conn.take();
        }
        None
    }

    /// 无条件解绑当前连接。
    pub(crate) fn detach(&self, now: Instant) -> Option<Arc<dyn StreamConn>> {
        let conn = self.conn.lock().take();
        if conn.is_some() {
            *self.disconnected_at.lock() = Some(now);
        }
        conn
    }

    pub(crate) fn disconnected_for(&self, now: Instant) -> Option<Duration> {
        self.disconnected_at
            .lock()
            .map(|at| now.saturating_duration_since(at))
    }

    fn channel_index(&self, callback_id: u64, channels: usize) -> usize {
        (callback_id % channels as u64) as usize
    }

    pub(crate) fn admit(&self, callback_id: u64) -> Admission {
        let mut channels = self.channels.lock();
        let index = self.channel_index(callback_id, channels.len());
        channels[index].admit(callback_id)
    }

    pub(crate) fn on_return(&self, stream: Box<Stream>, now: Instant) -> Option<Box<Stream>> {
        let mut channels = self.channels.lock();
        let index = self.channel_index(stream.callback_id(), channels.len());
        channels[index].on_return(stream, now)
    }

    pub(crate) fn sweep_replies(&self, now: Instant, ttl: Duration) -> usize {
        self.channels
            .lock()
            .iter_mut()
            .filter_map(|channel| channel.sweep(now, ttl).then_some(()))
            .count()
    }

    /// 经由当前连接写出；没有连接时释放流并返回 `false`。
    pub(crate) fn send(&self, stream: Box<Stream>) -> bool {
        let conn = self.conn.lock();
        match conn.as_ref() {
            Some(conn) => match conn.write_stream_and_release(stream) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(session_id = self.id, error = %err, "session write failed");
                    false
                }
            },
            None => {
                stream.release();
                false
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("bound", &self.conn.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_embeds_id_and_secret() {
        let session = Session::new(42, 4, Instant::now());
        let (id, secret) = parse_token(session.token()).expect("令牌应当可解析");
        assert_eq!(id, 42);
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(secret.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(session.token(), Session::new(42, 4, Instant::now()).token());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert_eq!(parse_token(""), None);
        assert_eq!(parse_token("abc-def"), None);
        assert_eq!(parse_token("12-"), None);
        assert_eq!(parse_token("12-ff"), Some((12, "ff")));
    }
}
