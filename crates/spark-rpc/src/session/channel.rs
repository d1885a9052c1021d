use std::time::{Duration, Instant};

use crate::wire::Stream;

/// 通道对一个请求的处理结论。
#[derive(Debug)]
pub(crate) enum Admission {
    /// 新请求，交给处理器。
    Forward,
    /// 重复请求且已有缓存回复，重发该回复的副本。
    Replay(Box<Stream>),
    /// 过期或仍在处理中的重复请求，直接丢弃。
    Discard,
}

/// 会话中的一个通道：保证同一 `callback_id` 最多被执行一次。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `admit(c)`：`c > seq` 时接纳并清空缓存；`c == seq` 且有缓存时重发；其余丢弃；
///   - `on_return(stream)`：回复的 `callback_id` 仍等于 `seq` 时缓存并返回待发送的副本，否则释放；
///   - `sweep`：缓存超过存活时间即清除，之后同号请求只会被丢弃。
#[derive(Debug, Default)]
pub(crate) struct Channel {
    seq: u64,
    cached: Option<Box<Stream>>,
    replied_at: Option<Instant>,
}

impl Channel {
    #[cfg(test)]
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    fn clear(&mut self) {
        if let Some(cached) = self.cached.take() {
            cached.release();
        }
        self.replied_at = None;
    }

    pub(crate) fn admit(&mut self, callback_id: u64) -> Admission {
        if callback_id > self.seq {
            self.seq = callback_id;
            self.clear();
            return Admission::Forward;
        }
        match (&self.cached, callback_id == self.seq) {
            (Some(cached), true) => Admission::Replay(cached.duplicate()),
            _ => Admission::Discard,
        }
    }

    pub(crate) fn on_return(&mut self, stream: Box<Stream>, now: Instant) -> Option<Box<Stream>> {
        if stream.callback_id() != self.seq {
            stream.release();
            return None;
        }
        let outgoing = stream.duplicate();
        self.clear();
        self.cached = Some(stream);
        self.replied_at = Some(now);
        Some(outgoing)
    }

    /// 清除过期缓存，返回是否清除了回复。
    pub(crate) fn sweep(&mut self, now: Instant, ttl: Duration) -> bool {
        match self.replied_at {
            Some(at) if now.saturating_duration_since(at) > ttl => {
                self.clear();
                true
            }
            _ => false,
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(callback_id: u64, body: u64) -> Box<Stream> {
        let mut stream = Stream::new();
        stream.set_callback_id(callback_id);
        stream.write_uint64(0);
        stream.write_uint64(body);
        stream
    }

    #[test]
    fn duplicate_request_replays_cached_reply() {
        let now = Instant::now();
        let mut channel = Channel::default();
        assert!(matches!(channel.admit(3), Admission::Forward));
        assert!(matches!(channel.admit(3), Admission::Discard), "回复到达前的重复请求应被丢弃");

        let sent = channel.on_return(reply(3, 42), now).expect("当前序号的回复应当发送");
        let Admission::Replay(replayed) = channel.admit(3) else {
            panic!("有缓存时重复请求应当重发");
        };
        assert_eq!(replayed.to_bytes(), sent.to_bytes());
        replayed.release();
        sent.release();
    }

    #[test]
    fn stale_ids_are_dropped_and_stale_replies_released() {
        let now = Instant::now();
        let mut channel = Channel::default();
        assert!(matches!(channel.admit(5), Admission::Forward));
        assert!(matches!(channel.admit(4), Admission::Discard));
        assert!(matches!(channel.admit(9), Admission::Forward));
        assert!(channel.on_return(reply(5, 1), now).is_none(), "过期回复不应发送");
        assert_eq!(channel.seq(), 9);
    }

    #[test]
    fn sweep_clears_expired_reply() {
        let now = Instant::now();
        let mut channel = Channel::default();
        let _ = channel.admit(1);
        channel
            .on_return(reply(1, 7), now)
            .expect("应当发送")
            .release();
        assert!(!channel.sweep(now + Duration::from_millis(5), Duration::from_millis(10)));
        assert!(channel.sweep(now + Duration::from_millis(11), Duration::from_millis(10)));
        assert!(matches!(channel.admit(1), Admission::Discard));
    }
}
