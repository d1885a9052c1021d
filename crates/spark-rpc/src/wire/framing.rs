use bytes::{Buf, BufMut, BytesMut};

use super::error::StreamError;
use super::stream::{STREAM_HEAD_SIZE, Stream};

/// 长度前缀字节数。
pub const FRAME_PREFIX_SIZE: usize = 4;
/// 默认单帧上限（16 MiB），通常会被会话协商出的传输上限覆盖。
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 传输层帧编解码器。
///
/// # 教案式说明
/// - **意图 (Why)**：适配器只需搬运字节，本编解码器负责把 `BytesMut` 切分成完整的 [`Stream`]；
/// - **契约 (What)**：线上格式为 `u32 LE 长度 | 头部 44 字节 | 消息体`，长度不含前缀本身；
///   超过 `max_frame_size` 的帧在读取正文之前即被拒绝，短于头部的帧同样拒绝；
/// - **执行 (How)**：`decode` 在数据不足时预留剩余空间并返回 `Ok(None)`，等待下一次读取。
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn encode(&self, stream: &Stream, dst: &mut BytesMut) -> Result<(), StreamError> {
        let len = stream.len();
        if len > self.max_frame_size {
            return Err(StreamError::FrameTooLarge {
                size: len,
                limit: self.max_frame_size,
            });
        }
        dst.reserve(FRAME_PREFIX_SIZE + len);
        dst.put_u32_le(len as u32);
        stream.for_each_chunk(0, len, |chunk| dst.put_slice(chunk));
        Ok(())
    }

    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Box<Stream>>, StreamError> {
        if src.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(StreamError::FrameTooLarge {
                size: len,
                limit: self.max_frame_size,
            });
        }
        if len < STREAM_HEAD_SIZE {
            return Err(StreamError::FrameTooShort(len));
        }
        let total = FRAME_PREFIX_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(FRAME_PREFIX_SIZE);
        let frame = src.split_to(len);
        Stream::from_frame(&frame).map(Some)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let codec = FrameCodec::new();
        let mut stream = Stream::new();
        stream.set_callback_id(3);
        stream.write_string("#.svc:Op").expect("写入失败");
        let mut wire = BytesMut::new();
        codec.encode(&stream, &mut wire).expect("编码失败");

        let mut head = wire.split_to(10);
        assert!(codec.decode(&mut head).expect("解码失败").is_none());
        head.unsplit(wire);
        let decoded = codec.decode(&mut head).expect("解码失败").expect("帧应完整");
        assert_eq!(decoded.callback_id(), 3);
        assert_eq!(decoded.body_bytes(), stream.body_bytes());
        assert!(head.is_empty());
    }

    #[test]
    fn oversize_frame_is_rejected_before_body_arrives() {
        let codec = FrameCodec::with_max_frame_size(64);
        let mut wire = BytesMut::new();
        wire.put_u32_le(65);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(StreamError::FrameTooLarge { size: 65, limit: 64 })
        ));
    }
}
