use std::borrow::Cow;

use spin::Mutex;

use super::error::StreamError;
use super::segment::{self, SEGMENT_SIZE, Segment};

/// 固定头部长度。
pub const STREAM_HEAD_SIZE: usize = 44;
/// 消息体起始位置，读写游标永远不会小于该值。
pub const STREAM_BODY_POS: usize = STREAM_HEAD_SIZE;

const TARGET_ID_POS: usize = 0;
const SOURCE_ID_POS: usize = 8;
const ZONE_ID_POS: usize = 16;
const IP_MAP_POS: usize = 18;
const SESSION_ID_POS: usize = 26;
const CALLBACK_ID_POS: usize = 34;
const DEPTH_POS: usize = 42;

/// 空闲流对象上限，超过后释放的流直接析构并把分段交还分段池。
const STREAM_POOL_LIMIT: usize = 16 * 1024;

static STREAM_POOL: Mutex<Vec<Box<Stream>>> = Mutex::new(Vec::new());

/// 44 字节头部的结构化快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub target_id: u64,
    pub source_id: u64,
    pub zone_id: u16,
    pub ip_map: u64,
    pub session_id: u64,
    pub callback_id: u64,
    pub depth: u16,
}

/// 分段二进制流：一次请求或一次响应在进程内的全部载体。
///
/// # 教案式说明
/// - **意图 (Why)**：请求在传输层、会话层与执行器之间流转时只移动 `Box<Stream>`，避免复制正文；
/// - **契约 (What)**：
///   - 数据由若干 512 字节分段组成，绝对位置 `pos` 落在第 `pos / 512` 段的 `pos % 512` 处；
///   - 读写游标均为绝对位置，满足 `44 <= read <= write`；
///   - 所有权独占；[`Stream::release`] 消费 `Box<Self>` 归还对象池，因此重复释放无法通过编译；
///   - 未释放而直接析构时，分段在 `Drop` 中交还分段池。
/// - **执行 (How)**：扩容只追加分段，跨分段读写按段循环拷贝；`reset` 清零首段并归还其余分段。
/// - **风险 (Trade-offs)**：首段常驻意味着池中每个空闲流至少占用 512 字节。
pub struct Stream {
    pub(super) segments: Vec<Segment>,
    pub(super) read_pos: usize,
    pub(super) write_pos: usize,
}

impl Stream {
    /// 从对象池取出一个已复位的流；池为空时新建。
    pub fn new() -> Box<Stream> {
        let reused = STREAM_POOL.lock().pop();
        match reused {
            Some(stream) => stream,
            None => Box::new(Stream::fresh()),
        }
    }

    fn fresh() -> Self {
        Self {
            segments: vec![segment::acquire_zeroed()],
            read_pos: STREAM_BODY_POS,
            write_pos: STREAM_BODY_POS,
        }
    }

    /// 复位并归还对象池。
    pub fn release(mut self: Box<Self>) {
        self.reset();
        let mut pool = STREAM_POOL.lock();
        if pool.len() < STREAM_POOL_LIMIT {
            pool.push(self);
        }
    }

    /// 清零首段、归还其余分段，游标回到消息体起点。
    pub fn reset(&mut self) {
        for extra in self.segments.drain(1..) {
            segment::recycle(extra);
        }
        match self.segments.first_mut() {
            Some(first) => first.fill(0),
            None => self.segments.push(segment::acquire_zeroed()),
        }
        self.read_pos = STREAM_BODY_POS;
        self.write_pos = STREAM_BODY_POS;
    }

    /// 深拷贝：头部、消息体与两个游标全部复制到一个新的池化流中。
    pub fn duplicate(&self) -> Box<Stream> {
        let mut copy = Stream::new();
        copy.write_pos = 0;
        self.for_each_chunk(0, self.write_pos, |chunk| copy.put_bytes(chunk));
        copy.read_pos = self.read_pos;
        copy
    }

    // ---- 头部 ----

    fn head_u64(&self, pos: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.segments[0][pos..pos + 8]);
        u64::from_le_bytes(raw)
    }

    fn set_head_u64(&mut self, pos: usize, value: u64) {
        self.segments[0][pos..pos + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn head_u16(&self, pos: usize) -> u16 {
        u16::from_le_bytes([self.segments[0][pos], self.segments[0][pos + 1]])
    }

    fn set_head_u16(&mut self, pos: usize, value: u16) {
        self.segments[0][pos..pos + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn target_id(&self) -> u64 {
        self.head_u64(TARGET_ID_POS)
    }

    pub fn set_target_id(&mut self, value: u64) {
        self.set_head_u64(TARGET_ID_POS, value);
    }

    pub fn source_id(&self) -> u64 {
        self.head_u64(SOURCE_ID_POS)
    }

    pub fn set_source_id(&mut self, value: u64) {
        self.set_head_u64(SOURCE_ID_POS, value);
    }

    pub fn zone_id(&self) -> u16 {
        self.head_u16(ZONE_ID_POS)
    }

    pub fn set_zone_id(&mut self, value: u16) {
        self.set_head_u16(ZONE_ID_POS, value);
    }

    pub fn ip_map(&self) -> u64 {
        self.head_u64(IP_MAP_POS)
    }

    pub fn set_ip_map(&mut self, value: u64) {
        self.set_head_u64(IP_MAP_POS, value);
    }

    pub fn session_id(&self) -> u64 {
        self.head_u64(SESSION_ID_POS)
    }

    pub fn set_session_id(&mut self, value: u64) {
        self.set_head_u64(SESSION_ID_POS, value);
    }

    pub fn callback_id(&self) -> u64 {
        self.head_u64(CALLBACK_ID_POS)
    }

    pub fn set_callback_id(&mut self, value: u64) {
        self.set_head_u64(CALLBACK_ID_POS, value);
    }

    pub fn depth(&self) -> u16 {
        self.head_u16(DEPTH_POS)
    }

    pub fn set_depth(&mut self, value: u16) {
        self.set_head_u16(DEPTH_POS, value);
    }

    pub fn header(&self) -> StreamHeader {
        StreamHeader {
            target_id: self.target_id(),
            source_id: self.source_id(),
            zone_id: self.zone_id(),
            ip_map: self.ip_map(),
            session_id: self.session_id(),
            callback_id: self.callback_id(),
            depth: self.depth(),
        }
    }

    pub fn set_header(&mut self, header: &StreamHeader) {
        self.set_target_id(header.target_id);
        self.set_source_id(header.source_id);
        self.set_zone_id(header.zone_id);
        self.set_ip_map(header.ip_map);
        self.set_session_id(header.session_id);
        self.set_callback_id(header.callback_id);
        self.set_depth(header.depth);
    }

    /// 原样复制另一条流的 44 字节头部。
    pub fn copy_header_from(&mut self, other: &Stream) {
        let (dst, src) = (&mut self.segments[0], &other.segments[0]);
        dst[..STREAM_HEAD_SIZE].copy_from_slice(&src[..STREAM_HEAD_SIZE]);
    }

    // ---- 游标 ----

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// 设置读游标；越出 `[44, write]` 时返回 `false` 且不做修改。
    pub fn set_read_pos(&mut self, pos: usize) -> bool {
        if (STREAM_BODY_POS..=self.write_pos).contains(&pos) {
            self.read_pos = pos;
            true
        } else {
            false
        }
    }

    pub fn set_read_pos_to_body_start(&mut self) {
        self.read_pos = STREAM_BODY_POS;
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// 设置写游标：向后移动时按需追加分段（新区域内容未定义），
    /// 向前移动时截断消息体，读游标随之收拢。
    pub fn set_write_pos(&mut self, pos: usize) -> bool {
        if pos < STREAM_BODY_POS {
            return false;
        }
        self.ensure_capacity(pos);
        self.write_pos = pos;
        if self.read_pos > pos {
            self.read_pos = pos;
        }
        true
    }

    pub fn set_write_pos_to_body_start(&mut self) {
        self.write_pos = STREAM_BODY_POS;
        self.read_pos = STREAM_BODY_POS;
    }

    pub fn can_read(&self) -> bool {
        self.read_pos < self.write_pos
    }

    pub fn is_read_finish(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// 整条流（含头部）的字节数。
    pub fn len(&self) -> usize {
        self.write_pos
    }

    pub fn is_empty(&self) -> bool {
        self.write_pos == STREAM_BODY_POS
    }

    pub fn body_len(&self) -> usize {
        self.write_pos - STREAM_BODY_POS
    }

    // ---- 原始字节 ----

    fn ensure_capacity(&mut self, end: usize) {
        while self.segments.len() * SEGMENT_SIZE < end {
            self.segments.push(segment::acquire());
        }
    }

    pub(crate) fn put_u8(&mut self, byte: u8) {
        let (seg, off) = (self.write_pos / SEGMENT_SIZE, self.write_pos % SEGMENT_SIZE);
        if seg == self.segments.len() {
            self.segments.push(segment::acquire());
        }
        self.segments[seg][off] = byte;
        self.write_pos += 1;
    }

    pub(crate) fn put_bytes(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let (seg, off) = (self.write_pos / SEGMENT_SIZE, self.write_pos % SEGMENT_SIZE);
            if seg == self.segments.len() {
                self.segments.push(segment::acquire());
            }
            let n = (SEGMENT_SIZE - off).min(src.len());
            self.segments[seg][off..off + n].copy_from_slice(&src[..n]);
            self.write_pos += n;
            src = &src[n..];
        }
    }

    /// 覆盖已写区域（回填长度前缀等）；越过写游标时返回 `false`。
    pub(crate) fn put_at(&mut self, mut pos: usize, mut src: &[u8]) -> bool {
        if pos + src.len() > self.write_pos {
            return false;
        }
        while !src.is_empty() {
            let (seg, off) = (pos / SEGMENT_SIZE, pos % SEGMENT_SIZE);
            let n = (SEGMENT_SIZE - off).min(src.len());
            self.segments[seg][off..off + n].copy_from_slice(&src[..n]);
            pos += n;
            src = &src[n..];
        }
        true
    }

    pub(crate) fn byte_at(&self, pos: usize) -> Option<u8> {
        if pos < self.write_pos {
            Some(self.segments[pos / SEGMENT_SIZE][pos % SEGMENT_SIZE])
        } else {
            None
        }
    }

    /// 从 `pos` 开始读满 `dst`；越过写游标时返回 [`StreamError::Truncated`]。
    pub(crate) fn copy_to(&self, pos: usize, dst: &mut [u8]) -> Result<(), StreamError> {
        if pos + dst.len() > self.write_pos {
            return Err(StreamError::Truncated);
        }
        let mut filled = 0;
        self.for_each_chunk(pos, dst.len(), |chunk| {
            dst[filled..filled + chunk.len()].copy_from_slice(chunk);
            filled += chunk.len();
        });
        Ok(())
    }

    pub(crate) fn u32_at(&self, pos: usize) -> Result<u32, StreamError> {
        let mut raw = [0u8; 4];
        self.copy_to(pos, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// 取 `[pos, pos + len)` 的视图：位于同一分段时借用，跨分段时拷贝。
    pub(crate) fn view(&self, pos: usize, len: usize) -> Result<Cow<'_, [u8]>, StreamError> {
        view_in(&self.segments, self.write_pos, pos, len)
    }

    /// 按分段顺序遍历 `[pos, pos + len)`；调用方负责保证区间已写入。
    pub(crate) fn for_each_chunk(&self, mut pos: usize, mut len: usize, mut f: impl FnMut(&[u8])) {
        while len > 0 {
            let (seg, off) = (pos / SEGMENT_SIZE, pos % SEGMENT_SIZE);
            let n = (SEGMENT_SIZE - off).min(len);
            f(&self.segments[seg][off..off + n]);
            pos += n;
            len -= n;
        }
    }

    /// 把 `src` 中 `[pos, pos + len)` 逐段追加到本流末尾。
    pub(crate) fn append_range_from(
        &mut self,
        src: &Stream,
        pos: usize,
        len: usize,
    ) -> Result<(), StreamError> {
        if pos + len > src.write_pos {
            return Err(StreamError::Truncated);
        }
        src.for_each_chunk(pos, len, |chunk| self.put_bytes(chunk));
        Ok(())
    }

    /// 整帧字节（含头部），用于传输与测试断言。
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.write_pos);
        self.for_each_chunk(0, self.write_pos, |chunk| out.extend_from_slice(chunk));
        out
    }

    /// 消息体字节（不含头部）。
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body_len());
        self.for_each_chunk(STREAM_BODY_POS, self.body_len(), |chunk| {
            out.extend_from_slice(chunk)
        });
        out
    }

    /// 由完整帧字节（头部 + 消息体）重建流；读游标位于消息体起点。
    pub fn from_frame(frame: &[u8]) -> Result<Box<Stream>, StreamError> {
        if frame.len() < STREAM_HEAD_SIZE {
            return Err(StreamError::FrameTooShort(frame.len()));
        }
        let mut stream = Stream::new();
        stream.write_pos = 0;
        stream.put_bytes(frame);
        stream.read_pos = STREAM_BODY_POS;
        Ok(stream)
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

/// [`Stream::view`] 的字段级版本：读取路径可以在持有视图的同时推进读游标。
pub(super) fn view_in(
    segments: &[Segment],
    write_pos: usize,
    pos: usize,
    len: usize,
) -> Result<Cow<'_, [u8]>, StreamError> {
    if pos + len > write_pos {
        return Err(StreamError::Truncated);
    }
    if len == 0 {
        return Ok(Cow::Borrowed(&[]));
    }
    let (seg, off) = (pos / SEGMENT_SIZE, pos % SEGMENT_SIZE);
    if off + len <= SEGMENT_SIZE {
        return Ok(Cow::Borrowed(&segments[seg][off..off + len]));
    }
    let mut owned = Vec::with_capacity(len);
    let (mut pos, mut left) = (pos, len);
    while left > 0 {
        let (seg, off) = (pos / SEGMENT_SIZE, pos % SEGMENT_SIZE);
        let n = (SEGMENT_SIZE - off).min(left);
        owned.extend_from_slice(&segments[seg][off..off + n]);
        pos += n;
        left -= n;
    }
    Ok(Cow::Owned(owned))
}

impl Drop for Stream {
    fn drop(&mut self) {
        for segment in self.segments.drain(..) {
            segment::recycle(segment);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("header", &self.header())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_do_not_overlap() {
        let mut stream = Stream::new();
        let header = StreamHeader {
            target_id: u64::MAX,
            source_id: 0x0102_0304_0506_0708,
            zone_id: 0xBEEF,
            ip_map: 7,
            session_id: 42,
            callback_id: 9,
            depth: 3,
        };
        stream.set_header(&header);
        assert_eq!(stream.header(), header);
        assert_eq!(&stream.to_bytes()[16..18], &[0xEF, 0xBE]);
        stream.release();
    }

    #[test]
    fn reset_zeroes_header_and_returns_extra_segments() {
        let mut stream = Stream::new();
        stream.set_callback_id(77);
        stream.put_bytes(&[0xAA; 2 * SEGMENT_SIZE]);
        assert_eq!(stream.segment_count(), 3);
        stream.reset();
        assert_eq!(stream.segment_count(), 1);
        assert_eq!(stream.callback_id(), 0);
        assert_eq!(stream.write_pos(), STREAM_BODY_POS);
        assert!(stream.is_read_finish());
    }

    #[test]
    fn cross_segment_view_is_owned_copy() {
        let mut stream = Stream::new();
        stream.put_bytes(&vec![1u8; SEGMENT_SIZE - STREAM_BODY_POS - 2]);
        stream.put_bytes(&[7, 8, 9, 10]);
        let pos = SEGMENT_SIZE - 2;
        let view = stream.view(pos, 4).expect("读取跨段视图失败");
        assert!(matches!(view, Cow::Owned(_)));
        assert_eq!(&*view, &[7, 8, 9, 10]);
        assert!(matches!(
            stream.view(STREAM_BODY_POS, 4).expect("读取段内视图失败"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn cursor_setters_respect_invariant() {
        let mut stream = Stream::new();
        stream.put_bytes(&[1, 2, 3]);
        assert!(!stream.set_read_pos(STREAM_BODY_POS - 1));
        assert!(!stream.set_read_pos(STREAM_BODY_POS + 4));
        assert!(stream.set_read_pos(STREAM_BODY_POS + 3));
        assert!(stream.set_write_pos(STREAM_BODY_POS + 1));
        assert_eq!(stream.read_pos(), STREAM_BODY_POS + 1);
    }

    #[test]
    fn duplicate_is_deep() {
        let mut stream = Stream::new();
        stream.set_callback_id(5);
        stream.put_bytes(&[3u8; 700]);
        let copy = stream.duplicate();
        stream.put_at(STREAM_BODY_POS, &[9]);
        assert_eq!(copy.callback_id(), 5);
        assert_eq!(copy.len(), stream.len());
        assert_eq!(copy.body_bytes()[0], 3);
    }
}
