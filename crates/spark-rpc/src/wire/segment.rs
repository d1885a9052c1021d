use spin::Mutex;

/// 单个分段的字节数。
pub const SEGMENT_SIZE: usize = 512;

/// 分段池最多缓存的空闲分段数量，超过后直接交还分配器。
const SEGMENT_POOL_LIMIT: usize = 64 * 1024;

pub(crate) type Segment = Box<[u8; SEGMENT_SIZE]>;

/// 进程级空闲分段链表。
///
/// # 教案式说明
/// - **意图 (Why)**：请求流在热路径上频繁创建与释放，复用分段避免每次 512 字节的堆分配；
/// - **契约 (What)**：池中分段内容未清零，取用方必须先写后读；需要零值时调用 [`acquire_zeroed`]；
/// - **权衡 (Trade-offs)**：`spin::Mutex<Vec<_>>` 自由链表的临界区只有一次 `push`/`pop`，自旋成本可忽略。
static SEGMENT_POOL: Mutex<Vec<Segment>> = Mutex::new(Vec::new());

pub(crate) fn acquire() -> Segment {
    let reused = SEGMENT_POOL.lock().pop();
    match reused {
        Some(segment) => segment,
        None => Box::new([0u8; SEGMENT_SIZE]),
    }
}

pub(crate) fn acquire_zeroed() -> Segment {
    let mut segment = acquire();
    segment.fill(0);
    segment
}

pub(crate) fn recycle(segment: Segment) {
    let mut pool = SEGMENT_POOL.lock();
    if pool.len() < SEGMENT_POOL_LIMIT {
        pool.push(segment);
    }
}
