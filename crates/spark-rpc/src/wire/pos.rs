/// 带标记的 64 位位置记录。
///
/// - 第 63 位：被引用的值是字符串；
/// - 第 0..=62 位：该值在流中的绝对字节偏移。
///
/// 运行时竞技场的数组 / 映射槽位均以 `PosRecord` 保存元素位置，读取字符串时可据此跳过一次操作码判定。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PosRecord(u64);

const STRING_FLAG: u64 = 1 << 63;
const POS_MASK: u64 = STRING_FLAG - 1;

impl PosRecord {
    pub const fn new(pos: usize, is_string: bool) -> Self {
        let raw = (pos as u64) & POS_MASK;
        if is_string {
            Self(raw | STRING_FLAG)
        } else {
            Self(raw)
        }
    }

    pub const fn pos(self) -> usize {
        (self.0 & POS_MASK) as usize
    }

    pub const fn is_string(self) -> bool {
        self.0 & STRING_FLAG != 0
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::PosRecord;

    #[test]
    fn flag_does_not_leak_into_offset() {
        let record = PosRecord::new(1_048_620, true);
        assert!(record.is_string());
        assert_eq!(record.pos(), 1_048_620);
        assert!(!PosRecord::new(44, false).is_string());
    }
}
