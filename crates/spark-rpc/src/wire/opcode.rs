//! 操作码常量与跳读表。
//!
//! 每个值以 1 字节操作码开头；定长值的总长度可直接查 [`SKIP_TABLE`]，
//! 变长值（长字符串、字节串与非空容器）的总长度写在操作码之后的 4 字节小端字段中，
//! 因此任意值都能以 O(1) 跳过。

pub(crate) const NIL: u8 = 1;
pub(crate) const TRUE: u8 = 2;
pub(crate) const FALSE: u8 = 3;
pub(crate) const FLOAT64_ZERO: u8 = 4;
pub(crate) const FLOAT64: u8 = 5;
pub(crate) const INT64_16: u8 = 6;
pub(crate) const INT64_32: u8 = 7;
pub(crate) const INT64_64: u8 = 8;
pub(crate) const UINT64_16: u8 = 9;
pub(crate) const UINT64_32: u8 = 10;
pub(crate) const UINT64_64: u8 = 11;

pub(crate) const INT64_TINY_FIRST: u8 = 14;
pub(crate) const INT64_TINY_LAST: u8 = 53;
/// 小整数的偏置：`op = value + 21`，覆盖 `-7..=32`。
pub(crate) const INT64_TINY_BIAS: i64 = 21;
pub(crate) const INT64_TINY_MIN: i64 = -7;
pub(crate) const INT64_TINY_MAX: i64 = 32;

pub(crate) const UINT64_TINY_FIRST: u8 = 54;
pub(crate) const UINT64_TINY_LAST: u8 = 63;
pub(crate) const UINT64_TINY_MAX: u64 = 9;

pub(crate) const ARRAY_EMPTY: u8 = 64;
pub(crate) const ARRAY_SHORT_LAST: u8 = 94;
pub(crate) const ARRAY_LONG: u8 = 95;
pub(crate) const MAP_EMPTY: u8 = 96;
pub(crate) const MAP_SHORT_LAST: u8 = 126;
pub(crate) const MAP_LONG: u8 = 127;

pub(crate) const STRING_EMPTY: u8 = 128;
pub(crate) const STRING_SHORT_LAST: u8 = 190;
pub(crate) const STRING_LONG: u8 = 191;
pub(crate) const BYTES_EMPTY: u8 = 192;
pub(crate) const BYTES_SHORT_LAST: u8 = 254;
pub(crate) const BYTES_LONG: u8 = 255;

/// 短字符串 / 短字节串可容纳的最大长度。
pub(crate) const SHORT_PAYLOAD_MAX: usize = 62;
/// 短容器可容纳的最大元素数。
pub(crate) const SHORT_CONTAINER_MAX: usize = 30;

/// 写入与读取共同遵守的最大嵌套层数。
pub const MAX_NESTING_DEPTH: usize = 64;

/// 跳读表中的哨兵：0 为非法操作码，`VARIABLE` 表示需读取 4 字节总长度。
pub(crate) const INVALID: u8 = 0;
pub(crate) const VARIABLE: u8 = 0xFF;

pub(crate) static SKIP_TABLE: [u8; 256] = build_skip_table();

const fn build_skip_table() -> [u8; 256] {
    let mut table = [INVALID; 256];
    table[NIL as usize] = 1;
    table[TRUE as usize] = 1;
    table[FALSE as usize] = 1;
    table[FLOAT64_ZERO as usize] = 1;
    table[FLOAT64 as usize] = 9;
    table[INT64_16 as usize] = 3;
    table[INT64_32 as usize] = 5;
    table[INT64_64 as usize] = 9;
    table[UINT64_16 as usize] = 3;
    table[UINT64_32 as usize] = 5;
    table[UINT64_64 as usize] = 9;

    let mut op = INT64_TINY_FIRST as usize;
    while op <= UINT64_TINY_LAST as usize {
        table[op] = 1;
        op += 1;
    }

    table[ARRAY_EMPTY as usize] = 1;
    table[MAP_EMPTY as usize] = 1;
    let mut op = ARRAY_EMPTY as usize + 1;
    while op <= MAP_LONG as usize {
        if op != MAP_EMPTY as usize {
            table[op] = VARIABLE;
        }
        op += 1;
    }

    table[STRING_EMPTY as usize] = 1;
    let mut op = STRING_EMPTY as usize + 1;
    while op <= STRING_SHORT_LAST as usize {
        // 操作码 + 正文 + NUL
        table[op] = (op - STRING_EMPTY as usize + 2) as u8;
        op += 1;
    }
    table[STRING_LONG as usize] = VARIABLE;

    table[BYTES_EMPTY as usize] = 1;
    let mut op = BYTES_EMPTY as usize + 1;
    while op <= BYTES_SHORT_LAST as usize {
        table[op] = (op - BYTES_EMPTY as usize + 1) as u8;
        op += 1;
    }
    table[BYTES_LONG as usize] = VARIABLE;
    table
}

/// 返回操作码对应的类型名，用于“参数不匹配”等诊断信息。
pub fn opcode_type_name(op: u8) -> &'static str {
    match op {
        NIL => "nil",
        TRUE | FALSE => "bool",
        FLOAT64_ZERO | FLOAT64 => "float64",
        INT64_16 | INT64_32 | INT64_64 | INT64_TINY_FIRST..=INT64_TINY_LAST => "int64",
        UINT64_16 | UINT64_32 | UINT64_64 | UINT64_TINY_FIRST..=UINT64_TINY_LAST => "uint64",
        STRING_EMPTY..=STRING_LONG => "string",
        BYTES_EMPTY..=BYTES_LONG => "bytes",
        ARRAY_EMPTY..=ARRAY_LONG => "array",
        MAP_EMPTY..=MAP_LONG => "map",
        _ => "<invalid>",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_opcodes_are_invalid() {
        for op in [0u8, 12, 13] {
            assert_eq!(SKIP_TABLE[op as usize], INVALID, "操作码 {op} 应为非法");
            assert_eq!(opcode_type_name(op), "<invalid>");
        }
    }

    #[test]
    fn short_string_sizes_include_nul() {
        assert_eq!(SKIP_TABLE[(STRING_EMPTY + 1) as usize], 3);
        assert_eq!(SKIP_TABLE[STRING_SHORT_LAST as usize], 64);
        assert_eq!(SKIP_TABLE[BYTES_SHORT_LAST as usize], 63);
    }
}
