use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Worst-case encoded length of an unsigned LEB128 varint for a value of the given width
pub const fn max_varint_len(bits: usize) -> usize {
    bits.div_ceil(7)
}

pub fn put_u32_varint(buf: &mut impl BufMut, value: u32) {
    buf.put_u32_varint(value);
}

pub fn put_u64_varint(buf: &mut impl BufMut, value: u64) {
    buf.put_u64_varint(value);
}

pub fn try_get_u32_varint(buf: &mut impl Buf, field: &str) -> anyhow::Result<u32> {
    buf.try_get_u32_varint()
        .map_err(|e| anyhow!("invalid varint for {}: {:?}", field, e))
}

pub fn try_get_u64_varint(buf: &mut impl Buf, field: &str) -> anyhow::Result<u64> {
    buf.try_get_u64_varint()
        .map_err(|e| anyhow!("invalid varint for {}: {:?}", field, e))
}
