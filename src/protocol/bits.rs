use std::fmt::{Debug, Formatter};

/// An exact sequence of bits, stored LSB-first within each byte (which is what a little-endian
///  wire format needs for sub-byte fields).
///
/// Bits past `len` in the last byte are always zero, so two buffers with the same bits compare
///  equal regardless of how they were built.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitBuf {
    bytes: Vec<u8>,
    len: usize,
}

impl Debug for BitBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BitBuf[{}:", self.len)?;
        for b in &self.bytes {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "]")
    }
}

impl BitBuf {
    pub fn new() -> BitBuf {
        BitBuf::default()
    }

    pub fn with_capacity(num_bits: usize) -> BitBuf {
        BitBuf {
            bytes: Vec::with_capacity(num_bits.div_ceil(8)),
            len: 0,
        }
    }

    pub fn zeros(num_bits: usize) -> BitBuf {
        BitBuf {
            bytes: vec![0; num_bits.div_ceil(8)],
            len: num_bits,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> BitBuf {
        BitBuf {
            bytes: bytes.to_vec(),
            len: bytes.len() * 8,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.len % 8 == 0
    }

    pub fn is_all_zero(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        self.bytes[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn push(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            self.bytes[self.len / 8] |= 1 << (self.len % 8);
        }
        self.len += 1;
    }

    pub fn extend(&mut self, other: &BitBuf) {
        if self.is_byte_aligned() {
            self.bytes.extend_from_slice(&other.bytes);
            self.len += other.len;
            return;
        }
        for i in 0..other.len {
            self.push(other.get(i));
        }
    }

    pub fn extend_from_bytes(&mut self, bytes: &[u8]) {
        self.extend(&BitBuf::from_bytes(bytes));
    }

    /// Copies the bits in `start..end` into a new buffer.
    pub fn slice(&self, start: usize, end: usize) -> BitBuf {
        debug_assert!(start <= end && end <= self.len);
        if start % 8 == 0 {
            let mut result = BitBuf {
                bytes: self.bytes[start / 8..end.div_ceil(8)].to_vec(),
                len: end - start,
            };
            result.clear_tail();
            return result;
        }

        let mut result = BitBuf::with_capacity(end - start);
        for i in start..end {
            result.push(self.get(i));
        }
        result
    }

    /// Returns a copy of exactly `size` bits: longer buffers are truncated, shorter ones are
    ///  zero-padded. With `left_cut`, truncation drops leading bits and padding is prepended.
    pub fn sized(&self, size: usize, left_cut: bool) -> BitBuf {
        if self.len == size {
            return self.clone();
        }
        if self.len > size {
            return if left_cut {
                self.slice(self.len - size, self.len)
            }
            else {
                self.slice(0, size)
            };
        }

        if left_cut {
            let mut result = BitBuf::zeros(size - self.len);
            result.extend(self);
            result
        }
        else {
            let mut result = self.clone();
            result.resize(size);
            result
        }
    }

    fn resize(&mut self, num_bits: usize) {
        self.bytes.resize(num_bits.div_ceil(8), 0);
        self.len = num_bits;
        self.clear_tail();
    }

    fn clear_tail(&mut self) {
        if self.len % 8 != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1u8 << (self.len % 8)) - 1;
            }
        }
    }

    /// The underlying bytes; a trailing partial byte is zero-padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Interprets up to 64 bits as an unsigned little-endian number.
    pub fn to_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = self.bytes.len().min(8);
        buf[..n].copy_from_slice(&self.bytes[..n]);
        u64::from_le_bytes(buf)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn bits(s: &str) -> BitBuf {
        let mut result = BitBuf::new();
        for c in s.chars() {
            result.push(c == '1');
        }
        result
    }

    #[test]
    fn test_push_is_lsb_first() {
        let b = bits("1000000001");
        assert_eq!(b.len(), 10);
        assert_eq!(b.as_bytes(), &[0x01, 0x02]);
    }

    #[test]
    fn test_extend_unaligned() {
        let mut b = bits("101");
        b.extend(&BitBuf::from_bytes(&[0xff]));
        assert_eq!(b, bits("10111111111"));
    }

    #[rstest]
    #[case::exact("1011", 4, false, "1011")]
    #[case::truncate_right("101100", 4, false, "1011")]
    #[case::truncate_left("101100", 4, true, "1100")]
    #[case::pad_right("11", 4, false, "1100")]
    #[case::pad_left("11", 4, true, "0011")]
    #[case::empty("", 3, false, "000")]
    fn test_sized(#[case] input: &str, #[case] size: usize, #[case] left_cut: bool, #[case] expected: &str) {
        assert_eq!(bits(input).sized(size, left_cut), bits(expected));
    }

    #[test]
    fn test_slice_clears_tail() {
        let b = BitBuf::from_bytes(&[0xff, 0xff]);
        let s = b.slice(0, 12);
        assert_eq!(s.as_bytes(), &[0xff, 0x0f]);
        assert_eq!(s, bits("111111111111"));
    }

    #[test]
    fn test_slice_unaligned() {
        let b = BitBuf::from_bytes(&[0b1010_0000, 0b0000_0101]);
        assert_eq!(b.slice(5, 11), bits("101101"));
    }

    #[test]
    fn test_to_u64() {
        assert_eq!(BitBuf::from_bytes(&[0x00, 0x04]).slice(0, 12).to_u64(), 1024);
        assert_eq!(BitBuf::new().to_u64(), 0);
    }
}
