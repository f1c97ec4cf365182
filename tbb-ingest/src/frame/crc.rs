//! CRC-16 over 16-bit words, as computed by the TBB boards.
//!
//! Generator polynomial 0x18005, zero initial remainder, no reflection and
//! no final xor. The message is fed word by word with the first word in the
//! most significant position, so the result is `M(x) mod P(x)`. A block that
//! ends with its own CRC word therefore checks to zero.

const POLY: u32 = 0x1_8005;
const DIVISOR: u32 = (POLY & 0x7fff_ffff) << 15;

/// Computes the CRC remainder of `words`.
///
/// Returns 0 for an empty input.
pub fn crc16<I>(words: I) -> u16
where
    I: IntoIterator<Item = u16>,
{
    let mut words = words.into_iter();
    let Some(first) = words.next() else {
        return 0;
    };

    let mut data = u32::from(first) << 16;
    for word in words {
        data |= u32::from(word);
        for _ in 0..16 {
            if data & 0x8000_0000 != 0 {
                data ^= DIVISOR;
            }
            data &= 0x7fff_ffff;
            data <<= 1;
        }
    }
    (data >> 16) as u16
}

/// Reads `bytes` as little-endian 16-bit words. A trailing odd byte is ignored.
pub fn le_words(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}
