//! Token calculation for token-aware routing.

use std::num::Wrapping;

use bytes::Buf;
use coral_cql::frame::types::RawValue;
use coral_cql::serialize::SerializedValues;
use thiserror::Error;

/// A position on the token ring, as computed by the Murmur3 partitioner.
#[derive(Eq, PartialEq, Hash, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct Token {
    value: i64,
}

impl Token {
    pub fn new(value: i64) -> Self {
        Token { value }
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenCalculationError {
    #[error("Value is too long to be a routing key component: {0} bytes")]
    ValueTooLong(usize),
}

/// Incremental Murmur3 x64_128 hasher, of which the lower 64 bits form the
/// token. This is the same variant Cassandra's Murmur3Partitioner uses,
/// including its signed-byte quirks.
///
/// The algorithm consumes 16 bytes at a time; a 16-byte internal buffer
/// bridges chunk boundaries between `write` calls, and the final partial
/// chunk is folded in by `finish`.
pub(crate) struct Murmur3Hasher {
    total_len: usize,
    buf: [u8; Self::BUF_CAPACITY],
    h1: Wrapping<i64>,
    h2: Wrapping<i64>,
}

impl Murmur3Hasher {
    const BUF_CAPACITY: usize = 16;

    const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
    const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

    pub(crate) fn new() -> Self {
        Self {
            total_len: 0,
            buf: Default::default(),
            h1: Wrapping(0),
            h2: Wrapping(0),
        }
    }

    fn hash_16_bytes(&mut self, mut k1: Wrapping<i64>, mut k2: Wrapping<i64>) {
        k1 *= Self::C1;
        k1 = Self::rotl64(k1, 31);
        k1 *= Self::C2;
        self.h1 ^= k1;

        self.h1 = Self::rotl64(self.h1, 27);
        self.h1 += self.h2;
        self.h1 = self.h1 * Wrapping(5) + Wrapping(0x52dce729);

        k2 *= Self::C2;
        k2 = Self::rotl64(k2, 33);
        k2 *= Self::C1;
        self.h2 ^= k2;

        self.h2 = Self::rotl64(self.h2, 31);
        self.h2 += self.h1;
        self.h2 = self.h2 * Wrapping(5) + Wrapping(0x38495ab5);
    }

    #[inline]
    fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
        Wrapping((v.0 << n) | (v.0 as u64 >> (64 - n)) as i64)
    }

    #[inline]
    fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xff51afd7ed558ccd_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xc4ceb9fe1a85ec53_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);

        k
    }

    pub(crate) fn write(&mut self, mut pk_part: &[u8]) {
        let mut buf_len = self.total_len % Self::BUF_CAPACITY;
        self.total_len += pk_part.len();

        // If the buffer is nonempty and can be filled completely, fill it,
        // hash its contents, then empty it.
        if buf_len > 0 && Self::BUF_CAPACITY - buf_len <= pk_part.len() {
            let to_write = Ord::min(Self::BUF_CAPACITY - buf_len, pk_part.len());
            self.buf[buf_len..buf_len + to_write].copy_from_slice(&pk_part[..to_write]);
            pk_part.advance(to_write);
            buf_len += to_write;

            debug_assert_eq!(buf_len, Self::BUF_CAPACITY);
            let mut buf_ptr = &self.buf[..];
            let k1 = Wrapping(buf_ptr.get_i64_le());
            let k2 = Wrapping(buf_ptr.get_i64_le());
            self.hash_16_bytes(k1, k2);
            buf_len = 0;
        }

        if buf_len == 0 {
            // Fast path for big values: hash directly from the input.
            while pk_part.len() >= Self::BUF_CAPACITY {
                let k1 = Wrapping(pk_part.get_i64_le());
                let k2 = Wrapping(pk_part.get_i64_le());
                self.hash_16_bytes(k1, k2);
            }
        }

        // Stash the remainder in the buffer for the next write or finish.
        debug_assert!(pk_part.len() < Self::BUF_CAPACITY - buf_len);
        let to_write = pk_part.len();
        self.buf[buf_len..buf_len + to_write].copy_from_slice(&pk_part[..to_write]);
    }

    pub(crate) fn finish(&self) -> Token {
        let mut h1 = self.h1;
        let mut h2 = self.h2;

        let mut k1 = Wrapping(0_i64);
        let mut k2 = Wrapping(0_i64);

        let buf_len = self.total_len % Self::BUF_CAPACITY;

        if buf_len > 8 {
            for i in (8..buf_len).rev() {
                k2 ^= Wrapping(self.buf[i] as i8 as i64) << ((i - 8) * 8);
            }

            k2 *= Self::C2;
            k2 = Self::rotl64(k2, 33);
            k2 *= Self::C1;
            h2 ^= k2;
        }

        if buf_len > 0 {
            for i in (0..std::cmp::min(8, buf_len)).rev() {
                k1 ^= Wrapping(self.buf[i] as i8 as i64) << (i * 8);
            }

            k1 *= Self::C1;
            k1 = Self::rotl64(k1, 31);
            k1 *= Self::C2;
            h1 ^= k1;
        }

        h1 ^= Wrapping(self.total_len as i64);
        h2 ^= Wrapping(self.total_len as i64);

        h1 += h2;
        h2 += h1;

        h1 = Self::fmix(h1);
        h2 = Self::fmix(h2);

        h1 += h2;
        h2 += h1;

        Token::new((((h2.0 as i128) << 64) | h1.0 as i128) as i64)
    }
}

/// Calculates the token for a serialized partition key.
///
/// A single-component key is hashed as its raw bytes; a composite key is
/// hashed in Cassandra's composite format (2-byte length, bytes, 0 byte,
/// per component).
pub fn calculate_token_for_partition_key(
    serialized_partition_key_values: &SerializedValues,
) -> Result<Token, TokenCalculationError> {
    let mut hasher = Murmur3Hasher::new();

    if serialized_partition_key_values.len() == 1 {
        let val = serialized_partition_key_values.iter().next();
        if let Some(RawValue::Value(val)) = val {
            hasher.write(val);
        }
    } else {
        for val in serialized_partition_key_values
            .iter()
            .filter_map(|rv| rv.as_value())
        {
            let val_len_u16: u16 = val
                .len()
                .try_into()
                .map_err(|_| TokenCalculationError::ValueTooLong(val.len()))?;
            hasher.write(&val_len_u16.to_be_bytes());
            hasher.write(val);
            hasher.write(&[0u8]);
        }
    }

    Ok(hasher.finish())
}
