use crate::error::Result;

/// Symmetric transform applied to keys, values and sidecar blobs when a
/// store is opened with encryption.
///
/// Implementations must keep ciphertext length a function of plaintext
/// length alone (the record layout depends on it), and the fixed-width
/// integer transforms must be length-preserving, e.g. a stream or
/// format-preserving construction. Booleans are never passed through the
/// cipher.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, src: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, src: &[u8]) -> Result<Vec<u8>>;

    fn encrypt_i32(&self, v: i32) -> i32;

    fn decrypt_i32(&self, v: i32) -> i32;

    fn encrypt_i64(&self, v: i64) -> i64;

    fn decrypt_i64(&self, v: i64) -> i64;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A toy keystream cipher for tests. Not secure, but deterministic,
    /// length-preserving, and invertible, which is all the engine assumes.
    pub struct XorStreamCipher {
        seed: u64,
    }

    impl XorStreamCipher {
        pub fn new(seed: u64) -> Self {
            Self { seed }
        }

        fn stream(&self, i: usize) -> u8 {
            let x = self
                .seed
                .wrapping_add(i as u64)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15);
            (x >> 32) as u8
        }
    }

    impl Cipher for XorStreamCipher {
        fn encrypt(&self, src: &[u8]) -> Result<Vec<u8>> {
            Ok(src
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ self.stream(i))
                .collect())
        }

        fn decrypt(&self, src: &[u8]) -> Result<Vec<u8>> {
            self.encrypt(src)
        }

        fn encrypt_i32(&self, v: i32) -> i32 {
            v ^ self.seed as i32
        }

        fn decrypt_i32(&self, v: i32) -> i32 {
            v ^ self.seed as i32
        }

        fn encrypt_i64(&self, v: i64) -> i64 {
            v ^ self.seed as i64
        }

        fn decrypt_i64(&self, v: i64) -> i64 {
            v ^ self.seed as i64
        }
    }

    #[test]
    fn test_xor_stream_round_trip() {
        let cipher = XorStreamCipher::new(0xA5A5);
        let plain = b"the quick brown fox".to_vec();
        let enc = cipher.encrypt(&plain).unwrap();
        assert_ne!(enc, plain);
        assert_eq!(enc.len(), plain.len());
        assert_eq!(cipher.decrypt(&enc).unwrap(), plain);

        assert_eq!(cipher.decrypt_i32(cipher.encrypt_i32(-42)), -42);
        assert_eq!(cipher.decrypt_i64(cipher.encrypt_i64(i64::MIN)), i64::MIN);
    }
}
