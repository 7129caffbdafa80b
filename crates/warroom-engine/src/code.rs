use rand::Rng;

pub const CODE_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"0123456789abcdef";

/// A short, human-shareable join code: six lowercase hex characters.
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
