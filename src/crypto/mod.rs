pub mod aead;
pub mod envelope;
pub mod keys;
