use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

/// Base64 engines that accept both padded and unpadded input. Tokens and key
/// material coming back from the identity platform are inconsistently padded,
/// so every decode in this workspace goes through one of these.
const PADDING_INDIFFERENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);

const URL_SAFE_TOLERANT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, PADDING_INDIFFERENT);
const STANDARD_TOLERANT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, PADDING_INDIFFERENT);

pub fn decode_urlsafe(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_TOLERANT.decode(data)
}

pub fn decode_standard(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_TOLERANT.decode(data)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    bytes
}

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn sha256(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}
