// Copyright 2024 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BIP-39 paper keys and the 512-bit seed they derive.

use bip39::Mnemonic;
pub use bip39::Language;
use rand::rngs::OsRng;
use rand::RngCore as _;
use thiserror::Error as ThisError;
use zeroize::Zeroizing;

/// Error returned by paper-key operations.
#[derive(Debug, ThisError)]
pub enum PhraseError {
    /// The phrase failed BIP-39 word or checksum validation.
    #[error("invalid paper key")]
    InvalidPhrase,
    /// The OS random source produced no entropy. There is no fallback: a
    /// paper key from weak entropy is unrecoverable, so this surfaces as an
    /// error instead.
    #[error("entropy source unavailable")]
    EntropyUnavailable,
}

/// A 512-bit wallet seed; zeroed on drop.
pub struct Seed(Zeroizing<[u8; 64]>);

impl Seed {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Seed(..)")
    }
}

/// Derives the 512-bit seed from a paper key (empty passphrase).
pub fn derive_seed(phrase: &str) -> Result<Seed, PhraseError> {
    derive_seed_in(Language::English, phrase)
}

pub fn derive_seed_in(language: Language, phrase: &str) -> Result<Seed, PhraseError> {
    let mnemonic = Mnemonic::parse_in_normalized(language, phrase)
        .map_err(|_| PhraseError::InvalidPhrase)?;
    Ok(Seed(Zeroizing::new(mnemonic.to_seed_normalized(""))))
}

/// Draws 128 bits from the OS random source and encodes them as a 12-word
/// paper key.
pub fn generate(language: Language) -> Result<String, PhraseError> {
    let mut entropy = Zeroizing::new([0u8; 16]);
    OsRng
        .try_fill_bytes(&mut *entropy)
        .map_err(|_| PhraseError::EntropyUnavailable)?;
    let mnemonic =
        Mnemonic::from_entropy_in(language, &*entropy).map_err(|_| PhraseError::InvalidPhrase)?;
    Ok(mnemonic.to_string())
}

/// Checks the phrase's words and checksum against the wordlist.
pub fn validate(language: Language, phrase: &str) -> bool {
    Mnemonic::parse_in_normalized(language, phrase).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAPER_KEY: &str =
        "ginger settle marine tissue robot crane night number ramp coast roast critic";

    #[test]
    fn known_phrase_validates() {
        assert!(validate(Language::English, PAPER_KEY));
    }

    #[test]
    fn bad_checksum_rejected() {
        // Last word replaced; checksum no longer matches.
        let phrase =
            "ginger settle marine tissue robot crane night number ramp coast roast coast";
        assert!(!validate(Language::English, phrase));
        assert!(derive_seed(phrase).is_err());
    }

    #[test]
    fn seed_is_deterministic() {
        let a = derive_seed(PAPER_KEY).unwrap();
        let b = derive_seed(PAPER_KEY).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn generated_phrase_validates() {
        let phrase = generate(Language::English).unwrap();
        assert_eq!(phrase.split_whitespace().count(), 12);
        assert!(validate(Language::English, &phrase));
    }
}
