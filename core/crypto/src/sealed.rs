//! Small secrets encrypted under a passphrase-derived key.
//!
//! A [`SealedSecret`] carries everything needed to re-derive its key from
//! the right passphrase: the purpose-tagged salt, the IV and the stream
//! ciphertext. It is the on-disk form of the cross-encrypted master and
//! recovery keys.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::encoding;
use crate::keys::{Iv, KeyPurpose, Salt};

/// A passphrase-sealed secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub salt: Salt,
    pub iv: Iv,
    #[serde(with = "encoding::b64")]
    pub ciphertext: Vec<u8>,
}

impl SealedSecret {
    /// The derivation purpose recorded in the salt.
    pub fn purpose(&self) -> KeyPurpose {
        self.salt.purpose()
    }
}

impl Zeroize for SealedSecret {
    fn zeroize(&mut self) {
        self.ciphertext.zeroize();
    }
}
