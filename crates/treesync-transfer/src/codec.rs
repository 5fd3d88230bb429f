//! Per-file streaming encryption
//!
//! Every encrypted file is a self-describing container:
//!
//! ```text
//! ┌────────────────────────┬──────────────────────────────┬──────────────┐
//! │ EncryptedHeader (1024) │ AES-256-CBC ciphertext       │ zero padding │
//! │ wrapped key, IV, sizes │ PKCS#7, n - n%16 + 16 bytes  │ n%16 bytes   │
//! └────────────────────────┴──────────────────────────────┴──────────────┘
//! ```
//!
//! so the container length is always `1024 + n + 16` for a plaintext of `n`
//! bytes. A fresh AES key and IV are drawn for every file; the key travels
//! wrapped with the recipient's RSA public key (OAEP, SHA-256) and the header
//! carries the SHA-1 thumbprint of that public key so the matching private key
//! can be found on the way back.
//!
//! ## State machine
//!
//! ```text
//!  Encrypt:  Idle ──first chunk──► HeaderWritten ──► Transforming ──finalize──► Finalized
//!  Decrypt:  Idle ──1024 bytes───► HeaderRead    ──► Transforming ──finalize──► Finalized
//! ```
//!
//! A codec handles exactly one file. Create a new one per transfer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Result, TransferError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Size of the [`EncryptedHeader`] in bytes
pub const HEADER_SIZE: usize = 1024;
/// AES block size; also the worst-case PKCS#7 padding
pub const BLOCK_SIZE: usize = 16;

const KEY_SIZE: usize = 32;
const MAGIC: &[u8; 4] = b"TSE1";
const FORMAT_VERSION: u16 = 1;
const WRAPPED_KEY_MAX: usize = 512;

const OFF_VERSION: usize = 4;
const OFF_WRAPPED_LEN: usize = 6;
const OFF_WRAPPED_KEY: usize = 8;
const OFF_IV: usize = OFF_WRAPPED_KEY + WRAPPED_KEY_MAX;
const OFF_ORIGINAL_LEN: usize = OFF_IV + BLOCK_SIZE;
const OFF_ENCRYPTED_LEN: usize = OFF_ORIGINAL_LEN + 8;
const OFF_THUMBPRINT: usize = OFF_ENCRYPTED_LEN + 8;
const OFF_PADDING_LEN: usize = OFF_THUMBPRINT + 20;
const OFF_CHECKSUM: usize = HEADER_SIZE - 32;

/// Container length for a plaintext of `plaintext_len` bytes
pub const fn encrypted_size(plaintext_len: u64) -> u64 {
    HEADER_SIZE as u64 + plaintext_len + BLOCK_SIZE as u64
}

/// Plaintext length for a container of `encrypted_len` bytes, `None` if the
/// container is too short to be valid
pub const fn decrypted_size(encrypted_len: u64) -> Option<u64> {
    encrypted_len.checked_sub(HEADER_SIZE as u64 + BLOCK_SIZE as u64)
}

// ============================================================================
// EncryptedHeader
// ============================================================================

/// Fixed 1024-byte header written once at the start of an encrypted stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedHeader {
    pub wrapped_key: Vec<u8>,
    pub iv: [u8; BLOCK_SIZE],
    pub original_length: u64,
    pub encrypted_length: u64,
    pub thumbprint: [u8; 20],
    pub padding_length: u32,
}

impl EncryptedHeader {
    /// Header for a plaintext of `original_length` bytes
    pub fn new(
        wrapped_key: Vec<u8>,
        iv: [u8; BLOCK_SIZE],
        original_length: u64,
        thumbprint: [u8; 20],
    ) -> Self {
        Self {
            wrapped_key,
            iv,
            original_length,
            encrypted_length: encrypted_size(original_length),
            thumbprint,
            padding_length: (original_length % BLOCK_SIZE as u64) as u32,
        }
    }

    /// Serialize with a freshly computed checksum
    ///
    /// # Errors
    /// Returns error if the wrapped key does not fit its slot
    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        if self.wrapped_key.is_empty() || self.wrapped_key.len() > WRAPPED_KEY_MAX {
            return Err(TransferError::Encryption(format!(
                "wrapped key of {} bytes does not fit the header",
                self.wrapped_key.len()
            )));
        }
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(MAGIC);
        buf[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[OFF_WRAPPED_LEN..OFF_WRAPPED_LEN + 2]
            .copy_from_slice(&(self.wrapped_key.len() as u16).to_le_bytes());
        buf[OFF_WRAPPED_KEY..OFF_WRAPPED_KEY + self.wrapped_key.len()]
            .copy_from_slice(&self.wrapped_key);
        buf[OFF_IV..OFF_IV + BLOCK_SIZE].copy_from_slice(&self.iv);
        buf[OFF_ORIGINAL_LEN..OFF_ORIGINAL_LEN + 8]
            .copy_from_slice(&self.original_length.to_le_bytes());
        buf[OFF_ENCRYPTED_LEN..OFF_ENCRYPTED_LEN + 8]
            .copy_from_slice(&self.encrypted_length.to_le_bytes());
        buf[OFF_THUMBPRINT..OFF_THUMBPRINT + 20].copy_from_slice(&self.thumbprint);
        buf[OFF_PADDING_LEN..OFF_PADDING_LEN + 4]
            .copy_from_slice(&self.padding_length.to_le_bytes());
        let checksum = Self::checksum(&buf);
        buf[OFF_CHECKSUM..].copy_from_slice(&checksum);
        Ok(buf)
    }

    /// Parse and validate a header
    ///
    /// # Errors
    /// Returns [`TransferError::HeaderIntegrity`] on checksum mismatch, bad
    /// magic or version, or inconsistent lengths
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let integrity = |msg: &str| TransferError::HeaderIntegrity(msg.to_string());

        if bytes.len() != HEADER_SIZE {
            return Err(integrity("header must be exactly 1024 bytes"));
        }
        if Self::checksum(bytes)[..] != bytes[OFF_CHECKSUM..] {
            return Err(integrity("checksum mismatch"));
        }
        if &bytes[..4] != MAGIC {
            return Err(integrity("bad magic"));
        }
        let version = u16::from_le_bytes([bytes[OFF_VERSION], bytes[OFF_VERSION + 1]]);
        if version != FORMAT_VERSION {
            return Err(TransferError::HeaderIntegrity(format!(
                "unsupported format version {version}"
            )));
        }
        let wrapped_len =
            u16::from_le_bytes([bytes[OFF_WRAPPED_LEN], bytes[OFF_WRAPPED_LEN + 1]]) as usize;
        if wrapped_len == 0 || wrapped_len > WRAPPED_KEY_MAX {
            return Err(integrity("wrapped key length out of range"));
        }

        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&bytes[OFF_IV..OFF_IV + BLOCK_SIZE]);
        let mut thumbprint = [0u8; 20];
        thumbprint.copy_from_slice(&bytes[OFF_THUMBPRINT..OFF_THUMBPRINT + 20]);
        let read_u64 = |off: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[off..off + 8]);
            u64::from_le_bytes(raw)
        };
        let mut raw_padding = [0u8; 4];
        raw_padding.copy_from_slice(&bytes[OFF_PADDING_LEN..OFF_PADDING_LEN + 4]);

        let header = Self {
            wrapped_key: bytes[OFF_WRAPPED_KEY..OFF_WRAPPED_KEY + wrapped_len].to_vec(),
            iv,
            original_length: read_u64(OFF_ORIGINAL_LEN),
            encrypted_length: read_u64(OFF_ENCRYPTED_LEN),
            thumbprint,
            padding_length: u32::from_le_bytes(raw_padding),
        };

        if decrypted_size(header.encrypted_length) != Some(header.original_length) {
            return Err(integrity("encrypted length does not match original length"));
        }
        if u64::from(header.padding_length) != header.original_length % BLOCK_SIZE as u64 {
            return Err(integrity("padding length does not match original length"));
        }
        Ok(header)
    }

    /// Length of the PKCS#7-padded ciphertext that follows the header
    pub fn ciphertext_length(&self) -> u64 {
        self.original_length - self.original_length % BLOCK_SIZE as u64 + BLOCK_SIZE as u64
    }

    fn checksum(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(&bytes[..OFF_CHECKSUM]).into()
    }
}

// ============================================================================
// Key material
// ============================================================================

/// SHA-1 thumbprint of a public key's PKCS#1 DER encoding
///
/// # Errors
/// Returns error if the key cannot be encoded
pub fn thumbprint(key: &RsaPublicKey) -> Result<[u8; 20]> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| TransferError::Encryption(format!("cannot encode public key: {e}")))?;
    Ok(Sha1::digest(der.as_bytes()).into())
}

/// Source of the recipient public key and of private keys for decryption
pub trait KeySource: Send + Sync {
    /// Key that new files are encrypted for
    fn public_key(&self) -> Result<&RsaPublicKey>;

    /// Thumbprint of [`Self::public_key`]
    fn public_thumbprint(&self) -> Result<[u8; 20]>;

    /// Private key matching a header thumbprint
    fn private_key(&self, thumbprint: &[u8; 20]) -> Result<&RsaPrivateKey>;
}

/// Key pair loaded from PEM files (PKCS#8 or PKCS#1)
#[derive(Debug, Clone)]
pub struct PemKeySource {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
    thumbprint: [u8; 20],
}

impl PemKeySource {
    /// Wrap already-parsed keys
    ///
    /// # Errors
    /// Returns error if the public key cannot be encoded for its thumbprint
    pub fn new(public: RsaPublicKey, private: Option<RsaPrivateKey>) -> Result<Self> {
        let thumbprint = thumbprint(&public)?;
        Ok(Self {
            public,
            private,
            thumbprint,
        })
    }

    /// Key pair derived from a private key
    ///
    /// # Errors
    /// Returns error if the public key cannot be encoded for its thumbprint
    pub fn from_private(private: RsaPrivateKey) -> Result<Self> {
        Self::new(private.to_public_key(), Some(private))
    }

    /// Generate a new key pair
    ///
    /// # Errors
    /// Returns error if key generation fails
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| TransferError::Encryption(format!("key generation failed: {e}")))?;
        Self::from_private(private)
    }

    /// Load a public key and, optionally, its private key
    pub fn load(public_path: &Path, private_path: Option<&Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pem = std::fs::read_to_string(public_path)
            .with_context(|| format!("reading public key {}", public_path.display()))?;
        let public = RsaPublicKey::from_public_key_pem(&pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
            .map_err(|e| anyhow::anyhow!("parsing public key {}: {e}", public_path.display()))?;

        let private = match private_path {
            Some(path) => {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("reading private key {}", path.display()))?;
                let key = RsaPrivateKey::from_pkcs8_pem(&pem)
                    .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
                    .map_err(|e| anyhow::anyhow!("parsing private key {}: {e}", path.display()))?;
                Some(key)
            }
            None => None,
        };

        Ok(Self::new(public, private)?)
    }

    /// Write `public.pem` and, when present, `private.pem` into `dir`
    pub fn write_pem(&self, dir: &Path) -> anyhow::Result<(PathBuf, Option<PathBuf>)> {
        std::fs::create_dir_all(dir)?;
        let public_path = dir.join("public.pem");
        let public_pem = self
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("encoding public key: {e}"))?;
        std::fs::write(&public_path, public_pem)?;

        let private_path = match &self.private {
            Some(private) => {
                let path = dir.join("private.pem");
                let pem = private
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| anyhow::anyhow!("encoding private key: {e}"))?;
                std::fs::write(&path, pem.as_bytes())?;
                Some(path)
            }
            None => None,
        };
        Ok((public_path, private_path))
    }

    /// Hex form of the public key thumbprint
    pub fn thumbprint_hex(&self) -> String {
        self.thumbprint.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl KeySource for PemKeySource {
    fn public_key(&self) -> Result<&RsaPublicKey> {
        Ok(&self.public)
    }

    fn public_thumbprint(&self) -> Result<[u8; 20]> {
        Ok(self.thumbprint)
    }

    fn private_key(&self, thumbprint: &[u8; 20]) -> Result<&RsaPrivateKey> {
        if thumbprint != &self.thumbprint {
            return Err(TransferError::KeyUnwrap(
                "no private key for the file's certificate thumbprint".to_string(),
            ));
        }
        self.private
            .as_ref()
            .ok_or_else(|| TransferError::KeyUnwrap("private key not configured".to_string()))
    }
}

// ============================================================================
// EncryptionCodec
// ============================================================================

/// Direction of a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    Encrypt,
    Decrypt,
}

/// Observable codec phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPhase {
    Idle,
    HeaderWritten,
    HeaderRead,
    Transforming,
    Finalized,
}

enum Cipher {
    None,
    Enc(Box<Aes256CbcEnc>),
    Dec(Box<Aes256CbcDec>),
}

/// Streaming encryptor/decryptor for exactly one file
pub struct EncryptionCodec {
    mode: CodecMode,
    phase: CodecPhase,
    keys: Arc<dyn KeySource>,
    cipher: Cipher,
    /// Encrypt: declared plaintext length
    declared_len: u64,
    header: Option<EncryptedHeader>,
    header_buf: Vec<u8>,
    /// Bytes waiting to complete a cipher block
    pending: Vec<u8>,
    /// Encrypt: plaintext consumed. Decrypt: plaintext emitted.
    plaintext_bytes: u64,
    /// Decrypt: ciphertext bytes consumed
    ciphertext_bytes: u64,
    /// Decrypt: trailing padding bytes consumed
    trailing_bytes: u64,
    /// Decrypt: last decrypted block, kept back for unpadding
    held_block: Option<[u8; BLOCK_SIZE]>,
}

impl std::fmt::Debug for EncryptionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionCodec")
            .field("mode", &self.mode)
            .field("phase", &self.phase)
            .field("plaintext_bytes", &self.plaintext_bytes)
            .finish_non_exhaustive()
    }
}

impl EncryptionCodec {
    /// Codec that encrypts a plaintext of exactly `plaintext_len` bytes
    pub fn encryptor(keys: Arc<dyn KeySource>, plaintext_len: u64) -> Self {
        Self::with_mode(CodecMode::Encrypt, keys, plaintext_len)
    }

    /// Codec that decrypts one container
    pub fn decryptor(keys: Arc<dyn KeySource>) -> Self {
        Self::with_mode(CodecMode::Decrypt, keys, 0)
    }

    fn with_mode(mode: CodecMode, keys: Arc<dyn KeySource>, declared_len: u64) -> Self {
        Self {
            mode,
            phase: CodecPhase::Idle,
            keys,
            cipher: Cipher::None,
            declared_len,
            header: None,
            header_buf: Vec::new(),
            pending: Vec::with_capacity(BLOCK_SIZE),
            plaintext_bytes: 0,
            ciphertext_bytes: 0,
            trailing_bytes: 0,
            held_block: None,
        }
    }

    pub fn mode(&self) -> CodecMode {
        self.mode
    }

    pub fn phase(&self) -> CodecPhase {
        self.phase
    }

    /// Header written or read so far
    pub fn header(&self) -> Option<&EncryptedHeader> {
        self.header.as_ref()
    }

    /// Length of the transformed stream for an input of `input_len` bytes
    pub fn output_len(&self, input_len: u64) -> Option<u64> {
        match self.mode {
            CodecMode::Encrypt => Some(encrypted_size(input_len)),
            CodecMode::Decrypt => decrypted_size(input_len),
        }
    }

    /// Transform one chunk
    ///
    /// # Errors
    /// Fails on header integrity or key problems, on input beyond the declared
    /// length, or when called after [`Self::finalize`]
    pub fn transform(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        if self.phase == CodecPhase::Finalized {
            return Err(TransferError::InvalidState(
                "codec already finalized".to_string(),
            ));
        }
        match self.mode {
            CodecMode::Encrypt => self.encrypt_chunk(chunk),
            CodecMode::Decrypt => self.decrypt_chunk(chunk),
        }
    }

    /// Transform the last chunk and flush the cipher
    ///
    /// # Errors
    /// Fails like [`Self::transform`], and additionally when the total length
    /// disagrees with the header or the padding is invalid
    pub fn finalize(&mut self, last: &[u8]) -> Result<Vec<u8>> {
        let mut out = self.transform(last)?;
        match self.mode {
            CodecMode::Encrypt => self.finish_encrypt(&mut out)?,
            CodecMode::Decrypt => self.finish_decrypt(&mut out)?,
        }
        self.phase = CodecPhase::Finalized;
        Ok(out)
    }

    // --- Encrypt ---

    fn begin_encrypt(&mut self) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; BLOCK_SIZE];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        let public = self.keys.public_key()?;
        let wrapped_key = public
            .encrypt(&mut rng, Oaep::new::<Sha256>(), &key)
            .map_err(|e| TransferError::Encryption(format!("key wrap failed: {e}")))?;
        let header = EncryptedHeader::new(
            wrapped_key,
            iv,
            self.declared_len,
            self.keys.public_thumbprint()?,
        );
        let bytes = header.to_bytes()?;

        let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|e| TransferError::Encryption(e.to_string()))?;
        self.cipher = Cipher::Enc(Box::new(cipher));
        self.header = Some(header);
        self.phase = CodecPhase::HeaderWritten;
        debug!(plaintext_len = self.declared_len, "Encrypted header written");
        Ok(bytes.to_vec())
    }

    fn encrypt_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let mut out = if self.phase == CodecPhase::Idle {
            self.begin_encrypt()?
        } else {
            Vec::with_capacity(chunk.len() + BLOCK_SIZE)
        };

        self.plaintext_bytes += chunk.len() as u64;
        if self.plaintext_bytes > self.declared_len {
            return Err(TransferError::LengthMismatch {
                expected: self.declared_len,
                actual: self.plaintext_bytes,
            });
        }

        self.pending.extend_from_slice(chunk);
        let full = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        let Cipher::Enc(cipher) = &mut self.cipher else {
            return Err(TransferError::InvalidState("cipher not initialized".to_string()));
        };
        for block in self.pending[..full].chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&self.pending[..full]);
        self.pending.drain(..full);
        if chunk.is_empty() && self.phase == CodecPhase::HeaderWritten {
            return Ok(out);
        }
        self.phase = CodecPhase::Transforming;
        Ok(out)
    }

    fn finish_encrypt(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.plaintext_bytes != self.declared_len {
            return Err(TransferError::LengthMismatch {
                expected: self.declared_len,
                actual: self.plaintext_bytes,
            });
        }
        let Cipher::Enc(cipher) = &mut self.cipher else {
            return Err(TransferError::InvalidState("cipher not initialized".to_string()));
        };
        let remainder = self.pending.len();
        let pad = (BLOCK_SIZE - remainder) as u8;
        let mut block = [pad; BLOCK_SIZE];
        block[..remainder].copy_from_slice(&self.pending);
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        out.extend_from_slice(&block);
        self.pending.clear();

        // Trailing zeros bring the container to exactly 1024 + n + 16 bytes.
        out.resize(out.len() + remainder, 0);
        Ok(())
    }

    // --- Decrypt ---

    fn begin_decrypt(&mut self) -> Result<()> {
        let header = EncryptedHeader::parse(&self.header_buf)?;
        let private = self.keys.private_key(&header.thumbprint)?;
        let key = private
            .decrypt(Oaep::new::<Sha256>(), &header.wrapped_key)
            .map_err(|e| TransferError::KeyUnwrap(e.to_string()))?;
        if key.len() != KEY_SIZE {
            return Err(TransferError::KeyUnwrap(format!(
                "unwrapped key has {} bytes",
                key.len()
            )));
        }
        let cipher = Aes256CbcDec::new_from_slices(&key, &header.iv)
            .map_err(|e| TransferError::KeyUnwrap(e.to_string()))?;
        debug!(
            original_len = header.original_length,
            "Encrypted header read"
        );
        self.cipher = Cipher::Dec(Box::new(cipher));
        self.header = Some(header);
        self.header_buf.clear();
        self.phase = CodecPhase::HeaderRead;
        Ok(())
    }

    fn decrypt_chunk(&mut self, mut chunk: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(chunk.len());

        if self.header.is_none() {
            let needed = HEADER_SIZE - self.header_buf.len();
            let take = needed.min(chunk.len());
            self.header_buf.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.header_buf.len() < HEADER_SIZE {
                return Ok(out);
            }
            self.begin_decrypt()?;
        }

        let Some(header) = &self.header else {
            return Ok(out);
        };
        let ciphertext_len = header.ciphertext_length();
        let padding_len = u64::from(header.padding_length);

        let remaining_cipher = ciphertext_len - self.ciphertext_bytes;
        let cipher_take = (remaining_cipher.min(chunk.len() as u64)) as usize;
        let (cipher_part, trailing) = chunk.split_at(cipher_take);

        self.trailing_bytes += trailing.len() as u64;
        if self.trailing_bytes > padding_len {
            return Err(TransferError::LengthMismatch {
                expected: header.encrypted_length,
                actual: HEADER_SIZE as u64 + ciphertext_len + self.trailing_bytes,
            });
        }
        self.ciphertext_bytes += cipher_part.len() as u64;

        let Cipher::Dec(cipher) = &mut self.cipher else {
            return Err(TransferError::InvalidState("cipher not initialized".to_string()));
        };
        self.pending.extend_from_slice(cipher_part);
        let full = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        for block in self.pending[..full].chunks_exact(BLOCK_SIZE) {
            let mut plain = [0u8; BLOCK_SIZE];
            plain.copy_from_slice(block);
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(&mut plain));
            if let Some(previous) = self.held_block.replace(plain) {
                out.extend_from_slice(&previous);
            }
        }
        self.pending.drain(..full);
        self.plaintext_bytes += out.len() as u64;
        if !cipher_part.is_empty() {
            self.phase = CodecPhase::Transforming;
        }
        Ok(out)
    }

    fn finish_decrypt(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let Some(header) = &self.header else {
            return Err(TransferError::HeaderIntegrity(format!(
                "truncated header: {} of {HEADER_SIZE} bytes",
                self.header_buf.len()
            )));
        };
        let expected_total = header.encrypted_length;
        let actual_total = HEADER_SIZE as u64 + self.ciphertext_bytes + self.trailing_bytes;
        if actual_total != expected_total || !self.pending.is_empty() {
            return Err(TransferError::LengthMismatch {
                expected: expected_total,
                actual: actual_total,
            });
        }

        let Some(last) = self.held_block.take() else {
            return Err(TransferError::Decryption("missing final block".to_string()));
        };
        let pad = last[BLOCK_SIZE - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE || last[BLOCK_SIZE - pad..].iter().any(|b| *b as usize != pad)
        {
            return Err(TransferError::Decryption("invalid padding".to_string()));
        }
        out.extend_from_slice(&last[..BLOCK_SIZE - pad]);
        self.plaintext_bytes += (BLOCK_SIZE - pad) as u64;

        if self.plaintext_bytes != header.original_length {
            return Err(TransferError::LengthMismatch {
                expected: header.original_length,
                actual: self.plaintext_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    /// Shared test key pair; RSA generation is slow in debug builds.
    pub(crate) fn test_keys() -> Arc<PemKeySource> {
        static KEYS: OnceLock<Arc<PemKeySource>> = OnceLock::new();
        KEYS.get_or_init(|| Arc::new(PemKeySource::generate(1024).expect("generate test key")))
            .clone()
    }

    fn encrypt_all(data: &[u8], chunk: usize) -> Vec<u8> {
        let mut codec = EncryptionCodec::encryptor(test_keys(), data.len() as u64);
        let mut out = Vec::new();
        let mut chunks = data.chunks(chunk.max(1)).peekable();
        if chunks.peek().is_none() {
            out.extend(codec.finalize(&[]).unwrap());
            return out;
        }
        while let Some(part) = chunks.next() {
            if chunks.peek().is_some() {
                out.extend(codec.transform(part).unwrap());
            } else {
                out.extend(codec.finalize(part).unwrap());
            }
        }
        out
    }

    fn decrypt_all(data: &[u8], chunk: usize) -> Result<Vec<u8>> {
        let mut codec = EncryptionCodec::decryptor(test_keys());
        let mut out = Vec::new();
        let parts: Vec<&[u8]> = data.chunks(chunk.max(1)).collect();
        let Some((last, body)) = parts.split_last() else {
            return codec.finalize(&[]);
        };
        for part in body {
            out.extend(codec.transform(part)?);
        }
        out.extend(codec.finalize(last)?);
        Ok(out)
    }

    // ========================================================================
    // Sizes
    // ========================================================================

    #[test]
    fn test_size_formulas_invert() {
        for n in [0u64, 1, 15, 16, 17, 65_535, 65_536, 1 << 40] {
            assert_eq!(encrypted_size(n), 1024 + n + 16);
            assert_eq!(decrypted_size(encrypted_size(n)), Some(n));
        }
        assert_eq!(decrypted_size(1039), None);
        assert_eq!(decrypted_size(0), None);
    }

    // ========================================================================
    // Header
    // ========================================================================

    #[test]
    fn test_header_layout() {
        let header = EncryptedHeader::new(vec![7; 128], [9; 16], 500, [3; 20]);
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..4], b"TSE1");
        assert_eq!(header.encrypted_length, 1540);
        assert_eq!(header.padding_length, 500 % 16);
        assert_eq!(EncryptedHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_checksum_mismatch_is_fatal() {
        let header = EncryptedHeader::new(vec![7; 128], [9; 16], 42, [3; 20]);
        let mut bytes = header.to_bytes().unwrap();
        bytes[OFF_ORIGINAL_LEN] ^= 0xff;
        let err = EncryptedHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, TransferError::HeaderIntegrity(ref m) if m.contains("checksum")));
    }

    #[test]
    fn test_header_rejects_oversized_wrapped_key() {
        let header = EncryptedHeader::new(vec![1; 600], [0; 16], 0, [0; 20]);
        assert!(header.to_bytes().is_err());
    }

    // ========================================================================
    // Round trips
    // ========================================================================

    #[test]
    fn test_roundtrip_various_lengths() {
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 1000, 4096, 70_001] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            for chunk in [1usize, 13, 16, 1024, 65_536] {
                let encrypted = encrypt_all(&data, chunk);
                assert_eq!(
                    encrypted.len() as u64,
                    encrypted_size(len as u64),
                    "len {len} chunk {chunk}"
                );
                let decrypted = decrypt_all(&encrypted, chunk).unwrap();
                assert_eq!(decrypted, data, "len {len} chunk {chunk}");
            }
        }
    }

    #[test]
    fn test_fresh_key_and_iv_per_file() {
        let data = b"same content".to_vec();
        let a = encrypt_all(&data, 64);
        let b = encrypt_all(&data, 64);
        let ha = EncryptedHeader::parse(&a[..HEADER_SIZE]).unwrap();
        let hb = EncryptedHeader::parse(&b[..HEADER_SIZE]).unwrap();
        assert_ne!(ha.iv, hb.iv);
        assert_ne!(ha.wrapped_key, hb.wrapped_key);
        assert_ne!(a[HEADER_SIZE..], b[HEADER_SIZE..]);
    }

    #[test]
    fn test_trailing_padding_is_zero() {
        let data = vec![0xAA; 21];
        let encrypted = encrypt_all(&data, 64);
        let padding = 21 % 16;
        assert!(encrypted[encrypted.len() - padding..].iter().all(|b| *b == 0));
    }

    // ========================================================================
    // Failure modes
    // ========================================================================

    #[test]
    fn test_corrupted_header_fails_decrypt() {
        let mut encrypted = encrypt_all(b"secret", 64);
        encrypted[OFF_IV] ^= 1;
        let err = decrypt_all(&encrypted, 64).unwrap_err();
        assert!(matches!(err, TransferError::HeaderIntegrity(_)));
    }

    #[test]
    fn test_truncated_container_fails() {
        let encrypted = encrypt_all(&[5u8; 100], 64);
        let err = decrypt_all(&encrypted[..encrypted.len() - 20], 64).unwrap_err();
        assert!(matches!(err, TransferError::LengthMismatch { .. }));

        let err = decrypt_all(&encrypted[..500], 64).unwrap_err();
        assert!(matches!(err, TransferError::HeaderIntegrity(_)));
    }

    #[test]
    fn test_encrypt_rejects_more_than_declared() {
        let mut codec = EncryptionCodec::encryptor(test_keys(), 4);
        let err = codec.transform(b"too long").unwrap_err();
        assert!(matches!(err, TransferError::LengthMismatch { .. }));
    }

    #[test]
    fn test_encrypt_rejects_less_than_declared() {
        let mut codec = EncryptionCodec::encryptor(test_keys(), 10);
        let err = codec.finalize(b"short").unwrap_err();
        assert!(matches!(err, TransferError::LengthMismatch { .. }));
    }

    #[test]
    fn test_wrong_private_key_fails_unwrap() {
        let encrypted = encrypt_all(b"secret", 64);
        let other = Arc::new(PemKeySource::generate(1024).unwrap());
        let mut codec = EncryptionCodec::decryptor(other);
        let err = codec.finalize(&encrypted).unwrap_err();
        assert!(matches!(err, TransferError::KeyUnwrap(_)));
    }

    #[test]
    fn test_codec_is_single_use() {
        let mut codec = EncryptionCodec::encryptor(test_keys(), 0);
        codec.finalize(&[]).unwrap();
        assert_eq!(codec.phase(), CodecPhase::Finalized);
        assert!(matches!(
            codec.transform(b"x"),
            Err(TransferError::InvalidState(_))
        ));
    }

    #[test]
    fn test_phases() {
        let mut codec = EncryptionCodec::encryptor(test_keys(), 32);
        assert_eq!(codec.phase(), CodecPhase::Idle);
        codec.transform(&[]).unwrap();
        assert_eq!(codec.phase(), CodecPhase::HeaderWritten);
        codec.transform(&[1; 16]).unwrap();
        assert_eq!(codec.phase(), CodecPhase::Transforming);
        codec.finalize(&[2; 16]).unwrap();
        assert_eq!(codec.phase(), CodecPhase::Finalized);
    }

    // ========================================================================
    // Key files
    // ========================================================================

    #[test]
    fn test_pem_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let keys = test_keys();
        let (public, private) = keys.write_pem(dir.path()).unwrap();
        let loaded = PemKeySource::load(&public, private.as_deref()).unwrap();
        assert_eq!(loaded.thumbprint_hex(), keys.thumbprint_hex());
        assert_eq!(loaded.thumbprint_hex().len(), 40);

        let public_only = PemKeySource::load(&public, None).unwrap();
        let thumb = public_only.public_thumbprint().unwrap();
        assert!(matches!(
            public_only.private_key(&thumb),
            Err(TransferError::KeyUnwrap(_))
        ));
    }
}
