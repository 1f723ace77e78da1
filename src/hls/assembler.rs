//! Segment concatenation and decryption
//!
//! Segments land in a `<target>.parts/` directory, one temp file per playlist
//! index. Once every segment is on disk the assembler walks them strictly in
//! index order, decrypts when the playlist carried a key (AES/CBC, PKCS7
//! padding) and appends to the final file, deleting each temp file as it is
//! consumed. Download completion order never influences the output bytes.

use crate::error::{EngineError, Result};
use crate::hls::playlist::{EncryptionMethod, PlaylistDescriptor};
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Directory holding the per-index segment temp files for `target`
pub fn parts_dir_for(target: &Path) -> PathBuf {
    let mut raw: OsString = target.as_os_str().to_os_string();
    raw.push(".parts");
    PathBuf::from(raw)
}

/// Concatenates downloaded segments into the final file
pub struct SegmentAssembler {
    parts_dir: PathBuf,
}

impl SegmentAssembler {
    pub fn new(parts_dir: PathBuf) -> Self {
        Self { parts_dir }
    }

    /// Temp-file path of a segment; the file name is the playlist index
    pub fn segment_path(&self, index: u64) -> PathBuf {
        self.parts_dir.join(index.to_string())
    }

    /// Concatenate all segments of `descriptor` into `final_path`.
    ///
    /// Temp files are removed as they are consumed; the parts directory is
    /// removed at the end.
    pub async fn assemble(
        &self,
        descriptor: &PlaylistDescriptor,
        final_path: &Path,
    ) -> Result<()> {
        let key = match descriptor.method {
            EncryptionMethod::Aes => descriptor.key_bytes(),
            EncryptionMethod::None => None,
        };
        let iv = descriptor.iv_bytes()?;

        let mut output = tokio::fs::File::create(final_path).await?;
        for index in 0..descriptor.segments.len() as u64 {
            let part = self.segment_path(index);
            let data = tokio::fs::read(&part).await?;
            let data = match &key {
                Some(key) => decrypt_segment(key, &iv, data)?,
                None => data,
            };
            output.write_all(&data).await?;
            tokio::fs::remove_file(&part).await?;
        }
        output.flush().await?;

        // Best effort: the directory may hold leftovers from older runs.
        let _ = tokio::fs::remove_dir(&self.parts_dir).await;
        debug!(file = %final_path.display(), "segments assembled");
        Ok(())
    }
}

/// Decrypt one whole segment with AES/CBC and PKCS7 padding.
///
/// The key length picks the cipher width: 16/24/32 bytes map to
/// AES-128/192/256. Every segment starts from the playlist IV.
pub fn decrypt_segment(key: &[u8], iv: &[u8; 16], mut data: Vec<u8>) -> Result<Vec<u8>> {
    let plain_len = match key.len() {
        16 => {
            let decryptor = cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|e| EngineError::DecryptionFailed(e.to_string()))?;
            decryptor
                .decrypt_padded_mut::<Pkcs7>(&mut data)
                .map_err(|e| EngineError::DecryptionFailed(e.to_string()))?
                .len()
        }
        24 => {
            let decryptor = cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|e| EngineError::DecryptionFailed(e.to_string()))?;
            decryptor
                .decrypt_padded_mut::<Pkcs7>(&mut data)
                .map_err(|e| EngineError::DecryptionFailed(e.to_string()))?
                .len()
        }
        32 => {
            let decryptor = cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|e| EngineError::DecryptionFailed(e.to_string()))?;
            decryptor
                .decrypt_padded_mut::<Pkcs7>(&mut data)
                .map_err(|e| EngineError::DecryptionFailed(e.to_string()))?
                .len()
        }
        other => return Err(EngineError::InvalidKeyLength(other)),
    };
    data.truncate(plain_len);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    fn encrypt(key: &[u8; 16], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
        let encryptor = cbc::Encryptor::<Aes128>::new_from_slices(key, iv).unwrap();
        encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    #[test]
    fn test_decrypt_round_trip() {
        let key = *b"0123456789abcdef";
        let iv = [7u8; 16];
        let plain = b"some segment payload that is not block aligned";
        let cipher = encrypt(&key, &iv, plain);

        let out = decrypt_segment(&key, &iv, cipher).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn test_decrypt_rejects_bad_key_length() {
        assert!(matches!(
            decrypt_segment(b"short", &[0u8; 16], vec![0u8; 16]),
            Err(EngineError::InvalidKeyLength(5))
        ));
    }

    #[test]
    fn test_decrypt_rejects_garbage_padding() {
        let key = *b"0123456789abcdef";
        assert!(matches!(
            decrypt_segment(&key, &[0u8; 16], vec![0xAA; 32]),
            Err(EngineError::DecryptionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_assemble_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.ts");
        let parts = parts_dir_for(&target);
        tokio::fs::create_dir_all(&parts).await.unwrap();

        let assembler = SegmentAssembler::new(parts.clone());
        // Write parts out of order; only the index names matter.
        tokio::fs::write(assembler.segment_path(2), b"CC").await.unwrap();
        tokio::fs::write(assembler.segment_path(0), b"AA").await.unwrap();
        tokio::fs::write(assembler.segment_path(1), b"BB").await.unwrap();

        let descriptor = PlaylistDescriptor {
            segments: vec![
                "https://host/0.ts".to_string(),
                "https://host/1.ts".to_string(),
                "https://host/2.ts".to_string(),
            ],
            key: None,
            iv: None,
            method: EncryptionMethod::None,
        };
        assembler.assemble(&descriptor, &target).await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"AABBCC");
        assert!(!assembler.segment_path(0).exists());
        assert!(!parts.exists());
    }
}
