//! Chunk codec
//!
//! Splits plaintext into `CHUNK_SIZE` pieces, seals each one under a fresh
//! random nonce and frames it as a [`ChannelMessage`]. Every chunk decrypts on
//! its own; ordering comes from the channel.

use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;
use shared_protocol::{CHUNK_SIZE, ChannelMessage, EncryptedChunk};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{CryptoResult, NONCE_SIZE, SymmetricKey};

/// Fresh random nonce for one chunk
pub fn random_iv() -> [u8; NONCE_SIZE] {
    let mut iv = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Seal one plaintext chunk
pub fn encrypt_chunk(key: &dyn SymmetricKey, plaintext: &[u8]) -> CryptoResult<EncryptedChunk> {
    let iv = random_iv();
    let ciphertext = key.encrypt(&iv, plaintext)?;
    Ok(EncryptedChunk {
        iv: iv.to_vec(),
        ciphertext,
    })
}

/// Open one chunk. Any failure means the stream can no longer be trusted.
pub fn decode(key: &dyn SymmetricKey, chunk: &EncryptedChunk) -> CryptoResult<Vec<u8>> {
    let iv = chunk.iv_array()?;
    key.decrypt(&iv, &chunk.ciphertext)
}

/// Encode an in-memory buffer: one frame per chunk, then the done marker
pub fn encode(key: &dyn SymmetricKey, plaintext: &[u8]) -> CryptoResult<Vec<ChannelMessage>> {
    let mut frames = Vec::with_capacity(plaintext.len() / CHUNK_SIZE + 2);
    for piece in plaintext.chunks(CHUNK_SIZE) {
        frames.push(ChannelMessage::Chunk(encrypt_chunk(key, piece)?));
    }
    frames.push(ChannelMessage::Done);
    Ok(frames)
}

/// Frame produced by [`ChunkEncoder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub message: ChannelMessage,
    /// Plaintext bytes covered by this frame (0 for the done marker)
    pub plaintext_len: usize,
}

/// Streaming encoder over an async reader
///
/// Holds at most one chunk of plaintext at a time.
pub struct ChunkEncoder<R> {
    reader: R,
    key: Arc<dyn SymmetricKey>,
    buf: Vec<u8>,
    eof: bool,
    done_sent: bool,
}

impl<R: AsyncRead + Unpin> ChunkEncoder<R> {
    pub fn new(key: Arc<dyn SymmetricKey>, reader: R) -> Self {
        Self {
            reader,
            key,
            buf: vec![0u8; CHUNK_SIZE],
            eof: false,
            done_sent: false,
        }
    }

    /// Next frame, or `None` once the done marker has been produced
    pub async fn next_frame(&mut self) -> CryptoResult<Option<EncodedFrame>> {
        if self.done_sent {
            return Ok(None);
        }

        let filled = if self.eof { 0 } else { self.fill().await? };

        if filled == 0 {
            self.done_sent = true;
            return Ok(Some(EncodedFrame {
                message: ChannelMessage::Done,
                plaintext_len: 0,
            }));
        }

        let chunk = encrypt_chunk(self.key.as_ref(), &self.buf[..filled])?;
        Ok(Some(EncodedFrame {
            message: ChannelMessage::Chunk(chunk),
            plaintext_len: filled,
        }))
    }

    /// Read until the buffer is full or the reader is exhausted
    async fn fill(&mut self) -> CryptoResult<usize> {
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            let n = self.reader.read(&mut self.buf[filled..]).await?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{AesGcmKey, CryptoError};

    fn test_key() -> Arc<dyn SymmetricKey> {
        Arc::new(AesGcmKey::new(&[5u8; 32]).unwrap())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn reassemble(key: &dyn SymmetricKey, frames: &[ChannelMessage]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            if let ChannelMessage::Chunk(chunk) = frame {
                out.extend(decode(key, chunk).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_round_trip() {
        let key = test_key();
        for len in [0, 1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 3 * CHUNK_SIZE + 17] {
            let data = pattern(len);
            let frames = encode(key.as_ref(), &data).unwrap();
            assert_eq!(frames.last(), Some(&ChannelMessage::Done));
            assert_eq!(reassemble(key.as_ref(), &frames), data, "len {len}");
        }
    }

    #[test]
    fn test_200kb_splits_into_four_chunks() {
        let key = test_key();
        let frames = encode(key.as_ref(), &pattern(200_000)).unwrap();
        assert_eq!(frames.len(), 5);

        let sizes: Vec<usize> = frames
            .iter()
            .filter_map(|f| match f {
                ChannelMessage::Chunk(c) => Some(decode(key.as_ref(), c).unwrap().len()),
                ChannelMessage::Done => None,
            })
            .collect();
        assert_eq!(sizes, vec![CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE, 200_000 - 3 * CHUNK_SIZE]);
    }

    #[test]
    fn test_ivs_are_unique() {
        let key = test_key();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let chunk = encrypt_chunk(key.as_ref(), b"x").unwrap();
            assert!(seen.insert(chunk.iv));
        }
    }

    #[test]
    fn test_tampered_chunk_is_rejected() {
        let key = test_key();
        let mut chunk = encrypt_chunk(key.as_ref(), b"payload").unwrap();
        chunk.ciphertext[2] ^= 0x80;
        assert!(matches!(decode(key.as_ref(), &chunk), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let chunk = encrypt_chunk(test_key().as_ref(), b"payload").unwrap();
        let other = AesGcmKey::new(&[6u8; 32]).unwrap();
        assert!(decode(&other, &chunk).is_err());
    }

    #[tokio::test]
    async fn test_streaming_encoder_matches_input() {
        let key = test_key();
        let data = pattern(2 * CHUNK_SIZE + 100);
        let mut encoder = ChunkEncoder::new(key.clone(), std::io::Cursor::new(data.clone()));

        let mut frames = Vec::new();
        let mut lens = Vec::new();
        while let Some(frame) = encoder.next_frame().await.unwrap() {
            lens.push(frame.plaintext_len);
            frames.push(frame.message);
        }

        assert_eq!(lens, vec![CHUNK_SIZE, CHUNK_SIZE, 100, 0]);
        assert_eq!(frames.last(), Some(&ChannelMessage::Done));
        assert_eq!(reassemble(key.as_ref(), &frames), data);
        assert!(encoder.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_streaming_encoder_empty_source() {
        let mut encoder = ChunkEncoder::new(test_key(), std::io::Cursor::new(Vec::<u8>::new()));
        let first = encoder.next_frame().await.unwrap().unwrap();
        assert_eq!(first.message, ChannelMessage::Done);
        assert!(encoder.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_streaming_encoder_handles_short_reads() {
        // A duplex pipe hands out data in small writes
        let (mut writer, reader) = tokio::io::duplex(1024);
        let data = pattern(CHUNK_SIZE + 10);
        let payload = data.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for piece in payload.chunks(700) {
                writer.write_all(piece).await.unwrap();
            }
        });

        let key = test_key();
        let mut encoder = ChunkEncoder::new(key.clone(), reader);
        let mut frames = Vec::new();
        while let Some(frame) = encoder.next_frame().await.unwrap() {
            frames.push(frame.message);
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(reassemble(key.as_ref(), &frames), data);
    }
}
