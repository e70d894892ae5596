use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use anyhow::{anyhow, Result};
use ring::aead;
use tracing::trace;

use crate::packet::HeaderForm;

// Sample size for AES-128-GCM, AES-256-GCM and ChaCha20-Poly1305
pub(crate) const QUIC_SAMPLE_LENGTH: usize = 16;
pub(crate) const QUIC_HP_MASK_LENGTH: usize = 5; // Header protection mask length
const QUIC_NONCE_LENGTH: usize = 12; // AEAD nonce length
pub(crate) const MAX_PACKET_NUMBER_LENGTH: usize = 4; // Maximum encoded packet number length
// Authentication tag length for all supported AEAD algorithms
pub const QUIC_TAG_LENGTH: usize = 16;

const LONG_HEADER_FLAG_MASK: u8 = 0x0f;
const SHORT_HEADER_FLAG_MASK: u8 = 0x1f;

/// Packet payload protection, keyed for one encryption level and direction
pub trait QuicAead {
    /// Bytes added to every sealed payload
    fn overhead(&self) -> usize;

    /// Seals `payload` in place and hands back the detached tag
    fn encrypt_in_place(&self, payload: &mut [u8], aad: &[u8], packet_number: u64)
        -> Result<Vec<u8>>;

    fn encrypt(&self, plain_text: &[u8], aad: &[u8], packet_number: u64) -> Result<Vec<u8>> {
        let mut in_out_buffer = Vec::with_capacity(plain_text.len() + self.overhead());
        in_out_buffer.extend_from_slice(plain_text);
        let tag = self.encrypt_in_place(&mut in_out_buffer, aad, packet_number)?;
        in_out_buffer.extend_from_slice(&tag);
        Ok(in_out_buffer)
    }
}

/// Obfuscates the first byte and the packet number field of a header
pub trait QuicHeaderProtector {
    fn mask(&self, sample: &[u8]) -> Result<[u8; QUIC_HP_MASK_LENGTH]>;

    fn encrypt_long_header(
        &self,
        sample: &[u8],
        first_byte: &mut u8,
        packet_number: &mut [u8],
    ) -> Result<()> {
        apply_header_mask(
            &self.mask(sample)?,
            LONG_HEADER_FLAG_MASK,
            first_byte,
            packet_number,
        );
        Ok(())
    }

    fn encrypt_short_header(
        &self,
        sample: &[u8],
        first_byte: &mut u8,
        packet_number: &mut [u8],
    ) -> Result<()> {
        apply_header_mask(
            &self.mask(sample)?,
            SHORT_HEADER_FLAG_MASK,
            first_byte,
            packet_number,
        );
        Ok(())
    }
}

fn apply_header_mask(
    mask: &[u8; QUIC_HP_MASK_LENGTH],
    flag_mask: u8,
    first_byte: &mut u8,
    packet_number: &mut [u8],
) {
    *first_byte ^= mask[0] & flag_mask;
    packet_number
        .iter_mut()
        .zip(mask[1..].iter())
        .for_each(|(p, m)| *p ^= *m);
}

pub struct AesGcmAead {
    key: aead::LessSafeKey,
    iv: [u8; QUIC_NONCE_LENGTH],
}

impl AesGcmAead {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        let aead_algo = match key.len() {
            16 => &aead::AES_128_GCM,
            32 => &aead::AES_256_GCM,
            len => return Err(anyhow!("Unsupported AEAD key length {}", len)),
        };
        let iv: [u8; QUIC_NONCE_LENGTH] = iv
            .try_into()
            .map_err(|_| anyhow!("Invalid iv length {}", iv.len()))?;
        let key = aead::LessSafeKey::new(
            aead::UnboundKey::new(aead_algo, key)
                .map_err(|e| anyhow!("Failed to create sealing key, due to {e}"))?,
        );

        Ok(Self { key, iv })
    }

    fn nonce(&self, packet_number: u64) -> [u8; QUIC_NONCE_LENGTH] {
        // Construct AEAD nonce by XORing padded packet number with IV
        let mut nonce = [0u8; QUIC_NONCE_LENGTH];
        nonce[QUIC_NONCE_LENGTH - 8..].copy_from_slice(&packet_number.to_be_bytes());
        nonce
            .iter_mut()
            .zip(self.iv.iter())
            .for_each(|(nonce, iv)| *nonce ^= *iv);
        nonce
    }
}

impl QuicAead for AesGcmAead {
    fn overhead(&self) -> usize {
        QUIC_TAG_LENGTH
    }

    fn encrypt_in_place(
        &self,
        payload: &mut [u8],
        aad: &[u8],
        packet_number: u64,
    ) -> Result<Vec<u8>> {
        let nonce = self.nonce(packet_number);
        trace!(
            "Sealing {} bytes, aad size {}, packet number {}",
            payload.len(),
            aad.len(),
            packet_number
        );
        let tag = self
            .key
            .seal_in_place_separate_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(aad),
                payload,
            )
            .map_err(|e| anyhow!("Failed to seal packet {packet_number}, due to {e}"))?;

        Ok(tag.as_ref().to_vec())
    }
}

pub struct AesHeaderProtector {
    cipher: Aes128,
}

impl AesHeaderProtector {
    pub fn new(key: &[u8]) -> Result<Self> {
        // AES-ECB here is only a pseudorandom function over the sample,
        // see RFC 9001 Section 5.4.3
        let cipher = Aes128::new_from_slice(key)
            .map_err(|e| anyhow!("Failed to create header protection key, due to {e}"))?;
        Ok(Self { cipher })
    }
}

impl QuicHeaderProtector for AesHeaderProtector {
    fn mask(&self, sample: &[u8]) -> Result<[u8; QUIC_HP_MASK_LENGTH]> {
        if sample.len() < QUIC_SAMPLE_LENGTH {
            return Err(anyhow!(
                "Header protection sample too short {}",
                sample.len()
            ));
        }
        let mut block = [0u8; QUIC_SAMPLE_LENGTH];
        block.copy_from_slice(&sample[..QUIC_SAMPLE_LENGTH]);
        self.cipher.encrypt_block((&mut block).into());

        let mut mask = [0u8; QUIC_HP_MASK_LENGTH];
        mask.copy_from_slice(&block[..QUIC_HP_MASK_LENGTH]);
        trace!("Generated header protection mask: {:x?}", mask);
        Ok(mask)
    }
}

/// Applies header protection to an already encoded `header`.
/// The packet number is assumed to be the trailing bytes of the header,
/// and `body` is the sealed payload that follows it.
pub(crate) fn encrypt_packet_header(
    header_form: HeaderForm,
    header: &mut [u8],
    body: &[u8],
    protector: &dyn QuicHeaderProtector,
) -> Result<()> {
    // https://www.rfc-editor.org/rfc/rfc9001.html#section-5.4.2
    // The packet number field is assumed to be 4 bytes long when sampling
    let first = *header
        .first()
        .ok_or_else(|| anyhow!("Empty header can not be protected"))?;
    let packet_number_length = ((first & 0x03) + 1) as usize;
    let sample_start = MAX_PACKET_NUMBER_LENGTH - packet_number_length;
    assert!(
        body.len() >= sample_start + QUIC_SAMPLE_LENGTH,
        "Not enough bytes to sample, body {} pn length {}",
        body.len(),
        packet_number_length
    );
    assert!(header.len() > packet_number_length);
    let sample = &body[sample_start..sample_start + QUIC_SAMPLE_LENGTH];

    let pn_start = header.len() - packet_number_length;
    let (flag, rest) = header.split_at_mut(1);
    let packet_number = &mut rest[pn_start - 1..];
    match header_form {
        HeaderForm::Long => protector.encrypt_long_header(sample, &mut flag[0], packet_number),
        HeaderForm::Short => protector.encrypt_short_header(sample, &mut flag[0], packet_number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // https://www.rfc-editor.org/rfc/rfc9001.html#appendix-A.2
    const CLIENT_INITIAL_KEY: &str = "1f369613dd76d5467730efcbe3b1a22d";
    const CLIENT_INITIAL_IV: &str = "fa044b2f42a3fd3b46fb255c";
    const CLIENT_INITIAL_HP: &str = "9f50449e04a0e810283a1e9933adedd2";

    #[test]
    fn test_header_protection_mask() -> Result<()> {
        let protector = AesHeaderProtector::new(&hex(CLIENT_INITIAL_HP))?;
        let mask = protector.mask(&hex("d1b1c98dd7689fb8ec11d242b123dc9b"))?;
        assert_eq!(mask.to_vec(), hex("437b9aec36"));
        assert!(protector.mask(&[0u8; 4]).is_err());
        Ok(())
    }

    #[test]
    fn test_encrypt_long_packet_header() -> Result<()> {
        let protector = AesHeaderProtector::new(&hex(CLIENT_INITIAL_HP))?;
        let mut header = hex("c300000001088394c8f03e5157080000449e00000002");
        // pn length is 4, so the sample starts at the body's first byte
        let mut body = hex("d1b1c98dd7689fb8ec11d242b123dc9b");
        body.extend_from_slice(&[0u8; 8]);

        encrypt_packet_header(HeaderForm::Long, &mut header, &body, &protector)?;
        assert_eq!(
            header,
            hex("c000000001088394c8f03e5157080000449e7b9aec34")
        );
        Ok(())
    }

    #[test]
    fn test_short_header_sample_skips_unused_pn_bytes() -> Result<()> {
        let protector = AesHeaderProtector::new(&hex(CLIENT_INITIAL_HP))?;
        // One byte packet number, the sample skips three bytes of body
        let mut header = vec![0x40, 0xaa, 0xbb, 0x07];
        let mut body = vec![0u8; 3];
        body.extend_from_slice(&hex("d1b1c98dd7689fb8ec11d242b123dc9b"));

        encrypt_packet_header(HeaderForm::Short, &mut header, &body, &protector)?;
        assert_eq!(header[0], 0x40 ^ (0x43 & 0x1f));
        assert_eq!(&header[1..3], &[0xaa, 0xbb]);
        assert_eq!(header[3], 0x07 ^ 0x7b);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "Not enough bytes to sample")]
    fn test_short_body_can_not_be_sampled() {
        let protector = AesHeaderProtector::new(&hex(CLIENT_INITIAL_HP)).unwrap();
        let mut header = vec![0x40, 0x01];
        let body = vec![0u8; 18];
        let _ = encrypt_packet_header(HeaderForm::Short, &mut header, &body, &protector);
    }

    #[test]
    fn test_aead_round_trip_with_ring() -> Result<()> {
        let key = hex(CLIENT_INITIAL_KEY);
        let iv = hex(CLIENT_INITIAL_IV);
        let sealer = AesGcmAead::new(&key, &iv)?;
        assert_eq!(sealer.overhead(), QUIC_TAG_LENGTH);

        let aad = hex("c300000001088394c8f03e5157080000449e00000002");
        let plain_text = b"feather quic payload".to_vec();
        let mut sealed = sealer.encrypt(&plain_text, &aad, 2)?;
        assert_eq!(sealed.len(), plain_text.len() + QUIC_TAG_LENGTH);

        let mut nonce = [0u8; QUIC_NONCE_LENGTH];
        nonce[4..].copy_from_slice(&2u64.to_be_bytes());
        nonce.iter_mut().zip(iv.iter()).for_each(|(n, i)| *n ^= *i);
        let opener =
            aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &key).unwrap());
        let opened = opener
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(&aad),
                &mut sealed,
            )
            .unwrap();
        assert_eq!(opened, plain_text.as_slice());
        Ok(())
    }

    #[test]
    fn test_aead_rejects_bad_key() {
        assert!(AesGcmAead::new(&[0u8; 7], &[0u8; 12]).is_err());
        assert!(AesGcmAead::new(&[0u8; 16], &[0u8; 8]).is_err());
    }
}
