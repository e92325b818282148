//! Crypt4GH (v1) stream decryption for files re-encrypted by the upstream file service.
//!
//! Layout of an encrypted stream:
//!
//! ```text
//! "crypt4gh" | version u32le | packet count u32le
//! packet*:   length u32le (incl. itself) | method u32le | writer pk[32] | nonce[12] | sealed payload
//! segment*:  nonce[12] | ChaCha20-Poly1305(<= 64 KiB plaintext) | tag[16]
//! ```
//!
//! Header packets are sealed with a key derived from X25519(reader secret, writer pk); the
//! payloads carry the session keys the data segments are sealed with.

use anyhow::{anyhow, bail, ensure, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use blake2::{Blake2b512, Digest};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

const MAGIC: &[u8; 8] = b"crypt4gh";
const VERSION: u32 = 1;
const PREAMBLE_LEN: usize = 16;

const METHOD_X25519_CHACHA20_POLY1305: u32 = 0;
const DATA_METHOD_CHACHA20_POLY1305: u32 = 0;
const PACKET_DATA_ENCRYPTION_PARAMETERS: u32 = 0;
const PACKET_DATA_EDIT_LIST: u32 = 1;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const MAC_LEN: usize = 16;
pub const SEGMENT_SIZE: usize = 64 * 1024;
const CIPHER_SEGMENT_SIZE: usize = NONCE_LEN + SEGMENT_SIZE + MAC_LEN;

const PEM_BEGIN: &str = "-----BEGIN CRYPT4GH PUBLIC KEY-----";
const PEM_END: &str = "-----END CRYPT4GH PUBLIC KEY-----";

/// Ephemeral X25519 key pair, generated once per preparation.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    #[cfg(test)]
    fn from_secret(secret: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn public_key_pem(&self) -> String {
        format!(
            "{PEM_BEGIN}\n{}\n{PEM_END}\n",
            STANDARD.encode(self.public.as_bytes())
        )
    }

    /// Value of the `C4GH-Public-Key` request header: the PEM armored key, base64 encoded.
    pub fn public_key_header(&self) -> String {
        STANDARD.encode(self.public_key_pem())
    }

    pub fn decryptor(&self) -> Decryptor {
        Decryptor {
            secret: self.secret.clone(),
            public: self.public_key(),
            phase: Phase::Preamble,
            buf: Vec::new(),
            session_keys: Vec::new(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &STANDARD.encode(self.public.as_bytes()))
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parse a `C4GH-Public-Key` header value back into the raw X25519 public key.
pub fn parse_public_key_header(value: &str) -> anyhow::Result<[u8; KEY_LEN]> {
    let pem = STANDARD
        .decode(value.trim())
        .context("decode public key header")?;
    let pem = String::from_utf8(pem).context("public key header is not utf-8")?;
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    let raw = STANDARD.decode(body).context("decode public key")?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| anyhow!("public key must be {KEY_LEN} bytes, got {}", raw.len()))
}

/// BLAKE2b-512(dh | reader pk | writer pk), first 32 bytes. Both sides derive the same key.
fn shared_key(dh: &[u8; KEY_LEN], reader_pk: &[u8; KEY_LEN], writer_pk: &[u8; KEY_LEN]) -> Key {
    let mut hasher = Blake2b512::new();
    hasher.update(dh);
    hasher.update(reader_pk);
    hasher.update(writer_pk);
    let digest = hasher.finalize();
    Key::clone_from_slice(&digest[..KEY_LEN])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preamble,
    Packets { remaining: u32 },
    Body,
}

/// Incremental decryptor: feed ciphertext chunks of any size, collect plaintext.
pub struct Decryptor {
    secret: StaticSecret,
    public: [u8; KEY_LEN],
    phase: Phase,
    buf: Vec<u8>,
    session_keys: Vec<ChaCha20Poly1305>,
}

impl Decryptor {
    /// Consume `input` and append every plaintext segment that is now complete to `out`.
    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
        self.buf.extend_from_slice(input);
        loop {
            match self.phase {
                Phase::Preamble => {
                    if self.buf.len() < PREAMBLE_LEN {
                        return Ok(());
                    }
                    ensure!(&self.buf[..8] == MAGIC, "not a crypt4gh stream");
                    let version = read_u32(&self.buf, 8);
                    ensure!(version == VERSION, "unsupported crypt4gh version {version}");
                    let remaining = read_u32(&self.buf, 12);
                    self.buf.drain(..PREAMBLE_LEN);
                    self.phase = Phase::Packets { remaining };
                }
                Phase::Packets { remaining: 0 } => {
                    ensure!(
                        !self.session_keys.is_empty(),
                        "no header packet could be opened with the reader key"
                    );
                    self.phase = Phase::Body;
                }
                Phase::Packets { remaining } => {
                    if self.buf.len() < 4 {
                        return Ok(());
                    }
                    let len = read_u32(&self.buf, 0) as usize;
                    ensure!(len >= 8, "invalid header packet length {len}");
                    if self.buf.len() < len {
                        return Ok(());
                    }
                    let packet: Vec<u8> = self.buf.drain(..len).collect();
                    self.open_packet(&packet[4..])?;
                    self.phase = Phase::Packets {
                        remaining: remaining - 1,
                    };
                }
                Phase::Body => {
                    while self.buf.len() >= CIPHER_SEGMENT_SIZE {
                        let segment: Vec<u8> = self.buf.drain(..CIPHER_SEGMENT_SIZE).collect();
                        out.extend_from_slice(&self.open_segment(&segment)?);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Flush the trailing (short) segment. Fails if the stream ended inside the header.
    pub fn finish(mut self, out: &mut Vec<u8>) -> anyhow::Result<()> {
        self.update(&[], out)?;
        ensure!(self.phase == Phase::Body, "crypt4gh stream ended inside the header");
        if !self.buf.is_empty() {
            let tail = std::mem::take(&mut self.buf);
            out.extend_from_slice(&self.open_segment(&tail)?);
        }
        Ok(())
    }

    fn open_packet(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        ensure!(packet.len() >= 4, "truncated header packet");
        if read_u32(packet, 0) != METHOD_X25519_CHACHA20_POLY1305 {
            // Addressed to a key scheme we do not hold.
            return Ok(());
        }

        let sealed = &packet[4..];
        ensure!(
            sealed.len() >= KEY_LEN + NONCE_LEN + MAC_LEN,
            "truncated header packet"
        );
        let mut writer_pk = [0u8; KEY_LEN];
        writer_pk.copy_from_slice(&sealed[..KEY_LEN]);
        let nonce = Nonce::from_slice(&sealed[KEY_LEN..KEY_LEN + NONCE_LEN]);

        let dh = self.secret.diffie_hellman(&PublicKey::from(writer_pk));
        let key = shared_key(dh.as_bytes(), &self.public, &writer_pk);
        let Ok(plain) = ChaCha20Poly1305::new(&key).decrypt(nonce, &sealed[KEY_LEN + NONCE_LEN..])
        else {
            // Sealed for another reader.
            return Ok(());
        };

        ensure!(plain.len() >= 4, "truncated header packet payload");
        match read_u32(&plain, 0) {
            PACKET_DATA_ENCRYPTION_PARAMETERS => {
                ensure!(
                    plain.len() >= 8 + KEY_LEN,
                    "truncated data encryption parameters"
                );
                let method = read_u32(&plain, 4);
                ensure!(
                    method == DATA_METHOD_CHACHA20_POLY1305,
                    "unsupported data encryption method {method}"
                );
                self.session_keys.push(ChaCha20Poly1305::new(Key::from_slice(
                    &plain[8..8 + KEY_LEN],
                )));
                Ok(())
            }
            PACKET_DATA_EDIT_LIST => bail!("crypt4gh edit lists are not supported"),
            other => bail!("unknown crypt4gh header packet type {other}"),
        }
    }

    fn open_segment(&self, segment: &[u8]) -> anyhow::Result<Vec<u8>> {
        ensure!(
            segment.len() >= NONCE_LEN + MAC_LEN,
            "truncated data segment ({} bytes)",
            segment.len()
        );
        let nonce = Nonce::from_slice(&segment[..NONCE_LEN]);
        self.session_keys
            .iter()
            .find_map(|cipher| cipher.decrypt(nonce, &segment[NONCE_LEN..]).ok())
            .ok_or_else(|| anyhow!("data segment could not be decrypted"))
    }
}

/// Writer side, only used to produce fixtures.
#[cfg(test)]
pub(crate) fn encrypt(plaintext: &[u8], reader_pk: &[u8; KEY_LEN]) -> Vec<u8> {
    use rand_core::RngCore;

    let writer_secret = StaticSecret::random_from_rng(OsRng);
    let writer_pk = PublicKey::from(&writer_secret).to_bytes();
    let dh = writer_secret.diffie_hellman(&PublicKey::from(*reader_pk));
    let header_cipher = ChaCha20Poly1305::new(&shared_key(dh.as_bytes(), reader_pk, &writer_pk));

    let mut session_key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut session_key);
    let mut params = Vec::new();
    params.extend_from_slice(&PACKET_DATA_ENCRYPTION_PARAMETERS.to_le_bytes());
    params.extend_from_slice(&DATA_METHOD_CHACHA20_POLY1305.to_le_bytes());
    params.extend_from_slice(&session_key);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = header_cipher
        .encrypt(Nonce::from_slice(&nonce), params.as_slice())
        .unwrap();

    let packet_len = 4 + 4 + KEY_LEN + NONCE_LEN + sealed.len();
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(packet_len as u32).to_le_bytes());
    out.extend_from_slice(&METHOD_X25519_CHACHA20_POLY1305.to_le_bytes());
    out.extend_from_slice(&writer_pk);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);

    let data_cipher = ChaCha20Poly1305::new(Key::from_slice(&session_key));
    for chunk in plaintext.chunks(SEGMENT_SIZE) {
        OsRng.fill_bytes(&mut nonce);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&data_cipher.encrypt(Nonce::from_slice(&nonce), chunk).unwrap());
    }
    out
}
