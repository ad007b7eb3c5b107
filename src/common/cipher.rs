//! Shadowsocks-style stream ciphers.
//!
//! Each direction starts with a random IV written in clear, followed by the
//! keystream-encrypted payload. The key is derived from a password with
//! OpenSSL's `EVP_BytesToKey` (MD5, one iteration).

use std::{
    fmt::Debug,
    io,
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
};

use aes::{Aes128, Aes192, Aes256};
use bytes::{Buf, BytesMut};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::ChaCha20;
use ctr::{
    Ctr128BE,
    cipher::{KeyIvInit, StreamCipher},
};
use easy_error::{Error, bail, err_msg};
use futures::ready;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const MAX_IV_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Chacha20Ietf,
}

impl CipherKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128Cfb => "aes-128-cfb",
            Self::Aes192Cfb => "aes-192-cfb",
            Self::Aes256Cfb => "aes-256-cfb",
            Self::Aes128Ctr => "aes-128-ctr",
            Self::Aes192Ctr => "aes-192-ctr",
            Self::Aes256Ctr => "aes-256-ctr",
            Self::Chacha20Ietf => "chacha20-ietf",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Cfb | Self::Aes128Ctr => 16,
            Self::Aes192Cfb | Self::Aes192Ctr => 24,
            Self::Aes256Cfb | Self::Aes256Ctr | Self::Chacha20Ietf => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            Self::Chacha20Ietf => 12,
            _ => 16,
        }
    }
}

impl FromStr for CipherKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-cfb" => Ok(Self::Aes128Cfb),
            "aes-192-cfb" => Ok(Self::Aes192Cfb),
            "aes-256-cfb" => Ok(Self::Aes256Cfb),
            "aes-128-ctr" => Ok(Self::Aes128Ctr),
            "aes-192-ctr" => Ok(Self::Aes192Ctr),
            "aes-256-ctr" => Ok(Self::Aes256Ctr),
            "chacha20-ietf" => Ok(Self::Chacha20Ietf),
            _ => bail!("unknown cipher method: {}", s),
        }
    }
}

/// Key material for one cipher method. Cheap to clone and shared by all
/// connections of a handler or connector.
#[derive(Clone)]
pub struct Cipher {
    kind: CipherKind,
    key: Arc<[u8]>,
}

impl Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("kind", &self.kind).finish()
    }
}

impl Cipher {
    pub fn new(method: &str, password: &str) -> Result<Self, Error> {
        let kind: CipherKind = method.parse()?;
        if password.is_empty() {
            bail!("empty password for cipher {}", kind.name());
        }
        let key = evp_bytes_to_key(password.as_bytes(), kind.key_len());
        Ok(Self {
            kind,
            key: key.into(),
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    fn keystream(&self, iv: &[u8], encrypt: bool) -> Result<Keystream, Error> {
        let key = &self.key[..];
        let invalid = |_| err_msg("invalid key or iv length");
        let ks = match (self.kind, encrypt) {
            (CipherKind::Aes128Cfb, true) => {
                Keystream::Aes128CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Aes128Cfb, false) => {
                Keystream::Aes128CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Aes192Cfb, true) => {
                Keystream::Aes192CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Aes192Cfb, false) => {
                Keystream::Aes192CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Aes256Cfb, true) => {
                Keystream::Aes256CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Aes256Cfb, false) => {
                Keystream::Aes256CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Aes128Ctr, _) => {
                Keystream::Aes128Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Aes192Ctr, _) => {
                Keystream::Aes192Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Aes256Ctr, _) => {
                Keystream::Aes256Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherKind::Chacha20Ietf, _) => {
                Keystream::Chacha20(ChaCha20::new_from_slices(key, iv).map_err(invalid)?)
            }
        };
        Ok(ks)
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5 and no salt.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut data = prev;
        data.extend_from_slice(password);
        let digest = md5::compute(&data);
        key.extend_from_slice(&digest.0);
        prev = digest.0.to_vec();
    }
    key.truncate(key_len);
    key
}

enum Keystream {
    Aes128CfbEnc(BufEncryptor<Aes128>),
    Aes128CfbDec(BufDecryptor<Aes128>),
    Aes192CfbEnc(BufEncryptor<Aes192>),
    Aes192CfbDec(BufDecryptor<Aes192>),
    Aes256CfbEnc(BufEncryptor<Aes256>),
    Aes256CfbDec(BufDecryptor<Aes256>),
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
    Chacha20(ChaCha20),
}

impl Keystream {
    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes128CfbEnc(c) => c.encrypt(data),
            Self::Aes128CfbDec(c) => c.decrypt(data),
            Self::Aes192CfbEnc(c) => c.encrypt(data),
            Self::Aes192CfbDec(c) => c.decrypt(data),
            Self::Aes256CfbEnc(c) => c.encrypt(data),
            Self::Aes256CfbDec(c) => c.decrypt(data),
            Self::Aes128Ctr(c) => c.apply_keystream(data),
            Self::Aes192Ctr(c) => c.apply_keystream(data),
            Self::Aes256Ctr(c) => c.apply_keystream(data),
            Self::Chacha20(c) => c.apply_keystream(data),
        }
    }
}

fn to_io_error(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Transparently encrypts writes and decrypts reads over `inner`.
pub struct CipherStream<S> {
    inner: S,
    cipher: Cipher,
    iv: [u8; MAX_IV_LEN],
    iv_filled: usize,
    decryptor: Option<Keystream>,
    encryptor: Option<Keystream>,
    pending: BytesMut,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, cipher: Cipher) -> Self {
        Self {
            inner,
            cipher,
            iv: [0u8; MAX_IV_LEN],
            iv_filled: 0,
            decryptor: None,
            encryptor: None,
            pending: BytesMut::new(),
        }
    }

    /// Returns the raw stream. Ciphertext not yet written is discarded.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> CipherStream<S> {
    /// Reads the peer's IV. Ready(Ok(false)) means the peer closed before
    /// sending anything.
    fn poll_read_iv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        let iv_len = self.cipher.kind.iv_len();
        while self.iv_filled < iv_len {
            let mut rb = ReadBuf::new(&mut self.iv[self.iv_filled..iv_len]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
            let n = rb.filled().len();
            if n == 0 {
                if self.iv_filled == 0 {
                    return Poll::Ready(Ok(false));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside cipher iv",
                )));
            }
            self.iv_filled += n;
        }
        if self.decryptor.is_none() {
            let ks = self
                .cipher
                .keystream(&self.iv[..iv_len], false)
                .map_err(to_io_error)?;
            self.decryptor = Some(ks);
        }
        Poll::Ready(Ok(true))
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !ready!(this.poll_read_iv(cx))? {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(dec) = this.decryptor.as_mut() {
            dec.apply(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.encryptor.is_none() {
            let mut iv = [0u8; MAX_IV_LEN];
            let iv = &mut iv[..this.cipher.kind.iv_len()];
            rand::rng().fill_bytes(iv);
            let ks = this.cipher.keystream(iv, true).map_err(to_io_error)?;
            this.pending.extend_from_slice(iv);
            this.encryptor = Some(ks);
        }
        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        if let Some(enc) = this.encryptor.as_mut() {
            enc.apply(&mut this.pending[start..]);
        }
        // the data is accepted; pushing it out now is best effort
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    const KINDS: [&str; 7] = [
        "aes-128-cfb",
        "aes-192-cfb",
        "aes-256-cfb",
        "aes-128-ctr",
        "aes-192-ctr",
        "aes-256-ctr",
        "chacha20-ietf",
    ];

    #[test]
    fn key_derivation_matches_openssl() {
        // md5("password")
        let key = evp_bytes_to_key(b"password", 16);
        assert_eq!(
            key,
            [
                0x5f, 0x4d, 0xcc, 0x3b, 0x5a, 0xa7, 0x65, 0xd6, 0x1d, 0x83, 0x27, 0xde, 0xb8,
                0x82, 0xcf, 0x99
            ]
        );
        let long = evp_bytes_to_key(b"password", 32);
        assert_eq!(&long[..16], &key[..]);
        assert_eq!(long.len(), 32);
    }

    #[test]
    fn rejects_unknown_method_and_empty_password() {
        assert!(Cipher::new("rc4-md5", "x").is_err());
        assert!(Cipher::new("aes-256-cfb", "").is_err());
        assert_eq!(
            Cipher::new("AES-256-CFB", "x").unwrap().kind(),
            CipherKind::Aes256Cfb
        );
    }

    #[test]
    fn debug_hides_key() {
        let c = Cipher::new("aes-128-ctr", "secret").unwrap();
        assert_eq!(format!("{:?}", c), "Cipher { kind: Aes128Ctr }");
    }

    #[test(tokio::test)]
    async fn peers_exchange_plaintext() {
        for method in KINDS {
            let cipher = Cipher::new(method, "hunter2").unwrap();
            let (a, b) = duplex(1024);
            let mut client = CipherStream::new(a, cipher.clone());
            let mut server = CipherStream::new(b, cipher);

            client.write_all(b"hello ").await.unwrap();
            client.write_all(b"world").await.unwrap();
            client.flush().await.unwrap();
            let mut buf = [0u8; 11];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello world", "{}", method);

            server.write_all(b"pong").await.unwrap();
            server.flush().await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong", "{}", method);
        }
    }

    #[test(tokio::test)]
    async fn wire_carries_iv_then_ciphertext() {
        let cipher = Cipher::new("aes-256-cfb", "hunter2").unwrap();
        let (a, mut raw) = duplex(1024);
        let mut client = CipherStream::new(a, cipher);
        client.write_all(b"plaintext!").await.unwrap();
        client.shutdown().await.unwrap();

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), 16 + 10);
        assert_ne!(&wire[16..], b"plaintext!");
    }

    #[test(tokio::test)]
    async fn small_pipe_does_not_lose_data() {
        let cipher = Cipher::new("chacha20-ietf", "hunter2").unwrap();
        let (a, b) = duplex(7);
        let mut client = CipherStream::new(a, cipher.clone());
        let mut server = CipherStream::new(b, cipher);
        let payload: Vec<u8> = (0..4096u32).map(|x| x as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expected);
    }

    #[test(tokio::test)]
    async fn eof_before_iv_is_clean() {
        let cipher = Cipher::new("aes-128-ctr", "x").unwrap();
        let (a, b) = duplex(64);
        drop(a);
        let mut server = CipherStream::new(b, cipher);
        let mut buf = Vec::new();
        assert_eq!(server.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[test(tokio::test)]
    async fn eof_inside_iv_is_an_error() {
        let cipher = Cipher::new("aes-128-ctr", "x").unwrap();
        let (mut a, b) = duplex(64);
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        let mut server = CipherStream::new(b, cipher);
        let mut buf = Vec::new();
        assert!(server.read_to_end(&mut buf).await.is_err());
    }
}
