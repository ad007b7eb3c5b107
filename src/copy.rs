use std::sync::atomic::{AtomicU64, Ordering};

use easy_error::{Error, ResultExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a relay, per direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Traffic {
    /// client to server
    pub sent: u64,
    /// server to client
    pub received: u64,
}

async fn copy_stream<R, W>(
    r: &mut R,
    rn: &str,
    w: &mut W,
    wn: &str,
    cnt: &AtomicU64,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let len = r
            .read(&mut buf)
            .await
            .with_context(|| format!("read from {}", rn))?;
        if len == 0 {
            break;
        }
        w.write_all(&buf[..len])
            .await
            .with_context(|| format!("write to {}", wn))?;
        w.flush()
            .await
            .with_context(|| format!("flush {} buffer", wn))?;
        cnt.fetch_add(len as u64, Ordering::Relaxed);
    }
    trace!("{} closed, shutting down {}", rn, wn);
    w.shutdown()
        .await
        .with_context(|| format!("shutdown {}", wn))
}

/// Copies bytes both ways between `client` and `server` until one side
/// reaches end of stream or fails. Everything read before that point is
/// delivered. Both streams are dropped, and therefore closed, on return.
pub async fn relay<A, B>(client: A, server: B) -> Result<Traffic, Error>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut cread, mut cwrite) = tokio::io::split(client);
    let (mut sread, mut swrite) = tokio::io::split(server);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let ret = {
        let copy_c2s = copy_stream(&mut cread, "client", &mut swrite, "server", &sent);
        let copy_s2c = copy_stream(&mut sread, "server", &mut cwrite, "client", &received);
        tokio::select! {
            ret = copy_c2s => ret,
            ret = copy_s2c => ret,
        }
    };

    ret.map(|_| Traffic {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
    })
}
