//! CONNECT tunnel relay
//!
//! Handles bidirectional data transfer between client and upstream once a tunnel is up.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, instrument};

/// Size of each pump's read buffer
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Handles CONNECT tunnel relaying
pub struct TunnelHandler;

impl TunnelHandler {
    /// Pump bytes both ways until both directions are done.
    ///
    /// End of stream stops only that direction and closes nothing. A read or write error
    /// tears both directions down and shuts both endpoints. Returns
    /// `(client_to_remote, remote_to_client)` byte counts.
    #[instrument(skip_all)]
    pub async fn relay<L, R>(local: L, remote: R) -> (u64, u64)
    where
        L: AsyncRead + AsyncWrite + Unpin + Send,
        R: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut local_read, mut local_write) = tokio::io::split(local);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);
        let (teardown, torn_down) = watch::channel(false);

        let (sent, received) = tokio::join!(
            pump(
                "client->remote",
                &mut local_read,
                &mut remote_write,
                &teardown,
                torn_down.clone(),
            ),
            pump(
                "remote->client",
                &mut remote_read,
                &mut local_write,
                &teardown,
                torn_down,
            ),
        );

        if *teardown.borrow() {
            let _ = remote_write.shutdown().await;
            let _ = local_write.shutdown().await;
        }

        debug!(
            bytes_sent = sent,
            bytes_received = received,
            "Tunnel closed"
        );
        (sent, received)
    }
}

async fn pump<R, W>(
    direction: &'static str,
    reader: &mut R,
    writer: &mut W,
    teardown: &watch::Sender<bool>,
    mut torn_down: watch::Receiver<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{} reached end of stream", direction);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read failed: {}", direction, e);
                    let _ = teardown.send(true);
                    break;
                }
            },
            _ = torn_down.wait_for(|down| *down) => break,
        };

        let written = tokio::select! {
            written = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => written,
            _ = torn_down.wait_for(|down| *down) => break,
        };
        if let Err(e) = written {
            debug!("{} write failed: {}", direction, e);
            let _ = teardown.send(true);
            break;
        }
        total += n as u64;
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    use tokio::io::duplex;
    use tokio::time::{sleep, timeout, Duration};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn teardown_waits_for_the_slower_direction() {
        let (mut client, proxy_local) = duplex(1024);
        let (proxy_remote, mut server) = duplex(1024);
        let relay = tokio::spawn(TunnelHandler::relay(proxy_local, proxy_remote));

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // client->remote is done, remote->client is still open
        sleep(Duration::from_millis(50)).await;
        assert!(!relay.is_finished());

        server.write_all(b"late").await.unwrap();
        let mut late = [0u8; 4];
        client.read_exact(&mut late).await.unwrap();
        assert_eq!(&late, b"late");

        drop(server);
        let (sent, received) = timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, 5);
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn read_error_tears_down_both_directions() {
        let (mut client, proxy_local) = duplex(1024);
        let remote = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let (sent, received) = timeout(
            Duration::from_secs(1),
            TunnelHandler::relay(proxy_local, remote),
        )
        .await
        .unwrap();
        assert_eq!((sent, received), (0, 0));

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
