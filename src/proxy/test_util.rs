//! Loopback fixtures shared by the backend and server tests

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::http::HttpRequest;
use crate::models::Event;

pub const HELLO_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

/// Parse `wire` into an event for session `hash`
pub async fn event(hash: u64, wire: &[u8]) -> Event {
    let mut reader = BufReader::new(wire);
    let request = HttpRequest::read_from(&mut reader).await.unwrap().unwrap();
    Event::http_request(hash, request)
}

/// Read bytes until the end of a header section, `None` on EOF
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

/// Origin answering every request head with `response`, keeping connections alive.
///
/// Returns the listen address, the number of accepted connections and every request head
/// received, in order.
pub async fn spawn_origin(
    response: &'static [u8],
) -> (SocketAddr, Arc<AtomicUsize>, Arc<parking_lot::Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let heads = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let counter = accepted.clone();
    let seen = heads.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let seen = seen.clone();
            tokio::spawn(async move {
                while let Some(head) = read_head(&mut stream).await {
                    seen.lock().push(head);
                    if stream.write_all(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, accepted, heads)
}

/// Echo server: every accepted connection gets its first read written back, then closed
pub async fn spawn_echo_once() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if let Ok(n) = stream.read(&mut buf).await {
                    let _ = stream.write_all(&buf[..n]).await;
                }
            });
        }
    });
    addr
}

/// An address nothing listens on
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Server side TLS with a self-signed P-256 certificate for `localhost`
pub fn tls_acceptor() -> TlsAcceptor {
    let cert = CertificateDer::from(include_bytes!("testdata/localhost.cert.der").to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        include_bytes!("testdata/localhost.key.der").to_vec(),
    ));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// SOCKS5 server relaying every CONNECT to its target.
///
/// With `credentials` set only username/password auth is offered. Returns the listen
/// address and every `host:port` a client asked for.
pub async fn spawn_socks5(
    credentials: Option<(&'static str, &'static str)>,
) -> (SocketAddr, Arc<parking_lot::Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let targets = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let seen = targets.clone();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let Ok(target) = socks5_accept(&mut client, credentials).await else {
                    return;
                };
                seen.lock().push(target.clone());
                if let Ok(mut upstream) = TcpStream::connect(&target).await {
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                }
            });
        }
    });

    (addr, targets)
}

async fn socks5_accept(
    client: &mut TcpStream,
    credentials: Option<(&str, &str)>,
) -> io::Result<String> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;

    if let Some((user, pass)) = credentials {
        client.write_all(&[0x05, 0x02]).await?;
        let name = read_prefixed(client, 1).await?;
        let password = read_prefixed(client, 0).await?;
        let accepted = name == user.as_bytes() && password == pass.as_bytes();
        client.write_all(&[0x01, u8::from(!accepted)]).await?;
        if !accepted {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "bad credentials"));
        }
    } else {
        client.write_all(&[0x05, 0x00]).await?;
    }

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => String::from_utf8_lossy(&read_prefixed(client, 0).await?).into_owned(),
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "address type")),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;

    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
}

/// Skip `skip` bytes, then read a one-byte length and that many bytes
async fn read_prefixed(client: &mut TcpStream, skip: usize) -> io::Result<Vec<u8>> {
    let mut prefix = vec![0u8; skip + 1];
    client.read_exact(&mut prefix).await?;
    let mut value = vec![0u8; prefix[skip] as usize];
    client.read_exact(&mut value).await?;
    Ok(value)
}
