//! Destination dialing

use super::ForwardError;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `target` within `timeout`.
///
/// Nagle is disabled on the returned stream so small writes are relayed
/// without delay.
pub async fn dial(target: &str, timeout: Duration) -> Result<TcpStream, ForwardError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| ForwardError::DialTimeout {
            target: target.to_string(),
        })?
        .map_err(|source| ForwardError::Dial {
            target: target.to_string(),
            source,
        })?;

    stream.set_nodelay(true).ok();

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = dial(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
        stream.write_all(b"hello").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dial(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Dial { .. }));
    }
}
