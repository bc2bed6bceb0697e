//! Byte-counting stream wrapper.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::network::{NetworkMetrics, TrafficObserver};

/// A stream reporting every read and written byte to its observers.
pub struct MeteredStream<S> {
    inner: S,
    observers: Vec<Arc<dyn TrafficObserver>>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, observers: Vec<Arc<dyn TrafficObserver>>) -> Self {
        Self { inner, observers }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn report(&self, delta: NetworkMetrics) {
        for observer in &self.observers {
            observer.notify_network_traffic_metrics(delta);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                this.report(NetworkMetrics::inbound(read as u64));
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = poll {
            if written > 0 {
                this.report(NetworkMetrics::outbound(written as u64));
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_dynamo::Atomic;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Totals(Atomic<NetworkMetrics>);

    impl TrafficObserver for Totals {
        fn notify_network_traffic_metrics(&self, delta: NetworkMetrics) {
            self.0.with_lock(|total| *total += delta);
        }
    }

    #[tokio::test]
    async fn metered_stream_counts_both_directions() {
        let (client, server) = tokio::io::duplex(64);
        let totals = Arc::new(Totals::default());
        let mut metered = MeteredStream::new(server, vec![totals.clone() as Arc<dyn TrafficObserver>]);
        let mut client = client;

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        metered.read_exact(&mut buf).await.unwrap();
        metered.write_all(b"hi").await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hi");
        assert_eq!(
            totals.0.get(),
            NetworkMetrics {
                bytes_in: 5,
                bytes_out: 2
            }
        );
    }
}
