//! Bidirectional byte relay between an inbound connection and a tunnel.
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    core::limiter::{Direction, TrafficBudget},
    metrics::record_relayed_bytes,
    ports::BoxedStream,
};

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to upstream
    pub input: u64,
    /// Upstream to client
    pub output: u64,
}

async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    budgets: &[TrafficBudget],
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let chunk = budgets
        .iter()
        .filter_map(|b| b.max_chunk(direction))
        .min()
        .unwrap_or(BUFFER_SIZE)
        .clamp(1, BUFFER_SIZE);
    let mut buf = vec![0u8; chunk];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Half-close so the far side sees EOF while the other direction drains
            let _ = writer.shutdown().await;
            break;
        }
        for budget in budgets {
            budget
                .consume(direction, n, cancel)
                .await
                .map_err(io::Error::other)?;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.flush().await?;
    Ok(total)
}

/// Copy in both directions until both sides reach EOF, either side fails or
/// `cancel` fires.
pub async fn relay(
    inbound: BoxedStream,
    outbound: BoxedStream,
    budgets: &[TrafficBudget],
    cancel: &CancellationToken,
) -> io::Result<RelayStats> {
    let (in_reader, in_writer) = tokio::io::split(inbound);
    let (out_reader, out_writer) = tokio::io::split(outbound);

    let copy = async {
        tokio::try_join!(
            pipe(in_reader, out_writer, Direction::Input, budgets, cancel),
            pipe(out_reader, in_writer, Direction::Output, budgets, cancel),
        )
    };

    let (input, output) = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "relay cancelled"));
        }
        res = copy => res?,
    };

    record_relayed_bytes("input", input);
    record_relayed_bytes("output", output);
    Ok(RelayStats { input, output })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::duplex;

    use super::*;
    use crate::{
        config::models::{LimitBy, MissingKeyPolicy, TrafficLimiterConfig},
        core::limiter::{LimitContext, TrafficLimiter},
    };

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (client, inbound) = duplex(1024);
        let (outbound, server) = duplex(1024);
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn({
            let cancel = cancel.clone();
            async move { relay(Box::new(inbound), Box::new(outbound), &[], &cancel).await }
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);

        client_w.write_all(b"ping").await.unwrap();
        client_w.shutdown().await.unwrap();
        let mut got = Vec::new();
        server_r.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        server_w.write_all(b"pong!").await.unwrap();
        server_w.shutdown().await.unwrap();
        let mut back = Vec::new();
        client_r.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"pong!");

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { input: 4, output: 5 });
    }

    #[tokio::test]
    async fn test_relay_cancel() {
        let (_client, inbound) = duplex(64);
        let (outbound, _server) = duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = relay(Box::new(inbound), Box::new(outbound), &[], &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_relay_with_budget_chunks() {
        let limiter = Arc::new(
            TrafficLimiter::new(&TrafficLimiterConfig {
                name: "tl".into(),
                by: LimitBy::Global,
                input: Some(4096),
                output: Some(4096),
                on_missing_key: MissingKeyPolicy::Allow,
            })
            .unwrap(),
        );
        let budget = limiter.budget(&LimitContext::default()).unwrap().unwrap();

        let (client, inbound) = duplex(8192);
        let (outbound, server) = duplex(8192);
        let cancel = CancellationToken::new();
        let relay_task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                relay(Box::new(inbound), Box::new(outbound), &[budget], &cancel).await
            }
        });

        let (_client_r, mut client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);
        client_w.write_all(&[7u8; 3000]).await.unwrap();
        client_w.shutdown().await.unwrap();
        server_w.shutdown().await.unwrap();

        let mut got = Vec::new();
        server_r.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), 3000);
        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.input, 3000);
        assert_eq!(stats.output, 0);
    }
}
