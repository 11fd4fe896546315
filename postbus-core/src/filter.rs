//! Ordered async transforms over outbound envelopes and inbound messages.

use crate::recv::ReceiveContext;
use postbus_protocol::{stamp, BodyCodec, Compression, Envelope, ProtocolError};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a filter to abort the current message's pipeline.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("injected fault: {0}")]
    Injected(String),
}

pub type FilterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FilterError>> + Send + 'a>>;

/// One async transform in a pipeline. A filter that wants to abort the
/// connection raises an error; it never swallows the message silently.
pub trait Filter<T>: Send + Sync {
    fn apply(&self, item: T) -> FilterFuture<'_, T>;
}

/// Applies filters strictly in list order.
///
/// An empty input short-circuits unchanged (already invalidated upstream);
/// the first filter error aborts the pipeline and later filters never run.
pub async fn apply_filters<T>(
    filters: &[Box<dyn Filter<T>>],
    item: Option<T>,
) -> Result<Option<T>, FilterError> {
    let mut current = match item {
        Some(value) => value,
        None => return Ok(None),
    };
    for filter in filters {
        current = filter.apply(current).await?;
    }
    Ok(Some(current))
}

/// Adapts a closure into a [`Filter`].
pub fn filter_fn<T, F, Fut>(f: F) -> FnFilter<F>
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FilterError>> + Send,
{
    FnFilter(f)
}

pub struct FnFilter<F>(F);

impl<T, F, Fut> Filter<T> for FnFilter<F>
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FilterError>> + Send + 'static,
{
    fn apply(&self, item: T) -> FilterFuture<'_, T> {
        Box::pin((self.0)(item))
    }
}

/// Outgoing filter: compresses envelope bodies above a size threshold.
///
/// Applies only when the current compression is `none`; sets the codec's
/// flag and restamps checksum and size.
pub struct CompressionFilter<C> {
    codec: C,
    min_compression_size: usize,
}

impl<C: BodyCodec> CompressionFilter<C> {
    pub fn new(codec: C, min_compression_size: usize) -> Self {
        Self {
            codec,
            min_compression_size,
        }
    }
}

impl<C: BodyCodec> Filter<Envelope> for CompressionFilter<C> {
    fn apply(&self, mut envelope: Envelope) -> FilterFuture<'_, Envelope> {
        Box::pin(async move {
            if envelope.letter.header.compression != Compression::None {
                return Ok(envelope);
            }
            if envelope.letter.body.len() <= self.min_compression_size {
                return Ok(envelope);
            }
            let compressed = self.codec.compress(&envelope.letter.body)?;
            envelope.letter.body = compressed;
            envelope.letter.header.compression = self.codec.kind();
            stamp(&mut envelope.letter.header, &envelope.letter.body);
            Ok(envelope)
        })
    }
}

/// Incoming filter: reverses the matching compression flag.
///
/// Passes anything else through unchanged; a codec failure is fatal for the
/// connection, never a silent fallback to the compressed bytes.
pub struct DecompressionFilter<C> {
    codec: C,
}

impl<C: BodyCodec> DecompressionFilter<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }
}

impl<C: BodyCodec> Filter<ReceiveContext> for DecompressionFilter<C> {
    fn apply(&self, mut ctx: ReceiveContext) -> FilterFuture<'_, ReceiveContext> {
        Box::pin(async move {
            if ctx.header.compression != self.codec.kind() {
                return Ok(ctx);
            }
            let restored = self.codec.uncompress(&ctx.body)?;
            ctx.body = restored;
            ctx.header.compression = Compression::None;
            stamp(&mut ctx.header, &ctx.body);
            Ok(ctx)
        })
    }
}
