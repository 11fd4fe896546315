//! Fault injection for exercising timeout and error propagation.
//!
//! Never wired into production pipelines; tests register it to validate
//! that injected delays and errors surface the way the runtime promises.

use crate::filter::{Filter, FilterError, FilterFuture};
use crate::recv::ReceiveContext;
use std::str::FromStr;
use std::time::Duration;

/// Reserved dynamic-header key carrying the fault directive.
pub const FAULT_HEADER: &str = "fault";

/// What the filter should do to the message it sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultDirective {
    /// Terminate the process immediately.
    Exit,
    /// Raise an injected error, aborting the message pipeline.
    Error,
    /// Sleep before passing the message through.
    Sleep(Duration),
}

impl FromStr for FaultDirective {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exit" => Ok(FaultDirective::Exit),
            "error" => Ok(FaultDirective::Error),
            other => match other.strip_prefix("sleep:") {
                Some(millis) => millis
                    .parse::<u64>()
                    .map(|ms| FaultDirective::Sleep(Duration::from_millis(ms)))
                    .map_err(|_| format!("bad sleep duration in fault directive: {:?}", other)),
                None => Err(format!("unknown fault directive: {:?}", other)),
            },
        }
    }
}

/// Incoming filter that obeys the `fault` dynamic header, if present.
#[derive(Debug, Default)]
pub struct FaultInjectionFilter;

impl Filter<ReceiveContext> for FaultInjectionFilter {
    fn apply(&self, ctx: ReceiveContext) -> FilterFuture<'_, ReceiveContext> {
        Box::pin(async move {
            if !ctx.header.flags.has_dynamic_headers() {
                return Ok(ctx);
            }
            let directive = ctx
                .dynamic_headers()?
                .into_iter()
                .find(|(key, _)| key == FAULT_HEADER)
                .map(|(_, value)| {
                    FaultDirective::from_str(&value).map_err(FilterError::Injected)
                })
                .transpose()?;

            match directive {
                None => Ok(ctx),
                Some(FaultDirective::Exit) => {
                    tracing::error!("fault directive: terminating process");
                    std::process::exit(1);
                }
                Some(FaultDirective::Error) => {
                    Err(FilterError::Injected("fault directive".to_string()))
                }
                Some(FaultDirective::Sleep(duration)) => {
                    tracing::debug!("fault directive: sleeping {}ms", duration.as_millis());
                    tokio::time::sleep(duration).await;
                    Ok(ctx)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::apply_filters;
    use bytes::Bytes;
    use postbus_protocol::Envelope;
    use std::net::SocketAddr;
    use std::time::Instant;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn ctx_with_fault(value: &str) -> ReceiveContext {
        let mut envelope = Envelope::new(Bytes::from_static(b"payload"));
        envelope.add_dynamic_header(FAULT_HEADER, value);
        envelope.seal();
        ReceiveContext::new(test_addr(), envelope.letter.header, envelope.letter.body)
    }

    #[test]
    fn test_directive_parsing() {
        assert_eq!(FaultDirective::from_str("exit"), Ok(FaultDirective::Exit));
        assert_eq!(FaultDirective::from_str("error"), Ok(FaultDirective::Error));
        assert_eq!(
            FaultDirective::from_str("sleep:250"),
            Ok(FaultDirective::Sleep(Duration::from_millis(250)))
        );
        assert!(FaultDirective::from_str("sleep:soon").is_err());
        assert!(FaultDirective::from_str("reboot").is_err());
    }

    #[tokio::test]
    async fn test_error_directive_aborts_pipeline() {
        let filters: Vec<Box<dyn Filter<ReceiveContext>>> =
            vec![Box::new(FaultInjectionFilter)];
        let result = apply_filters(&filters, Some(ctx_with_fault("error"))).await;
        assert!(matches!(result, Err(FilterError::Injected(_))));
    }

    #[tokio::test]
    async fn test_sleep_directive_delays_message() {
        let filters: Vec<Box<dyn Filter<ReceiveContext>>> =
            vec![Box::new(FaultInjectionFilter)];
        let start = Instant::now();
        let out = apply_filters(&filters, Some(ctx_with_fault("sleep:50")))
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(&out.payload().unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn test_message_without_directive_passes_through() {
        let envelope = Envelope::new(Bytes::from_static(b"plain"));
        let ctx = ReceiveContext::new(test_addr(), envelope.letter.header, envelope.letter.body);
        let filters: Vec<Box<dyn Filter<ReceiveContext>>> =
            vec![Box::new(FaultInjectionFilter)];
        let out = apply_filters(&filters, Some(ctx)).await.unwrap().unwrap();
        assert_eq!(&out.body[..], b"plain");
    }
}
