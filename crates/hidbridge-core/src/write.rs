//! On-demand writes.
//!
//! Each write opens its own connection, claims the interface through the
//! shared arbiter, sends the whole frame to every bulk-out endpoint and then
//! releases and closes, whatever the per-endpoint results were.

use tracing::{instrument, warn};

use crate::bridge::BridgeContext;
use crate::connection::Connection;
use crate::error::BridgeError;
use crate::events::{BridgeEvent, BridgeObserver, LogLevel};
use crate::transport::{TransportError, UsbBackend};

/// Result of writing one frame to one endpoint.
#[derive(Debug)]
pub struct EndpointWrite {
    pub endpoint: u8,
    /// Bytes accepted by the device.
    pub outcome: Result<usize, BridgeError>,
}

/// Per-endpoint results of a single write.
#[derive(Debug)]
pub struct WriteReport {
    pub frame_len: usize,
    pub results: Vec<EndpointWrite>,
}

impl WriteReport {
    /// Every bulk-out endpoint accepted the full frame.
    pub fn all_succeeded(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| matches!(r.outcome, Ok(n) if n == self.frame_len))
    }

    pub fn failures(&self) -> impl Iterator<Item = &EndpointWrite> {
        self.results
            .iter()
            .filter(move |r| !matches!(r.outcome, Ok(n) if n == self.frame_len))
    }
}

#[instrument(level = "debug", skip_all, fields(len = data.len()))]
pub(crate) fn write_frame<B, O>(
    ctx: &BridgeContext<B, O>,
    data: &[u8],
) -> Result<WriteReport, BridgeError>
where
    B: UsbBackend,
    O: BridgeObserver + 'static,
{
    let result = send(ctx, data);
    if let Err(e) = &result {
        warn!(error = %e, "Write aborted");
        ctx.emit(BridgeEvent::log(
            LogLevel::Error,
            format!("Error while writing data: {}", e),
        ));
    }
    result
}

fn send<B, O>(ctx: &BridgeContext<B, O>, data: &[u8]) -> Result<WriteReport, BridgeError>
where
    B: UsbBackend,
    O: BridgeObserver + 'static,
{
    let bound = ctx.binding().ok_or(BridgeError::NotOpen)?;
    if !bound.authorized {
        return Err(BridgeError::PermissionDenied(bound.device.handle.clone()));
    }
    let endpoints = &bound.endpoints;
    if endpoints.bulk_out.is_empty() {
        return Err(BridgeError::NoEndpoints {
            direction: "OUT",
            interface: endpoints.interface,
        });
    }

    let timeout = ctx.config.write_timeout();
    let mut conn = Connection::open(&ctx.backend, &bound.device)?;
    let mut results = Vec::with_capacity(endpoints.bulk_out.len());
    {
        let mut claim = conn.claim(&ctx.arbiter, endpoints.interface, ctx.config.claim_timeout())?;
        for endpoint in &endpoints.bulk_out {
            let outcome = match claim.bulk_out(endpoint, data, timeout) {
                Ok(written) => {
                    ctx.emit(BridgeEvent::FrameWritten {
                        endpoint: endpoint.address,
                        written,
                        data: data.to_vec(),
                    });
                    Ok(written)
                }
                Err(e) => {
                    let err = match e {
                        TransportError::Timeout { timeout_ms } => BridgeError::WriteTimeout {
                            endpoint: endpoint.address,
                            timeout_ms,
                        },
                        other => other.into(),
                    };
                    ctx.emit(BridgeEvent::WriteFailed {
                        endpoint: endpoint.address,
                        message: err.to_string(),
                    });
                    Err(err)
                }
            };
            results.push(EndpointWrite {
                endpoint: endpoint.address,
                outcome,
            });
        }
    }
    conn.close();

    Ok(WriteReport {
        frame_len: data.len(),
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(frame_len: usize, outcomes: Vec<Result<usize, BridgeError>>) -> WriteReport {
        WriteReport {
            frame_len,
            results: outcomes
                .into_iter()
                .enumerate()
                .map(|(i, outcome)| EndpointWrite {
                    endpoint: i as u8 + 1,
                    outcome,
                })
                .collect(),
        }
    }

    #[test]
    fn test_all_succeeded_requires_full_frames() {
        assert!(report(5, vec![Ok(5), Ok(5)]).all_succeeded());

        let short = report(5, vec![Ok(5), Ok(3)]);
        assert!(!short.all_succeeded());
        assert_eq!(short.failures().map(|f| f.endpoint).collect::<Vec<_>>(), vec![2]);

        let timed_out = report(
            5,
            vec![Err(BridgeError::WriteTimeout {
                endpoint: 1,
                timeout_ms: 10,
            })],
        );
        assert!(!timed_out.all_succeeded());
    }

    #[test]
    fn test_empty_report_is_not_success() {
        assert!(!report(0, vec![]).all_succeeded());
    }
}
