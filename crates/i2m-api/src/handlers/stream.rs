//! Server-Sent Events stream of task progress.
//!
//! Every stream starts with a `snapshot` event. After that only events with a
//! sequence number greater than the last one sent are forwarded, whether they
//! come from pub/sub or from the periodic poll of the progress store. The
//! stream ends after a terminal event, or with a `timeout` event once the
//! maximum duration is reached.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use i2m_models::StreamEvent;

use crate::auth::{authorize_job, ApiCaller, SessionHeader};
use crate::error::{ApiError, ApiResult};
use crate::handlers::status::batch_or_fallback;
use crate::metrics;
use crate::security::parse_job_id;
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Decides which events a stream forwards.
#[derive(Debug, Default)]
pub struct EventFilter {
    last_seq: Option<u64>,
    finished: bool,
}

impl EventFilter {
    /// Whether `event` should be sent. Accepting an event advances the
    /// sequence watermark; accepting a terminal event closes the filter.
    pub fn accept(&mut self, event: &StreamEvent) -> bool {
        if self.finished {
            return false;
        }

        let is_newer = match self.last_seq {
            None => true,
            Some(last) => event.seq() > last,
        };
        if !is_newer {
            return false;
        }

        self.last_seq = Some(event.seq());
        if event.is_terminal() {
            self.finished = true;
        }
        true
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.unwrap_or(0)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Keeps the active-stream gauge in step with open streams.
struct SseConnection;

impl SseConnection {
    fn open() -> Self {
        metrics::record_sse_opened();
        SseConnection
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        metrics::record_sse_closed();
    }
}

fn to_sse_event(event: &StreamEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => {
            metrics::record_sse_event(event.event_name());
            Some(
                Event::default()
                    .event(event.event_name())
                    .id(event.seq().to_string())
                    .data(json),
            )
        }
        Err(e) => {
            warn!("SSE: Failed to serialize {} event: {}", event.event_name(), e);
            None
        }
    }
}

/// GET /api/v1/status/tasks/:job_id/stream
pub async fn stream_task(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    caller: ApiCaller,
    session: SessionHeader,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let job_id = parse_job_id(&job_id)?;
    authorize_job(&state, &caller, &session, &job_id).await?;

    let job = state
        .jobs
        .get_job(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Task not found"))?;

    let slot_key = match (&session.0, &connect_info) {
        (Some(session_id), _) => format!("session:{}", session_id),
        (None, Some(ConnectInfo(addr))) => format!("ip:{}", addr.ip()),
        (None, None) => "anonymous".to_string(),
    };
    let slot = state.streams.try_acquire(&slot_key).ok_or_else(|| {
        warn!(job_id = %job_id, key = %slot_key, "Too many concurrent streams");
        ApiError::RateLimited
    })?;

    // Subscribe before reading the snapshot so nothing falls in between
    let mut events = state.progress.subscribe(&job_id).await?;
    let snapshot = state.progress.snapshot(&job_id).await?;
    let initial = StreamEvent::snapshot(batch_or_fallback(&job, snapshot));

    let progress = state.progress.clone();
    let poll_interval = state.config.sse_poll_interval;
    let max_duration = state.config.sse_max_duration;

    info!(job_id = %job_id, "SSE stream opened");

    let stream = async_stream::stream! {
        let _slot = slot;
        let _connection = SseConnection::open();
        let mut filter = EventFilter::default();

        if filter.accept(&initial) {
            if let Some(event) = to_sse_event(&initial) {
                yield Ok(event);
            }
        }

        let deadline = tokio::time::sleep(max_duration);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(poll_interval);
        poll.tick().await;
        let mut subscribed = true;

        while !filter.is_finished() {
            tokio::select! {
                _ = &mut deadline => {
                    let timeout = StreamEvent::Timeout {
                        seq: filter.last_seq(),
                        job_id: job_id.clone(),
                    };
                    info!(job_id = %job_id, "SSE stream reached max duration");
                    if let Some(event) = to_sse_event(&timeout) {
                        yield Ok(event);
                    }
                    break;
                }

                message = events.next(), if subscribed => {
                    match message {
                        Some(message) => {
                            if filter.accept(&message.event) {
                                if let Some(event) = to_sse_event(&message.event) {
                                    yield Ok(event);
                                }
                            }
                        }
                        None => {
                            warn!(job_id = %job_id, "SSE: Progress subscription closed, polling only");
                            subscribed = false;
                        }
                    }
                }

                _ = poll.tick() => {
                    match progress.snapshot(&job_id).await {
                        Ok(Some(batch)) => {
                            let event = StreamEvent::snapshot(batch);
                            if filter.accept(&event) {
                                debug!(job_id = %job_id, seq = event.seq(), "SSE: Poll caught up missed events");
                                if let Some(event) = to_sse_event(&event) {
                                    yield Ok(event);
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(job_id = %job_id, "SSE: Progress poll failed: {}", e),
                    }
                }
            }
        }

        info!(job_id = %job_id, last_seq = filter.last_seq(), "SSE stream closed");
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use i2m_models::{BatchProgress, FileId, FileProgress, FileStatus, JobId, JobStatus};

    fn snapshot(status: JobStatus, seq: u64) -> StreamEvent {
        StreamEvent::snapshot(BatchProgress::aggregate(
            JobId::from_string("job-12345678"),
            status,
            1,
            vec![],
            seq,
        ))
    }

    fn file_event(seq: u64) -> StreamEvent {
        StreamEvent::FileProgress {
            seq,
            job_id: JobId::from_string("job-12345678"),
            file: FileProgress::pending(FileId::new(), "a.png").with_status(FileStatus::Processing, 40),
            overall_progress: 40,
        }
    }

    #[test]
    fn test_first_snapshot_always_sent() {
        let mut filter = EventFilter::default();
        assert!(filter.accept(&snapshot(JobStatus::Pending, 0)));
        assert_eq!(filter.last_seq(), 0);
    }

    #[test]
    fn test_never_resends_old_sequences() {
        let mut filter = EventFilter::default();
        assert!(filter.accept(&snapshot(JobStatus::Processing, 3)));
        assert!(!filter.accept(&file_event(2)));
        assert!(!filter.accept(&file_event(3)));
        assert!(filter.accept(&file_event(4)));
        assert!(!filter.accept(&snapshot(JobStatus::Processing, 4)));
        assert!(filter.accept(&snapshot(JobStatus::Processing, 6)));
        assert!(!filter.accept(&file_event(5)));
        assert_eq!(filter.last_seq(), 6);
    }

    #[test]
    fn test_stops_after_terminal_event() {
        let mut filter = EventFilter::default();
        assert!(filter.accept(&snapshot(JobStatus::Processing, 1)));

        let done = StreamEvent::task_completed(JobId::from_string("job-12345678"), 1, 1, 0)
            .with_seq(2);
        assert!(filter.accept(&done));
        assert!(filter.is_finished());
        assert!(!filter.accept(&file_event(3)));
    }

    #[test]
    fn test_terminal_snapshot_finishes_immediately() {
        let mut filter = EventFilter::default();
        assert!(filter.accept(&snapshot(JobStatus::Completed, 5)));
        assert!(filter.is_finished());
    }
}
