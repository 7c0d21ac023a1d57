//! One producer and its consumers, pumped until the producer ends.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::tunnel::chunk::{ChunkCodec, Framed};
use crate::tunnel::fill::{BackgroundFillPolicy, FillProgress};
use crate::tunnel::graph::TunnelSettings;
use crate::tunnel::{
    BodyLength, ConsumerId, ConsumerOutcome, EndpointStatus, FinishAction, ProducerId,
    ProducerOutcome,
};
use crate::vc::{ReadSide, VcHandle, VcKind, WriteSide};

pub(crate) struct PumpSink {
    pub consumer: ConsumerId,
    pub vc: VcHandle,
    pub kind: VcKind,
    pub side: Option<WriteSide>,
    pub finish: FinishAction,
    pub bytes_written: u64,
    pub wire_bytes: u64,
    pub status: EndpointStatus,
    pub outcome: Option<ConsumerOutcome>,
}

impl PumpSink {
    pub fn new(
        consumer: ConsumerId,
        vc: VcHandle,
        kind: VcKind,
        side: WriteSide,
        finish: FinishAction,
    ) -> Self {
        Self {
            consumer,
            vc,
            kind,
            side: Some(side),
            finish,
            bytes_written: 0,
            wire_bytes: 0,
            status: EndpointStatus::Alive,
            outcome: None,
        }
    }

    fn alive(&self) -> bool {
        self.status == EndpointStatus::Alive
    }

    /// Cache writers are fed the de-framed body and may be lost without
    /// stopping the producer.
    fn auxiliary(&self) -> bool {
        self.kind == VcKind::CacheWrite
    }

    fn fail(&mut self, outcome: ConsumerOutcome) {
        self.status = EndpointStatus::Closed;
        self.outcome = Some(outcome);
        self.side = None;
    }

    fn abort(&mut self) {
        if self.alive() {
            self.fail(ConsumerOutcome::Aborted);
        }
    }

    async fn write(&mut self, framed: &Framed, consumed: u64, activity: Duration) {
        let data = if self.auxiliary() {
            &framed.plain
        } else {
            &framed.wire
        };
        let Some(side) = self.side.as_mut() else {
            return;
        };
        if !data.is_empty() {
            match tokio::time::timeout(activity, side.write_all(data)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.fail(ConsumerOutcome::WriteError(e.kind()));
                    return;
                }
                Err(_) => {
                    self.fail(ConsumerOutcome::Timeout);
                    return;
                }
            }
        }
        self.bytes_written += consumed;
        self.wire_bytes += data.len() as u64;
    }

    async fn finish_success(&mut self, activity: Duration) {
        if !self.alive() {
            return;
        }
        let Some(side) = self.side.as_mut() else {
            return;
        };
        let result = match self.finish {
            FinishAction::Close => tokio::time::timeout(activity, side.shutdown()).await,
            FinishAction::Release => tokio::time::timeout(activity, side.flush()).await,
        };
        match result {
            Ok(Ok(())) => {
                self.status = EndpointStatus::Success;
                self.outcome = Some(ConsumerOutcome::Complete);
                if self.finish == FinishAction::Close {
                    self.side = None;
                }
            }
            Ok(Err(e)) => self.fail(ConsumerOutcome::WriteError(e.kind())),
            Err(_) => self.fail(ConsumerOutcome::Timeout),
        }
    }
}

pub(crate) struct PumpJob {
    pub producer: ProducerId,
    pub source: Option<ReadSide>,
    pub preread: Bytes,
    pub length: BodyLength,
    pub codec: ChunkCodec,
    pub sinks: Vec<PumpSink>,
    pub abort: CancellationToken,
    pub precomplete: CancellationToken,
    pub settings: TunnelSettings,
    pub fill: Arc<dyn BackgroundFillPolicy>,
}

pub(crate) struct PumpReport {
    pub producer: ProducerId,
    /// Source handed back when the body was delimited and fully read.
    pub source: Option<ReadSide>,
    pub outcome: ProducerOutcome,
    pub bytes_read: u64,
    /// Bytes read past the end of the body.
    pub leftover: Bytes,
    pub sinks: Vec<PumpSink>,
    pub background_fill: bool,
}

async fn deliver(sinks: &mut [PumpSink], framed: &Framed, consumed: u64, activity: Duration) {
    let writes = sinks
        .iter_mut()
        .filter(|s| s.alive())
        .map(|sink| sink.write(framed, consumed, activity));
    futures_util::future::join_all(writes).await;
}

pub(crate) async fn pump(mut job: PumpJob) -> PumpReport {
    let mut buf = vec![0u8; job.settings.buffer_bytes.max(1)];
    let mut pending = (!job.preread.is_empty()).then(|| std::mem::take(&mut job.preread));
    let declared = job.length.known();
    let mut bytes_read = 0u64;
    let mut leftover = Bytes::new();
    let mut filling = false;

    let outcome = loop {
        if job.codec.body_complete() {
            break ProducerOutcome::Complete;
        }
        if declared.is_some_and(|n| bytes_read >= n) {
            break ProducerOutcome::Complete;
        }
        if !job.sinks.iter().any(PumpSink::alive) {
            break ProducerOutcome::ConsumersGone;
        }

        let activity = if filling {
            job.settings.fill_activity
        } else {
            job.settings.activity
        };

        let input = match pending.take() {
            Some(bytes) => bytes,
            None => {
                let Some(source) = job.source.as_mut() else {
                    // Static producers carry the whole body in the pre-read buffer.
                    let short = declared.is_some_and(|n| bytes_read < n);
                    break if short || job.codec.reads_chunked() {
                        ProducerOutcome::Truncated
                    } else {
                        ProducerOutcome::EndOfStream
                    };
                };
                let want = match declared {
                    Some(n) => (n - bytes_read).min(buf.len() as u64) as usize,
                    None => buf.len(),
                };
                tokio::select! {
                    biased;
                    _ = job.abort.cancelled() => break ProducerOutcome::Aborted,
                    _ = job.precomplete.cancelled() => break ProducerOutcome::Precomplete,
                    read = tokio::time::timeout(activity, source.read(&mut buf[..want])) => match read {
                        Err(_) => break ProducerOutcome::Timeout,
                        Ok(Err(e)) => break ProducerOutcome::ReadError(e.kind()),
                        Ok(Ok(0)) => {
                            let delimited = declared.is_some() || job.codec.reads_chunked();
                            break if delimited {
                                ProducerOutcome::Truncated
                            } else {
                                ProducerOutcome::EndOfStream
                            };
                        }
                        Ok(Ok(n)) => Bytes::copy_from_slice(&buf[..n]),
                    },
                }
            }
        };

        let input = match declared {
            Some(n) if input.len() as u64 > n - bytes_read => {
                let room = (n - bytes_read) as usize;
                leftover = input.slice(room..);
                input.slice(..room)
            }
            _ => input,
        };

        let (framed, used) = match job.codec.apply(&input) {
            Ok(step) => step,
            Err(e) => {
                tracing::debug!(producer = ?job.producer, error = %e, "Chunked body rejected");
                break ProducerOutcome::ReadError(ErrorKind::InvalidData);
            }
        };
        if used < input.len() {
            leftover = input.slice(used..);
        }
        bytes_read += used as u64;
        tracing::trace!(producer = ?job.producer, bytes = used, total = bytes_read, "Tunnel read");

        let alive_before: Vec<bool> = job.sinks.iter().map(PumpSink::alive).collect();
        tokio::select! {
            biased;
            _ = job.abort.cancelled() => break ProducerOutcome::Aborted,
            _ = deliver(&mut job.sinks, &framed, used as u64, activity) => {}
        }

        let primary_lost = job
            .sinks
            .iter()
            .zip(&alive_before)
            .any(|(sink, was_alive)| *was_alive && !sink.alive() && !sink.auxiliary());
        if primary_lost && !filling {
            let progress = FillProgress {
                bytes_read,
                declared_length: declared,
                cache_consumer_alive: job.sinks.iter().any(|s| s.auxiliary() && s.alive()),
            };
            if job.fill.should_fill(&progress) {
                tracing::debug!(
                    producer = ?job.producer,
                    bytes_read,
                    declared_length = ?declared,
                    "Consumer gone, continuing background fill"
                );
                filling = true;
            } else {
                break ProducerOutcome::ConsumersGone;
            }
        }
    };

    let activity = if filling {
        job.settings.fill_activity
    } else {
        job.settings.activity
    };
    if outcome.is_success() {
        let tail = job.codec.finish();
        if !tail.wire.is_empty() {
            deliver(&mut job.sinks, &tail, 0, activity).await;
        }
        for sink in job.sinks.iter_mut() {
            sink.finish_success(activity).await;
        }
    } else {
        for sink in job.sinks.iter_mut() {
            sink.abort();
        }
    }

    tracing::debug!(
        producer = ?job.producer,
        outcome = ?outcome,
        bytes_read,
        background_fill = filling,
        "Producer finished"
    );

    let source = if outcome == ProducerOutcome::Complete {
        job.source.take()
    } else {
        None
    };

    PumpReport {
        producer: job.producer,
        source,
        outcome,
        bytes_read,
        leftover,
        sinks: job.sinks,
        background_fill: filling,
    }
}
