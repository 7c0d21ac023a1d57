//! Tunnel: producers, consumers, chains, and the run loop that drives them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{BackgroundFillConfig, ProxyConfig};
use crate::observability::metrics;
use crate::tunnel::chunk::ChunkCodec;
use crate::tunnel::fill::{BackgroundFillPolicy, RatioFill};
use crate::tunnel::pump::{pump, PumpJob, PumpReport, PumpSink};
use crate::tunnel::{
    BodyLength, ChunkAction, ConsumerId, ConsumerOutcome, EndpointStatus, FinishAction,
    ProducerId, ProducerOutcome,
};
use crate::vc::{VcHandle, VcKind, VcTable, VcTableError};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel has no runnable producers")]
    NoProducers,

    #[error("unknown producer {0:?}")]
    UnknownProducer(ProducerId),

    #[error("unknown consumer {0:?}")]
    UnknownConsumer(ConsumerId),

    #[error(transparent)]
    Vc(#[from] VcTableError),
}

/// Buffer size and timeouts shared by every pump of a tunnel.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub buffer_bytes: usize,
    /// No-activity timeout for reads and writes.
    pub activity: Duration,
    /// No-activity timeout once the producer only feeds a cache writer.
    pub fill_activity: Duration,
}

impl TunnelSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            buffer_bytes: config.tunnel.buffer_bytes,
            activity: config.timeouts.activity(),
            fill_activity: Duration::from_secs(config.background_fill.activity_secs),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

#[derive(Debug)]
pub struct Producer {
    id: ProducerId,
    source: Option<VcHandle>,
    length: BodyLength,
    chunk_action: ChunkAction,
    preread: Bytes,
    consumers: Vec<ConsumerId>,
    status: EndpointStatus,
    read_done: bool,
    bytes_read: u64,
    outcome: Option<ProducerOutcome>,
    leftover: Bytes,
    abort: CancellationToken,
    precomplete: CancellationToken,
}

impl Producer {
    pub fn id(&self) -> ProducerId {
        self.id
    }

    /// `None` for static-buffer producers.
    pub fn source(&self) -> Option<VcHandle> {
        self.source
    }

    pub fn length(&self) -> BodyLength {
        self.length
    }

    pub fn chunk_action(&self) -> ChunkAction {
        self.chunk_action
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    pub fn read_done(&self) -> bool {
        self.read_done
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn outcome(&self) -> Option<ProducerOutcome> {
        self.outcome
    }

    pub fn consumers(&self) -> &[ConsumerId] {
        &self.consumers
    }
}

#[derive(Debug)]
pub struct Consumer {
    id: ConsumerId,
    sink: VcHandle,
    producer: ProducerId,
    finish: FinishAction,
    bytes_written: u64,
    write_done: bool,
    status: EndpointStatus,
    outcome: Option<ConsumerOutcome>,
}

impl Consumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn sink(&self) -> VcHandle {
        self.sink
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    pub fn write_done(&self) -> bool {
        self.write_done
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn outcome(&self) -> Option<ConsumerOutcome> {
        self.outcome
    }
}

#[derive(Debug, Clone)]
pub struct ProducerSummary {
    pub id: ProducerId,
    pub source: Option<VcHandle>,
    pub outcome: ProducerOutcome,
    pub bytes_read: u64,
    pub leftover: Bytes,
    pub background_fill: bool,
}

#[derive(Debug, Clone)]
pub struct ConsumerSummary {
    pub id: ConsumerId,
    pub sink: VcHandle,
    pub kind: VcKind,
    pub producer: ProducerId,
    pub outcome: ConsumerOutcome,
    /// Producer bytes delivered to this consumer.
    pub bytes_written: u64,
    /// Bytes actually written, framing included.
    pub wire_bytes: u64,
}

/// Result of one `Tunnel::run`.
#[derive(Debug, Clone, Default)]
pub struct TunnelReport {
    pub producers: Vec<ProducerSummary>,
    pub consumers: Vec<ConsumerSummary>,
}

impl TunnelReport {
    pub fn producer(&self, id: ProducerId) -> Option<&ProducerSummary> {
        self.producers.iter().find(|p| p.id == id)
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<&ConsumerSummary> {
        self.consumers.iter().find(|c| c.id == id)
    }

    pub fn background_fill(&self) -> bool {
        self.producers.iter().any(|p| p.background_fill)
    }
}

/// Producer/consumer graph for one transfer phase.
pub struct Tunnel {
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
    chains: Vec<(ConsumerId, ProducerId)>,
    settings: TunnelSettings,
    fill: Arc<dyn BackgroundFillPolicy>,
}

impl Tunnel {
    pub fn new(settings: TunnelSettings, fill: Arc<dyn BackgroundFillPolicy>) -> Self {
        Self {
            producers: Vec::new(),
            consumers: Vec::new(),
            chains: Vec::new(),
            settings,
            fill,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TunnelSettings::default(), Arc::new(RatioFill::from_config(&BackgroundFillConfig::default())))
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn add_producer(
        &mut self,
        source: VcHandle,
        length: BodyLength,
        chunk_action: ChunkAction,
    ) -> ProducerId {
        self.push_producer(Some(source), length, chunk_action, Bytes::new())
    }

    /// A producer whose whole body is already in memory.
    pub fn add_static_producer(&mut self, body: Bytes) -> ProducerId {
        let length = BodyLength::Known(body.len() as u64);
        self.push_producer(None, length, ChunkAction::PassThrough, body)
    }

    /// Bytes already read from the source (e.g. body bytes that arrived with
    /// the header). They are delivered before anything is read.
    pub fn set_preread(&mut self, id: ProducerId, data: Bytes) -> Result<(), TunnelError> {
        self.producer_mut(id)?.preread = data;
        Ok(())
    }

    pub fn add_consumer(
        &mut self,
        sink: VcHandle,
        producer: ProducerId,
        finish: FinishAction,
    ) -> Result<ConsumerId, TunnelError> {
        let id = ConsumerId(self.consumers.len());
        self.producer_mut(producer)?.consumers.push(id);
        self.consumers.push(Consumer {
            id,
            sink,
            producer,
            finish,
            bytes_written: 0,
            write_done: false,
            status: EndpointStatus::Alive,
            outcome: None,
        });
        Ok(id)
    }

    /// Pair a consumer with a producer of the opposite direction: failure
    /// of either aborts the other.
    pub fn chain(&mut self, consumer: ConsumerId, producer: ProducerId) -> Result<(), TunnelError> {
        self.consumer_ref(consumer)?;
        self.producer_ref(producer)?;
        self.chains.push((consumer, producer));
        Ok(())
    }

    pub fn producer(&self, id: ProducerId) -> Option<&Producer> {
        self.producers.get(id.0)
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<&Consumer> {
        self.consumers.get(id.0)
    }

    /// Token that aborts the producer from outside a running tunnel.
    pub fn abort_handle(&self, id: ProducerId) -> Option<CancellationToken> {
        self.producer(id).map(|p| p.abort.clone())
    }

    /// Token that ends the producer successfully at the bytes moved so far.
    pub fn precomplete_handle(&self, id: ProducerId) -> Option<CancellationToken> {
        self.producer(id).map(|p| p.precomplete.clone())
    }

    /// Abort a producer, its consumers and everything chained to them.
    pub fn abort_all(&mut self, id: ProducerId) -> Result<(), TunnelError> {
        self.producer_ref(id)?;
        let mut work = vec![id];
        let mut seen = Vec::new();
        while let Some(pid) = work.pop() {
            if seen.contains(&pid) {
                continue;
            }
            seen.push(pid);

            let producer = &mut self.producers[pid.0];
            producer.abort.cancel();
            if producer.status == EndpointStatus::Alive {
                producer.status = EndpointStatus::Closed;
                producer.outcome = Some(ProducerOutcome::Aborted);
            }
            let consumers = producer.consumers.clone();
            for cid in &consumers {
                let consumer = &mut self.consumers[cid.0];
                if consumer.status == EndpointStatus::Alive {
                    consumer.status = EndpointStatus::Closed;
                    consumer.outcome = Some(ConsumerOutcome::Aborted);
                }
            }
            for &(c, p) in &self.chains {
                if consumers.contains(&c) {
                    work.push(p);
                }
                if p == pid {
                    work.push(self.consumers[c.0].producer);
                }
            }
        }
        Ok(())
    }

    /// Move data until every selected producer has ended.
    ///
    /// With `start`, runs that producer plus everything chained to it;
    /// otherwise every producer that has not run yet.
    pub async fn run(
        &mut self,
        table: &mut VcTable,
        start: Option<ProducerId>,
    ) -> Result<TunnelReport, TunnelError> {
        let selected = self.select(start)?;
        if selected.is_empty() {
            return Err(TunnelError::NoProducers);
        }
        self.check_sides(table, &selected)?;

        let mut touched = Vec::new();
        let jobs = match self.build_jobs(table, selected, &mut touched) {
            Ok(jobs) => jobs,
            Err(e) => {
                release(table, touched);
                return Err(e);
            }
        };

        let mut running: FuturesUnordered<_> = jobs.into_iter().map(pump).collect();
        let mut reports = Vec::new();
        while let Some(report) = running.next().await {
            self.propagate(&report);
            reports.push(report);
        }

        let mut summary = TunnelReport::default();
        let mut failure = None;
        for report in reports {
            if let Err(e) = self.apply(table, report, &mut summary) {
                failure.get_or_insert(e);
            }
        }
        release(table, touched);
        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Take every selected side out of the table. Handles are recorded in
    /// `touched` as soon as their side is taken.
    fn build_jobs(
        &self,
        table: &mut VcTable,
        selected: Vec<ProducerId>,
        touched: &mut Vec<VcHandle>,
    ) -> Result<Vec<PumpJob>, TunnelError> {
        let mut jobs = Vec::with_capacity(selected.len());
        for pid in selected {
            let producer = &self.producers[pid.0];
            let source = match producer.source {
                Some(h) => {
                    let side = table.take_read_for_tunnel(h)?;
                    touched.push(h);
                    Some(side)
                }
                None => None,
            };

            let mut sinks = Vec::new();
            for &cid in &producer.consumers {
                let consumer = &self.consumers[cid.0];
                if consumer.status != EndpointStatus::Alive {
                    continue;
                }
                let kind = table.get(consumer.sink)?.kind();
                let side = table.take_write_for_tunnel(consumer.sink)?;
                touched.push(consumer.sink);
                sinks.push(PumpSink::new(cid, consumer.sink, kind, side, consumer.finish));
            }

            jobs.push(PumpJob {
                producer: pid,
                source,
                preread: producer.preread.clone(),
                length: producer.length,
                codec: ChunkCodec::new(producer.chunk_action),
                sinks,
                abort: producer.abort.clone(),
                precomplete: producer.precomplete.clone(),
                settings: self.settings.clone(),
                fill: Arc::clone(&self.fill),
            });
        }
        Ok(jobs)
    }

    /// Close anything still marked as tunnel-owned and forget every endpoint.
    pub fn reset(&mut self, table: &mut VcTable) {
        let handles = self
            .producers
            .iter()
            .filter_map(|p| {
                p.abort.cancel();
                p.source
            })
            .chain(self.consumers.iter().map(|c| c.sink));
        let owned: Vec<VcHandle> = handles
            .filter(|h| table.get(*h).map(|e| e.in_tunnel()).unwrap_or(false))
            .collect();
        for h in owned {
            if let Err(e) = table.tunnel_retire(h) {
                tracing::debug!(vc = %h, error = %e, "Tunnel endpoint already gone");
            }
        }
        self.producers.clear();
        self.consumers.clear();
        self.chains.clear();
    }

    fn push_producer(
        &mut self,
        source: Option<VcHandle>,
        length: BodyLength,
        chunk_action: ChunkAction,
        preread: Bytes,
    ) -> ProducerId {
        let id = ProducerId(self.producers.len());
        self.producers.push(Producer {
            id,
            source,
            length,
            chunk_action,
            preread,
            consumers: Vec::new(),
            status: EndpointStatus::Alive,
            read_done: false,
            bytes_read: 0,
            outcome: None,
            leftover: Bytes::new(),
            abort: CancellationToken::new(),
            precomplete: CancellationToken::new(),
        });
        id
    }

    fn select(&self, start: Option<ProducerId>) -> Result<Vec<ProducerId>, TunnelError> {
        let mut set = match start {
            Some(id) => {
                self.producer_ref(id)?;
                let mut set = vec![id];
                loop {
                    let before = set.len();
                    for &(c, p) in &self.chains {
                        let owner = self.consumers[c.0].producer;
                        if set.contains(&owner) && !set.contains(&p) {
                            set.push(p);
                        }
                        if set.contains(&p) && !set.contains(&owner) {
                            set.push(owner);
                        }
                    }
                    if set.len() == before {
                        break set;
                    }
                }
            }
            None => self.producers.iter().map(|p| p.id).collect(),
        };
        set.retain(|id| {
            let p = &self.producers[id.0];
            p.status == EndpointStatus::Alive && !p.read_done
        });
        Ok(set)
    }

    fn check_sides(&self, table: &VcTable, selected: &[ProducerId]) -> Result<(), TunnelError> {
        for pid in selected {
            let producer = &self.producers[pid.0];
            if let Some(h) = producer.source {
                if !table.get(h)?.has_read_side() {
                    return Err(VcTableError::MissingSide { handle: h, side: "read" }.into());
                }
            }
            for cid in &producer.consumers {
                let consumer = &self.consumers[cid.0];
                if consumer.status == EndpointStatus::Alive && !table.get(consumer.sink)?.has_write_side() {
                    return Err(VcTableError::MissingSide {
                        handle: consumer.sink,
                        side: "write",
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn propagate(&self, report: &PumpReport) {
        for sink in &report.sinks {
            let failed = matches!(
                sink.outcome,
                Some(ConsumerOutcome::WriteError(_)) | Some(ConsumerOutcome::Timeout)
            );
            if failed {
                for &(c, p) in &self.chains {
                    if c == sink.consumer {
                        self.producers[p.0].abort.cancel();
                    }
                }
            }
        }
        if !report.outcome.is_success() {
            for &(c, p) in &self.chains {
                if p == report.producer {
                    let owner = self.consumers[c.0].producer;
                    self.producers[owner.0].abort.cancel();
                }
            }
        }
    }

    fn apply(
        &mut self,
        table: &mut VcTable,
        report: PumpReport,
        summary: &mut TunnelReport,
    ) -> Result<(), TunnelError> {
        let producer = &mut self.producers[report.producer.0];
        producer.read_done = true;
        producer.bytes_read = report.bytes_read;
        producer.outcome = Some(report.outcome);
        producer.leftover = report.leftover.clone();
        producer.status = if report.outcome.is_success() {
            EndpointStatus::Success
        } else {
            EndpointStatus::Closed
        };
        if let Some(h) = producer.source {
            match report.source {
                Some(side) => table.return_read(h, side)?,
                None => table.mark_end_of_stream(h)?,
            }
        }
        summary.producers.push(ProducerSummary {
            id: producer.id,
            source: producer.source,
            outcome: report.outcome,
            bytes_read: report.bytes_read,
            leftover: report.leftover,
            background_fill: report.background_fill,
        });

        for sink in report.sinks {
            let outcome = sink.outcome.unwrap_or(ConsumerOutcome::Aborted);
            let consumer = &mut self.consumers[sink.consumer.0];
            consumer.bytes_written = sink.bytes_written;
            consumer.write_done = true;
            consumer.outcome = Some(outcome);
            consumer.status = if outcome.is_success() {
                EndpointStatus::Success
            } else {
                EndpointStatus::Closed
            };
            if let Some(side) = sink.side {
                table.return_write(sink.vc, side)?;
            }
            metrics::record_tunnel_bytes(sink.kind, sink.wire_bytes);
            summary.consumers.push(ConsumerSummary {
                id: sink.consumer,
                sink: sink.vc,
                kind: sink.kind,
                producer: report.producer,
                outcome,
                bytes_written: sink.bytes_written,
                wire_bytes: sink.wire_bytes,
            });
        }
        Ok(())
    }

    fn producer_ref(&self, id: ProducerId) -> Result<&Producer, TunnelError> {
        self.producers.get(id.0).ok_or(TunnelError::UnknownProducer(id))
    }

    fn producer_mut(&mut self, id: ProducerId) -> Result<&mut Producer, TunnelError> {
        self.producers
            .get_mut(id.0)
            .ok_or(TunnelError::UnknownProducer(id))
    }

    fn consumer_ref(&self, id: ConsumerId) -> Result<&Consumer, TunnelError> {
        self.consumers.get(id.0).ok_or(TunnelError::UnknownConsumer(id))
    }
}

/// Hand every touched entry back to the table. Sides still held by dropped
/// jobs are gone by now, so entries left with none are closed.
fn release(table: &mut VcTable, mut touched: Vec<VcHandle>) {
    touched.sort_by_key(|h| (h.index(), h.generation()));
    touched.dedup();
    for h in touched {
        if let Err(e) = table.leave_tunnel(h) {
            tracing::debug!(vc = %h, error = %e, "Tunnel entry already gone");
        }
    }
}
