use super::{
    drain, stop_extensions, AsyncControl, CarryOver, FlushOutStore, RunnerContext, READY_POLL,
    RETRY_WARN_EVERY,
};
use crate::model::{Batch, GroupEvents, RecordWithContext};
use crate::plugin::{
    AggregatorV2, FlusherV2, MetricInputV2, PluginError, PluginMeta, ProcessorV2, ServiceInputV2,
};
use crate::wrapper::{
    AggregatorWrapperV2, FlusherWrapperV2, MetricWrapperV2, ProcessorWrapperV2, ServiceWrapperV2,
};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Group-events runner: every stage exchanges [`GroupEvents`].
pub struct RunnerV2 {
    ctx: Arc<RunnerContext>,
    input_tx: mpsc::Sender<GroupEvents>,
    input_rx: Mutex<mpsc::Receiver<GroupEvents>>,
    flush_tx: mpsc::Sender<GroupEvents>,
    flush_rx: Mutex<mpsc::Receiver<GroupEvents>>,
    metric_inputs: Vec<Arc<MetricWrapperV2>>,
    service_inputs: Vec<Arc<ServiceWrapperV2>>,
    processors: Vec<ProcessorWrapperV2>,
    aggregators: Vec<Arc<AggregatorWrapperV2>>,
    flushers: Vec<FlusherWrapperV2>,
    flush_out: FlushOutStore<GroupEvents>,
    input_control: AsyncControl,
    process_control: AsyncControl,
    aggregate_control: AsyncControl,
    flush_control: AsyncControl,
}

impl RunnerV2 {
    pub fn new(
        ctx: Arc<RunnerContext>,
        input_queue_size: usize,
        flush_queue_size: usize,
        carry_over: Vec<GroupEvents>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(input_queue_size.max(1));
        let (flush_tx, flush_rx) = mpsc::channel(flush_queue_size.max(carry_over.len()).max(1));
        let flush_out = FlushOutStore::new();
        flush_out.add(carry_over);
        Self {
            ctx,
            input_tx,
            input_rx: Mutex::new(input_rx),
            flush_tx,
            flush_rx: Mutex::new(flush_rx),
            metric_inputs: Vec::new(),
            service_inputs: Vec::new(),
            processors: Vec::new(),
            aggregators: Vec::new(),
            flushers: Vec::new(),
            flush_out,
            input_control: AsyncControl::new(),
            process_control: AsyncControl::new(),
            aggregate_control: AsyncControl::new(),
            flush_control: AsyncControl::new(),
        }
    }

    pub fn context(&self) -> &Arc<RunnerContext> {
        &self.ctx
    }

    pub fn flush_out(&self) -> &FlushOutStore<GroupEvents> {
        &self.flush_out
    }

    pub fn add_metric_input(
        &mut self,
        meta: PluginMeta,
        input: Box<dyn MetricInputV2>,
        interval: Duration,
    ) -> Result<(), PluginError> {
        let wrapper = MetricWrapperV2::new(
            &self.ctx.context,
            meta,
            input,
            interval,
            self.input_tx.clone(),
            self.ctx.statistics.collect_latency.clone(),
        )?;
        self.metric_inputs.push(Arc::new(wrapper));
        Ok(())
    }

    pub fn add_service_input(
        &mut self,
        meta: PluginMeta,
        input: Box<dyn ServiceInputV2>,
    ) -> Result<(), PluginError> {
        let wrapper = ServiceWrapperV2::new(&self.ctx.context, meta, input, self.input_tx.clone())?;
        self.service_inputs.push(Arc::new(wrapper));
        Ok(())
    }

    pub fn add_processor(
        &mut self,
        meta: PluginMeta,
        priority: i32,
        processor: Box<dyn ProcessorV2>,
    ) -> Result<(), PluginError> {
        let wrapper = ProcessorWrapperV2::new(&self.ctx.context, meta, priority, processor)?;
        self.processors.push(wrapper);
        Ok(())
    }

    pub fn add_aggregator(
        &mut self,
        meta: PluginMeta,
        aggregator: Box<dyn AggregatorV2>,
        interval: Duration,
    ) -> Result<(), PluginError> {
        let wrapper = AggregatorWrapperV2::new(
            &self.ctx.context,
            meta,
            aggregator,
            interval,
            self.flush_tx.clone(),
        )?;
        self.aggregators.push(Arc::new(wrapper));
        Ok(())
    }

    pub fn add_flusher(
        &mut self,
        meta: PluginMeta,
        flusher: Box<dyn FlusherV2>,
    ) -> Result<(), PluginError> {
        let wrapper = FlusherWrapperV2::new(&self.ctx.context, meta, flusher)?;
        self.flushers.push(wrapper);
        Ok(())
    }

    pub fn aggregator_count(&self) -> usize {
        self.aggregators.len()
    }

    pub fn flusher_count(&self) -> usize {
        self.flushers.len()
    }

    pub(crate) async fn rollback(self) -> CarryOver {
        for service in &self.service_inputs {
            service.stop().await;
        }
        for flusher in &self.flushers {
            flusher.stop().await;
        }
        stop_extensions(&self.ctx.context).await;
        self.ctx.context.cancel_runtime();
        CarryOver::Groups(self.flush_out.take())
    }

    pub fn start(self: &Arc<Self>) {
        let span = self.ctx.span.clone();
        self.ctx.pause.reset();

        self.flush_control.reset();
        let (runner, stage_span) = (self.clone(), span.clone());
        self.flush_control
            .run(move |token| runner.run_flusher(token).instrument(stage_span));

        let written = self.flush_out.write(&self.flush_tx);
        if written > 0 {
            info!(parent: &span, groups = written, "carried-over groups queued for flush");
        }

        self.aggregate_control.reset();
        for aggregator in &self.aggregators {
            let (aggregator, stage_span) = (aggregator.clone(), span.clone());
            self.aggregate_control
                .run(move |token| aggregator.run(token).instrument(stage_span));
        }

        self.process_control.reset();
        let (runner, stage_span) = (self.clone(), span.clone());
        self.process_control
            .run(move |token| runner.run_processor(token).instrument(stage_span));

        self.input_control.reset();
        for input in &self.metric_inputs {
            let (input, stage_span) = (input.clone(), span.clone());
            self.input_control
                .run(move |token| input.run(token).instrument(stage_span));
        }
        for service in &self.service_inputs {
            let (service, stage_span) = (service.clone(), span.clone());
            self.input_control
                .run(move |_token| service.run().instrument(stage_span));
        }
    }

    pub async fn stop(&self, exit: bool) {
        let span = self.ctx.span.clone();
        for flusher in &self.flushers {
            flusher.set_urgent(exit).await;
        }
        for service in &self.service_inputs {
            service.stop().await;
        }
        self.input_control.wait_cancel().await;
        info!(parent: &span, "metric and service inputs stopped");

        self.process_control.wait_cancel().await;
        self.aggregate_control.wait_cancel().await;
        info!(parent: &span, "processors and aggregators stopped");

        self.ctx.set_flush_out(true);
        self.flush_control.wait_cancel().await;

        if exit && !self.flush_out.is_empty() {
            self.flush_out_on_exit().await;
        }
        for flusher in &self.flushers {
            flusher.stop().await;
        }
        info!(parent: &span, "flushers stopped");
        stop_extensions(&self.ctx.context).await;
        self.ctx.context.cancel_runtime();
    }

    pub async fn pause(&self) -> bool {
        self.ctx.pause.pause(&self.flush_control.cancel_token()).await
    }

    pub async fn resume(&self) -> bool {
        self.ctx.pause.resume(&self.flush_control.cancel_token()).await
    }

    pub async fn receive_raw_log(&self, log: RecordWithContext) {
        let group = GroupEvents::from_record(log.record, &log.context, SystemTime::now());
        if self.input_tx.send(group).await.is_err() {
            debug!(parent: &self.ctx.span, "input queue closed, raw log dropped");
        }
    }

    pub async fn receive_log_group(&self, batch: Batch) {
        let group = GroupEvents::from_batch(batch, SystemTime::now());
        if self.input_tx.send(group).await.is_err() {
            debug!(parent: &self.ctx.span, "input queue closed, log group dropped");
        }
    }

    async fn run_processor(self: Arc<Self>, token: CancellationToken) {
        let mut queue = self.input_rx.lock().await;
        loop {
            tokio::select! {
                biased;
                item = queue.recv() => match item {
                    Some(first) => {
                        for group in drain(first, &mut queue) {
                            self.process(group).await;
                        }
                    }
                    None => return,
                },
                _ = token.cancelled() => return,
            }
        }
    }

    async fn process(&self, group: GroupEvents) {
        let stats = &self.ctx.statistics;
        stats.raw_log.add(group.len() as i64);

        let mut pipe = vec![group];
        for processor in &self.processors {
            let mut next = Vec::with_capacity(pipe.len());
            for input in pipe {
                next.extend(processor.process(input));
            }
            pipe = next;
            if pipe.is_empty() {
                return;
            }
        }

        let now = SystemTime::now();
        pipe.retain(|g| !g.is_empty());
        for group in pipe.iter_mut() {
            stats.split_log.add(group.len() as i64);
            for event in group.events.iter_mut() {
                event.stamp_if_zero(now);
            }
        }
        for aggregator in &self.aggregators {
            for group in &pipe {
                self.record_with_retry(aggregator, group).await;
            }
        }
    }

    async fn record_with_retry(&self, aggregator: &AggregatorWrapperV2, group: &GroupEvents) {
        let mut tries: u64 = 0;
        loop {
            match aggregator.record(group).await {
                Ok(()) => return,
                Err(PluginError::QueueFull) => {
                    tries += 1;
                    if tries % RETRY_WARN_EVERY == 0 {
                        warn!(
                            alarm = "AGGREGATOR_ADD_ALARM",
                            aggregator = %aggregator.meta.plugin_type_with_id,
                            tries,
                            "flush queue full, retrying"
                        );
                    }
                    tokio::time::sleep(READY_POLL).await;
                }
                Err(e) => {
                    error!(
                        alarm = "AGGREGATOR_ADD_ALARM",
                        aggregator = %aggregator.meta.plugin_type_with_id,
                        error = %e,
                        "aggregator rejected group"
                    );
                    return;
                }
            }
        }
    }

    async fn run_flusher(self: Arc<Self>, token: CancellationToken) {
        let mut queue = self.flush_rx.lock().await;
        loop {
            tokio::select! {
                biased;
                Some(ack) = self.ctx.pause.next_pause_request() => {
                    self.ctx.pause.wait_for_resume(ack, &token).await;
                }
                item = queue.recv() => match item {
                    Some(first) => {
                        if let Some(ack) = self.ctx.pause.try_pause_request() {
                            self.ctx.pause.wait_for_resume(ack, &token).await;
                        }
                        let groups = drain(first, &mut queue);
                        self.export(groups).await;
                    }
                    None => return,
                },
                _ = token.cancelled() => return,
            }
        }
    }

    async fn all_ready(&self) -> bool {
        for flusher in &self.flushers {
            if !flusher.is_ready(self.ctx.logstore_key).await {
                return false;
            }
        }
        true
    }

    async fn export(&self, mut groups: Vec<GroupEvents>) {
        let stats = &self.ctx.statistics;
        stats.flush_loggroup.add(groups.len() as i64);
        for group in groups.iter_mut().filter(|g| !g.is_empty()) {
            stats.flush_log.add(group.len() as i64);
            self.ctx.tags.stamp_group(group);
        }

        loop {
            if self.all_ready().await {
                for flusher in &self.flushers {
                    stats.flush_ready.add(1);
                    let started = Instant::now();
                    let result = flusher.export(&groups).await;
                    stats.flush_latency.observe(started.elapsed());
                    if let Err(e) = result {
                        error!(
                            alarm = "FLUSH_DATA_ALARM",
                            flusher = %flusher.meta.plugin_type_with_id,
                            error = %e,
                            "export data error"
                        );
                    }
                }
                return;
            }
            if !self.ctx.is_flush_out() {
                tokio::time::sleep(READY_POLL).await;
                continue;
            }
            info!(groups = groups.len(), "pipeline stopping, groups moved to flush-out store");
            self.flush_out.add(groups);
            return;
        }
    }

    async fn flush_out_on_exit(&self) {
        let groups = self.flush_out.take();
        info!(groups = groups.len(), "flushing out leftover groups");
        let attempts = self.ctx.flush_out_attempts();
        for flusher in &self.flushers {
            let mut ready = false;
            for _ in 0..attempts {
                if flusher.is_ready(self.ctx.logstore_key).await {
                    ready = true;
                    break;
                }
                tokio::time::sleep(READY_POLL).await;
            }
            if !ready {
                warn!(
                    alarm = "FLUSH_OUT_ALARM",
                    flusher = %flusher.meta.plugin_type_with_id,
                    groups = groups.len(),
                    "flusher not ready before timeout, leftover groups dropped"
                );
                continue;
            }
            if let Err(e) = flusher.export(&groups).await {
                error!(
                    alarm = "FLUSH_DATA_ALARM",
                    flusher = %flusher.meta.plugin_type_with_id,
                    error = %e,
                    "flush out error"
                );
            }
        }
    }
}
