use super::{
    drain, stop_extensions, AsyncControl, CarryOver, FlushOutStore, RunnerContext, READY_POLL,
    RETRY_WARN_EVERY,
};
use crate::model::{Batch, Record, RecordContext, RecordWithContext};
use crate::plugin::{
    AggregatorV1, FlusherV1, MetricInputV1, PluginError, PluginMeta, ProcessorV1, ServiceInputV1,
};
use crate::wrapper::{
    AggregatorWrapperV1, FlusherWrapperV1, MetricWrapperV1, ProcessorWrapperV1, ServiceWrapperV1,
};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Record-oriented runner: records through processors, batches at flush.
pub struct RunnerV1 {
    ctx: Arc<RunnerContext>,
    input_tx: mpsc::Sender<RecordWithContext>,
    input_rx: Mutex<mpsc::Receiver<RecordWithContext>>,
    flush_tx: mpsc::Sender<Batch>,
    flush_rx: Mutex<mpsc::Receiver<Batch>>,
    metric_inputs: Vec<Arc<MetricWrapperV1>>,
    service_inputs: Vec<Arc<ServiceWrapperV1>>,
    processors: Vec<ProcessorWrapperV1>,
    aggregators: Vec<Arc<AggregatorWrapperV1>>,
    flushers: Vec<FlusherWrapperV1>,
    flush_out: FlushOutStore<Batch>,
    input_control: AsyncControl,
    process_control: AsyncControl,
    aggregate_control: AsyncControl,
    flush_control: AsyncControl,
}

impl RunnerV1 {
    /// The flush queue is sized to hold at least the whole carry-over.
    pub fn new(
        ctx: Arc<RunnerContext>,
        input_queue_size: usize,
        flush_queue_size: usize,
        carry_over: Vec<Batch>,
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

    pub fn flush_out(&self) -> &FlushOutStore<Batch> {
        &self.flush_out
    }

    pub fn add_metric_input(
        &mut self,
        meta: PluginMeta,
        input: Box<dyn MetricInputV1>,
        interval: Duration,
    ) -> Result<(), PluginError> {
        let wrapper = MetricWrapperV1::new(
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
        input: Box<dyn ServiceInputV1>,
    ) -> Result<(), PluginError> {
        let wrapper = ServiceWrapperV1::new(&self.ctx.context, meta, input, self.input_tx.clone())?;
        self.service_inputs.push(Arc::new(wrapper));
        Ok(())
    }

    pub fn add_processor(
        &mut self,
        meta: PluginMeta,
        priority: i32,
        processor: Box<dyn ProcessorV1>,
    ) -> Result<(), PluginError> {
        let wrapper = ProcessorWrapperV1::new(&self.ctx.context, meta, priority, processor)?;
        self.processors.push(wrapper);
        Ok(())
    }

    pub fn add_aggregator(
        &mut self,
        meta: PluginMeta,
        aggregator: Box<dyn AggregatorV1>,
        interval: Duration,
    ) -> Result<(), PluginError> {
        let wrapper = AggregatorWrapperV1::new(
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
        flusher: Box<dyn FlusherV1>,
    ) -> Result<(), PluginError> {
        let wrapper = FlusherWrapperV1::new(&self.ctx.context, meta, flusher)?;
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
        CarryOver::Batches(self.flush_out.take())
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
            info!(parent: &span, batches = written, "carried-over batches queued for flush");
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
        debug!(parent: &span, "runner started");
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
        info!(parent: &span, "processors stopped");

        self.aggregate_control.wait_cancel().await;
        info!(parent: &span, "aggregators stopped");

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
        if self.input_tx.send(log).await.is_err() {
            debug!(parent: &self.ctx.span, "input queue closed, raw log dropped");
        }
    }

    /// Split a batch into records sharing the batch's topic and tags.
    pub async fn receive_log_group(&self, batch: Batch, pack_id: &str) {
        let context = RecordContext {
            source: Some(pack_id.to_string()),
            topic: Some(batch.topic.clone()),
            tags: batch.tags.clone(),
            ..RecordContext::default()
        };
        for record in batch.logs {
            self.receive_raw_log(RecordWithContext::new(record, context.clone()))
                .await;
        }
    }

    async fn run_processor(self: Arc<Self>, token: CancellationToken) {
        let mut queue = self.input_rx.lock().await;
        loop {
            tokio::select! {
                biased;
                item = queue.recv() => match item {
                    Some(first) => {
                        let items = drain(first, &mut queue);
                        self.process(items).await;
                    }
                    None => return,
                },
                _ = token.cancelled() => return,
            }
        }
    }

    async fn process(&self, items: Vec<RecordWithContext>) {
        let stats = &self.ctx.statistics;
        stats.raw_log.add(items.len() as i64);
        for (context, mut logs) in runs_by_context(items) {
            for processor in &self.processors {
                logs = processor.process(logs);
                if logs.is_empty() {
                    break;
                }
            }
            if logs.is_empty() {
                continue;
            }
            stats.split_log.add(logs.len() as i64);
            let now = SystemTime::now();
            for log in logs.iter_mut() {
                log.stamp_if_zero(now);
            }
            for aggregator in &self.aggregators {
                for log in logs.iter().filter(|log| !log.is_empty()) {
                    self.add_with_retry(aggregator, log, &context).await;
                }
            }
        }
    }

    /// `QueueFull` is retried until it clears; shutdown does not interrupt it.
    async fn add_with_retry(
        &self,
        aggregator: &AggregatorWrapperV1,
        log: &Record,
        context: &RecordContext,
    ) {
        let mut tries: u64 = 0;
        loop {
            match aggregator.add(log, context).await {
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
                        "aggregator rejected record"
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
                        let batches = drain(first, &mut queue);
                        self.flush(batches).await;
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

    async fn flush(&self, mut batches: Vec<Batch>) {
        let stats = &self.ctx.statistics;
        stats.flush_loggroup.add(batches.len() as i64);
        for batch in batches.iter_mut().filter(|b| !b.is_empty()) {
            stats.flush_log.add(batch.len() as i64);
            self.ctx.tags.stamp_batch(batch);
        }

        loop {
            if self.all_ready().await {
                for flusher in &self.flushers {
                    stats.flush_ready.add(1);
                    let started = Instant::now();
                    let result = flusher.flush(&batches).await;
                    stats.flush_latency.observe(started.elapsed());
                    if let Err(e) = result {
                        error!(
                            alarm = "FLUSH_DATA_ALARM",
                            flusher = %flusher.meta.plugin_type_with_id,
                            error = %e,
                            "flush data error"
                        );
                    }
                }
                return;
            }
            if !self.ctx.is_flush_out() {
                tokio::time::sleep(READY_POLL).await;
                continue;
            }
            info!(batches = batches.len(), "pipeline stopping, batches moved to flush-out store");
            self.flush_out.add(batches);
            return;
        }
    }

    /// Last chance for batches parked at shutdown.
    async fn flush_out_on_exit(&self) {
        let batches = self.flush_out.take();
        info!(batches = batches.len(), "flushing out leftover batches");
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
                    batches = batches.len(),
                    "flusher not ready before timeout, leftover batches dropped"
                );
                continue;
            }
            if let Err(e) = flusher.flush(&batches).await {
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

/// Group consecutive records sharing one context, keeping queue order.
fn runs_by_context(items: Vec<RecordWithContext>) -> Vec<(RecordContext, Vec<Record>)> {
    let mut runs: Vec<(RecordContext, Vec<Record>)> = Vec::new();
    for item in items {
        match runs.last_mut() {
            Some((context, logs)) if *context == item.context => logs.push(item.record),
            _ => runs.push((item.context, vec![item.record])),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_by_context_keeps_order() {
        let a = RecordContext::with_source("a");
        let b = RecordContext::with_source("b");
        let item = |ctx: &RecordContext, v: &str| {
            RecordWithContext::new([("content", v)].into_iter().collect(), ctx.clone())
        };
        let runs = runs_by_context(vec![
            item(&a, "1"),
            item(&a, "2"),
            item(&b, "3"),
            item(&a, "4"),
        ]);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].1.len(), 2);
        assert_eq!(runs[1].0, b);
        assert_eq!(runs[2].1[0].get("content"), Some("4"));
    }
}
