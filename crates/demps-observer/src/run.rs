//! One streaming run of the simulator.
//!
//! A run loads the directives, watches the simulator's output directory,
//! launches the simulator once the watcher is ready and turns every output
//! file of each dataset into one event on the subscriber's stream.
//!
//! ```text
//! Init -> AwaitingReady -> Running -> Finished | Errored
//!   \__________\______________\----> Disconnected
//! ```
//!
//! Everything a run creates is torn down when it ends, in a fixed order:
//! watchers first (no new paths), then processors, then the simulator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use demps_core::config::ServiceConfig;
use demps_core::directives::RunDirectives;
use demps_core::layout::DatasetLayout;
use demps_core::pool::{Closeable, PROCESS_KEY, ROOT_WATCHER_KEY, ResourcePool};
use demps_core::processor::{Aggregation, FileProcessor};
use demps_core::supervisor::{ProcessSupervisor, SupervisorError};
use demps_core::watcher::{DirectoryWatcher, WatchError, WatchEvent};
use demps_types::{RunId, RunStatus, StreamEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

/// Capacity of a subscriber's event channel.
pub const EVENT_BUFFER: usize = 256;

/// Event name of the agent dataset.
pub const AGENTS_DATASET: &str = "agents";

/// Pool key of the agent dataset watcher.
pub const AGENTS_WATCHER_KEY: &str = "agents_watcher";

/// Event name of the flood dataset.
pub const FLOOD_DATASET: &str = "flood";

/// Pool key of the flood dataset watcher.
pub const FLOOD_WATCHER_KEY: &str = "flood_watcher";

/// Start a run on the current runtime and return its event stream.
///
/// The stream ends when the run does. Dropping the receiver disconnects
/// the run, which then tears everything down.
pub fn start_run(
    pool: Arc<ResourcePool>,
    config: Arc<ServiceConfig>,
) -> (RunId, mpsc::Receiver<StreamEvent>) {
    let run_id = RunId::new();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let span = info_span!("run", %run_id);
    tokio::spawn(execute(pool, config, tx).instrument(span));
    (run_id, rx)
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Finished,
    Failed,
    Disconnected,
}

/// Messages from the task that owns the simulator.
#[derive(Debug)]
enum Outcome {
    Spawned { pid: u32 },
    Exited(Result<(), SupervisorError>),
}

async fn execute(
    pool: Arc<ResourcePool>,
    config: Arc<ServiceConfig>,
    events: mpsc::Sender<StreamEvent>,
) {
    info!("Connection started");
    let path = config.simulator.directives.clone();
    let directives = match RunDirectives::load(&path).await {
        Ok(directives) => directives,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Run directives unavailable");
            let _ = events.send(StreamEvent::Status(RunStatus::Error)).await;
            return;
        }
    };
    if events.send(StreamEvent::Status(RunStatus::Init)).await.is_err() {
        return;
    }

    let mut run = match Run::prepare(pool, config, directives, events.clone()).await {
        Ok(run) => run,
        Err(e) => {
            warn!(error = %e, "Failed to watch simulator output");
            let _ = events.send(StreamEvent::Status(RunStatus::Error)).await;
            return;
        }
    };
    drop(events);

    let end = run.drive().await;
    run.teardown().await;
    info!(?end, "Connection closed");
}

/// One streamed dataset and, once attached, its pipeline.
struct Dataset {
    name: &'static str,
    key: &'static str,
    dir: PathBuf,
    layout: Arc<DatasetLayout>,
    pipeline: Option<Pipeline>,
}

struct Pipeline {
    watcher: Arc<DirectoryWatcher>,
    processor: Arc<FileProcessor>,
    forward: JoinHandle<()>,
}

/// Datasets streamed for `directives`.
fn datasets(directives: &RunDirectives, config: &ServiceConfig) -> Vec<Dataset> {
    let mut datasets = vec![Dataset {
        name: AGENTS_DATASET,
        key: AGENTS_WATCHER_KEY,
        dir: directives.agents_dir.clone(),
        layout: Arc::new(config.datasets.agents.clone()),
        pipeline: None,
    }];
    if let Some(dir) = &directives.flood_dir {
        datasets.push(Dataset {
            name: FLOOD_DATASET,
            key: FLOOD_WATCHER_KEY,
            dir: dir.clone(),
            layout: Arc::new(config.datasets.flood.clone()),
            pipeline: None,
        });
    }
    datasets
}

struct Run {
    pool: Arc<ResourcePool>,
    config: Arc<ServiceConfig>,
    output_dir: PathBuf,
    events: mpsc::Sender<StreamEvent>,
    root: Arc<DirectoryWatcher>,
    root_events: mpsc::UnboundedReceiver<WatchEvent>,
    supervisor: Arc<ProcessSupervisor>,
    outcomes_tx: mpsc::UnboundedSender<Outcome>,
    outcomes: mpsc::UnboundedReceiver<Outcome>,
    aggregations_tx: Option<mpsc::UnboundedSender<Aggregation>>,
    aggregations: mpsc::UnboundedReceiver<Aggregation>,
    datasets: Vec<Dataset>,
    launched: bool,
}

impl Run {
    async fn prepare(
        pool: Arc<ResourcePool>,
        config: Arc<ServiceConfig>,
        directives: RunDirectives,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<Self, WatchError> {
        let (root, root_events) = DirectoryWatcher::watch(
            ROOT_WATCHER_KEY,
            &directives.output_dir,
            config.watcher.root_options(),
        )?;
        pool.add(ROOT_WATCHER_KEY, Arc::clone(&root));

        ProcessSupervisor::supersede(&pool, PROCESS_KEY).await;
        let spec = directives.program_spec(&config.simulator.executable);
        let supervisor = ProcessSupervisor::new(PROCESS_KEY, spec, config.simulator.kill_timeout());

        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let (aggregations_tx, aggregations) = mpsc::unbounded_channel();
        let datasets = datasets(&directives, &config);

        info!(
            output = %directives.output_dir.display(),
            agents = %directives.agents_dir.display(),
            flood = directives.flood_enabled(),
            "Run prepared, waiting for output watcher"
        );

        Ok(Self {
            pool,
            config,
            output_dir: directives.output_dir,
            events,
            root,
            root_events,
            supervisor,
            outcomes_tx,
            outcomes,
            aggregations_tx: Some(aggregations_tx),
            aggregations,
            datasets,
            launched: false,
        })
    }

    async fn emit(&self, event: StreamEvent) -> bool {
        if let Some(status) = event.status() {
            info!(%status, "Run status");
        }
        self.events.send(event).await.is_ok()
    }

    async fn drive(&mut self) -> RunEnd {
        let mut drain_deadline: Option<Instant> = None;
        let mut root_open = true;
        loop {
            tokio::select! {
                biased;
                () = self.events.closed() => {
                    info!("Subscriber disconnected");
                    return RunEnd::Disconnected;
                }
                Some(outcome) = self.outcomes.recv() => match outcome {
                    Outcome::Spawned { pid } => {
                        info!(pid, "Simulator running");
                        if !self.emit(StreamEvent::Status(RunStatus::Ready)).await {
                            return RunEnd::Disconnected;
                        }
                    }
                    Outcome::Exited(Ok(())) => {
                        let grace = self.config.stream.drain_grace();
                        info!(grace_ms = grace.as_millis(), "Simulator finished, draining output");
                        if !self.emit(StreamEvent::Status(RunStatus::Finished)).await {
                            return RunEnd::Disconnected;
                        }
                        drain_deadline = Some(Instant::now().checked_add(grace).unwrap_or_else(Instant::now));
                    }
                    Outcome::Exited(Err(e)) => {
                        warn!(error = %e, "Simulator failed");
                        self.close_watchers();
                        let _ = self.emit(StreamEvent::Status(RunStatus::Error)).await;
                        return RunEnd::Failed;
                    }
                },
                event = self.root_events.recv(), if root_open => match event {
                    Some(event) => self.on_root_event(event),
                    None => {
                        root_open = false;
                        if !self.launched {
                            // Superseded by a newer run or shut down before
                            // the simulator was started.
                            warn!("Output watcher closed before the simulator started");
                            let _ = self.emit(StreamEvent::Status(RunStatus::Error)).await;
                            return RunEnd::Failed;
                        }
                    }
                },
                Some(aggregation) = self.aggregations.recv() => {
                    if !self.forward(aggregation).await {
                        return RunEnd::Disconnected;
                    }
                }
                () = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                    return self.drain().await;
                }
            }
        }
    }

    fn on_root_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Ready => self.on_root_ready(),
            WatchEvent::DirAdded(path) => {
                if let Some(index) = self
                    .datasets
                    .iter()
                    .position(|d| d.pipeline.is_none() && d.dir == path)
                {
                    self.attach(index, false);
                }
            }
            WatchEvent::FileAdded(_) => {}
        }
    }

    fn on_root_ready(&mut self) {
        if self.launched {
            return;
        }
        self.launched = true;
        self.launch();

        // Leftovers from earlier runs are not streamed. Directories outside
        // the output root would never be announced, so they are attached up
        // front and reported when they appear.
        for index in 0..self.datasets.len() {
            let attach_now = self.datasets.get(index).is_some_and(|d| {
                d.dir.is_dir() || !announced_by(&self.output_dir, &d.dir)
            });
            if attach_now {
                self.attach(index, true);
            }
        }
    }

    fn launch(&self) {
        let supervisor = Arc::clone(&self.supervisor);
        let pool = Arc::clone(&self.pool);
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(
            async move {
                let result = match supervisor.start(&pool).await {
                    Ok(pid) => {
                        let _ = outcomes.send(Outcome::Spawned { pid });
                        supervisor.wait(&pool).await
                    }
                    Err(e) => Err(e),
                };
                let _ = outcomes.send(Outcome::Exited(result));
            }
            .in_current_span(),
        );
    }

    /// Start the watcher and processor of dataset `index`.
    fn attach(&mut self, index: usize, ignore_initial: bool) {
        let Some(output) = self.aggregations_tx.clone() else {
            return;
        };
        let Some(dataset) = self.datasets.get_mut(index) else {
            return;
        };
        let options = self.config.watcher.dataset_options(ignore_initial);
        let (watcher, mut paths) = match DirectoryWatcher::watch(dataset.key, &dataset.dir, options) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(dataset = dataset.name, error = %e, "Failed to watch dataset directory");
                return;
            }
        };
        self.pool.add(dataset.key, Arc::clone(&watcher));

        let processor = Arc::new(FileProcessor::spawn(
            dataset.name,
            Arc::clone(&dataset.layout),
            output,
        ));
        let forward = {
            let processor = Arc::clone(&processor);
            tokio::spawn(
                async move {
                    while let Some(event) = paths.recv().await {
                        if let WatchEvent::FileAdded(path) = event {
                            processor.push(path);
                        }
                    }
                }
                .in_current_span(),
            )
        };

        info!(
            dataset = dataset.name,
            path = %dataset.dir.display(),
            ignore_initial,
            "Dataset pipeline attached"
        );
        dataset.pipeline = Some(Pipeline {
            watcher,
            processor,
            forward,
        });
    }

    async fn forward(&self, aggregation: Aggregation) -> bool {
        debug!(
            dataset = %aggregation.dataset,
            path = %aggregation.path.display(),
            records = aggregation.records,
            "Forwarding aggregation"
        );
        self.emit(StreamEvent::Dataset {
            name: aggregation.dataset,
            payload: aggregation.payload,
        })
        .await
    }

    /// Stop taking new files, forward what the processors still hold,
    /// then end the run.
    async fn drain(&mut self) -> RunEnd {
        info!("Drain grace elapsed, closing pipelines");
        self.close_watchers();
        for pipeline in self.datasets.iter().filter_map(|d| d.pipeline.as_ref()) {
            pipeline.processor.finish();
        }
        self.aggregations_tx = None;

        loop {
            tokio::select! {
                biased;
                () = self.events.closed() => return RunEnd::Disconnected,
                next = self.aggregations.recv() => match next {
                    Some(aggregation) => {
                        if !self.forward(aggregation).await {
                            return RunEnd::Disconnected;
                        }
                    }
                    None => return RunEnd::Finished,
                },
            }
        }
    }

    fn close_watchers(&self) {
        self.root.close();
        self.pool.remove_if_same(ROOT_WATCHER_KEY, &self.root);
        for dataset in &self.datasets {
            if let Some(pipeline) = &dataset.pipeline {
                debug!(watcher = pipeline.watcher.label(), "Closing dataset watcher");
                pipeline.watcher.close();
                self.pool.remove_if_same(dataset.key, &pipeline.watcher);
            }
        }
    }

    async fn teardown(&mut self) {
        self.close_watchers();
        for dataset in &self.datasets {
            if let Some(pipeline) = &dataset.pipeline {
                let backlog = pipeline.processor.backlog();
                if backlog > 0 {
                    info!(
                        dataset = pipeline.processor.dataset(),
                        backlog,
                        "Discarding unprocessed output files"
                    );
                }
                pipeline.processor.close();
                pipeline.forward.abort();
            }
        }
        if self.supervisor.is_running() {
            self.supervisor.kill().await;
        }
    }
}

/// Whether `dir` would be announced by the watcher on `root`.
fn announced_by(root: &Path, dir: &Path) -> bool {
    dir.starts_with(root)
}
