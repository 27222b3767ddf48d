use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinSet};

use crate::{
    balancer::{AssertionFailed, LifecycleError},
    context::ContextError,
    journal::Day,
    lexer::ParseError,
    prices::PriceError,
};

/// Buffer size of the channels between adjacent stages.
const BUF_SIZE: usize = 100;

/// Any error a pipeline stage can surface.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Assertion(#[from] AssertionFailed),
    #[error(transparent)]
    Price(#[from] PriceError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("pipeline cancelled")]
    Cancelled,
}

/// A stage error wrapped with the name of the stage that produced it.
#[derive(Debug, Error)]
#[error("{stage}: {source}")]
pub struct PipelineError {
    pub stage: &'static str,
    #[source]
    pub source: ProcessError,
}

/// Sends a day downstream. A send on a closed channel means the run was
/// cancelled by a downstream failure.
pub async fn push(out: &mpsc::Sender<Day>, day: Day) -> Result<(), ProcessError> {
    out.send(day).await.map_err(|_| ProcessError::Cancelled)
}

#[async_trait]
pub trait Source: Send + 'static {
    fn name(&self) -> &'static str;
    async fn run(&mut self, out: mpsc::Sender<Day>) -> Result<(), ProcessError>;
}

#[async_trait]
pub trait Stage: Send + 'static {
    fn name(&self) -> &'static str;
    async fn run(
        &mut self,
        input: mpsc::Receiver<Day>,
        out: mpsc::Sender<Day>,
    ) -> Result<(), ProcessError>;
}

#[async_trait]
pub trait Sink: Send + 'static {
    fn name(&self) -> &'static str;
    async fn run(&mut self, input: mpsc::Receiver<Day>) -> Result<(), ProcessError>;
}

/// Composes a source, processing stages and a sink into a running pipeline.
///
/// Every stage runs as its own task; adjacent stages are connected by
/// bounded channels. Days traverse the stages in the order the source
/// emits them. The first error cancels the whole run and is returned,
/// wrapped with the failing stage's name.
pub struct Engine {
    source: Box<dyn Source>,
    stages: Vec<Box<dyn Stage>>,
    sink: Box<dyn Sink>,
}

impl Engine {
    pub fn new(source: Box<dyn Source>, sink: Box<dyn Sink>) -> Engine {
        Engine {
            source,
            stages: Vec::new(),
            sink,
        }
    }

    pub fn add(&mut self, stage: Box<dyn Stage>) -> &mut Engine {
        self.stages.push(stage);
        self
    }

    pub async fn process(self) -> Result<(), PipelineError> {
        let mut set: JoinSet<(&'static str, Result<(), ProcessError>)> = JoinSet::new();

        let (tx, mut rx) = mpsc::channel(BUF_SIZE);
        let mut source = self.source;
        set.spawn(async move {
            let name = source.name();
            (name, source.run(tx).await)
        });
        for mut stage in self.stages {
            let (tx, next_rx) = mpsc::channel(BUF_SIZE);
            let prev_rx = rx;
            rx = next_rx;
            set.spawn(async move {
                let name = stage.name();
                (name, stage.run(prev_rx, tx).await)
            });
        }
        let mut sink = self.sink;
        set.spawn(async move {
            let name = sink.name();
            (name, sink.run(rx).await)
        });

        let mut cancelled: Option<&'static str> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((stage, Err(ProcessError::Cancelled))) => {
                    cancelled.get_or_insert(stage);
                }
                Ok((stage, Err(source))) => {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    return Err(PipelineError { stage, source });
                }
                Err(join_err) => {
                    if join_err.is_panic() {
                        std::panic::resume_unwind(join_err.into_panic());
                    }
                }
            }
        }
        match cancelled {
            Some(stage) => Err(PipelineError {
                stage,
                source: ProcessError::Cancelled,
            }),
            None => Ok(()),
        }
    }
}
