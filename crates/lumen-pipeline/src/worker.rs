//! A background thread that owns the processing loop for one pipeline.
//!
//! Requests are tagged with a generation number that is passed through
//! to the outcome, so the caller can discard results of superseded
//! requests. When several requests are queued the worker runs only the
//! newest and reports the others as cancelled.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, trace};

use crate::context::ProcessContext;
use crate::history::Develop;
use crate::pipeline::Pipeline;
use crate::roi::Roi;
use crate::types::{AbortReason, Frame, ProcessError};

/// What the worker should compute.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Region of the final output.
    pub roi: Roi,
    /// Focus, pickers, and cancellation.
    pub ctx: ProcessContext,
    /// Skip the display clamp stage for this request.
    pub no_gamma: bool,
}

impl ProcessRequest {
    /// A headless request for `roi`.
    #[must_use]
    pub fn new(roi: Roi) -> Self {
        Self {
            roi,
            ctx: ProcessContext::headless(),
            no_gamma: false,
        }
    }
}

/// Result of one request.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// Generation of the request this answers.
    pub generation: u64,
    /// The published frame, or why there is none.
    pub result: Result<Frame, ProcessError>,
}

struct Job {
    generation: u64,
    request: ProcessRequest,
}

/// Handle to a pipeline's processing thread. Dropping it stops the
/// thread after the current request.
pub struct PipelineWorker {
    jobs: Option<Sender<Job>>,
    outcomes: Receiver<WorkerOutcome>,
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl std::fmt::Debug for PipelineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineWorker")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl PipelineWorker {
    /// Start the processing thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(pipe: Arc<Pipeline>, dev: Arc<Develop>) -> std::io::Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        let name = format!("lumen-{}", pipe.purpose());
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&pipe, &dev, &job_rx, &out_tx))?;
        Ok(Self {
            jobs: Some(job_tx),
            outcomes: out_rx,
            handle: Some(handle),
            generation: 0,
        })
    }

    /// Queue a request. Returns its generation.
    pub fn submit(&mut self, request: ProcessRequest) -> u64 {
        self.generation += 1;
        let generation = self.generation;
        if let Some(jobs) = &self.jobs {
            // A send only fails once the thread is gone; `recv` then
            // reports the disconnect.
            let _ = jobs.send(Job {
                generation,
                request,
            });
        }
        generation
    }

    /// Generation of the most recent request.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the next outcome.
    #[must_use]
    pub fn recv(&self) -> Option<WorkerOutcome> {
        self.outcomes.recv().ok()
    }

    /// Wait up to `timeout` for the next outcome.
    #[must_use]
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<WorkerOutcome> {
        match self.outcomes.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take an outcome if one is ready.
    #[must_use]
    pub fn try_recv(&self) -> Option<WorkerOutcome> {
        self.outcomes.try_recv().ok()
    }

    /// Wait for the outcome of the most recent request, dropping older
    /// ones.
    #[must_use]
    pub fn wait_latest(&self) -> Option<WorkerOutcome> {
        loop {
            let outcome = self.recv()?;
            if outcome.generation == self.generation {
                return Some(outcome);
            }
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.jobs = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(pipe: &Pipeline, dev: &Develop, jobs: &Receiver<Job>, outcomes: &Sender<WorkerOutcome>) {
    debug!(purpose = %pipe.purpose(), "worker started");
    while let Ok(mut job) = jobs.recv() {
        loop {
            match jobs.try_recv() {
                Ok(newer) => {
                    trace!(generation = job.generation, "superseded");
                    let _ = outcomes.send(WorkerOutcome {
                        generation: job.generation,
                        result: Err(ProcessError::Aborted(AbortReason::Cancelled)),
                    });
                    job = newer;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if !pipe.pending_change().is_empty() {
            pipe.change(dev);
        }
        let Job {
            generation,
            request,
        } = job;
        let result = if request.no_gamma {
            pipe.process_no_gamma(dev, &request.ctx, request.roi)
        } else {
            pipe.process(dev, &request.ctx, request.roi)
        };
        let result = result.and_then(|()| pipe.backbuffer().ok_or(ProcessError::NoInput));
        if outcomes.send(WorkerOutcome { generation, result }).is_err() {
            break;
        }
    }
    debug!(purpose = %pipe.purpose(), "worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::history::HistoryItem;
    use crate::registry::StageRegistry;
    use crate::types::{BaseImage, PipePurpose, PipelineConfig, Rgba32FImage};

    fn setup() -> (Arc<Pipeline>, Arc<Develop>) {
        let dev = Arc::new(Develop::new(
            Arc::new(StageRegistry::with_builtin_stages()),
            vec!["exposure".to_owned(), "gamma".to_owned()],
        ));
        let pipe = Arc::new(Pipeline::new(PipePurpose::Full, PipelineConfig::default()).unwrap());
        pipe.create_nodes(&dev);
        pipe.synch_all(&dev);
        let pixels = Rgba32FImage::from_pixel(4, 4, image::Rgba([0.25, 0.25, 0.25, 1.0]));
        pipe.set_input(BaseImage::new(7, pixels, 1.0));
        (pipe, dev)
    }

    #[test]
    fn outcome_carries_request_generation() {
        let (pipe, dev) = setup();
        let mut worker = PipelineWorker::spawn(pipe, dev).unwrap();
        let generation = worker.submit(ProcessRequest::new(Roi::new(0, 0, 4, 4, 1.0)));
        let outcome = worker.wait_latest().unwrap();
        assert_eq!(outcome.generation, generation);
        let frame = outcome.result.unwrap();
        assert_eq!(frame.width(), 4);
        assert!((frame.pixels()[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn pending_history_change_is_applied_before_processing() {
        let (pipe, dev) = setup();
        dev.push(HistoryItem::new("exposure", br#"{"ev": 1.0}"#.to_vec()));
        pipe.request_change(crate::pipeline::PipeChange::TOP_CHANGED);
        let mut worker = PipelineWorker::spawn(pipe, dev).unwrap();
        worker.submit(ProcessRequest::new(Roi::new(0, 0, 4, 4, 1.0)));
        let frame = worker.wait_latest().unwrap().result.unwrap();
        assert!((frame.pixels()[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn every_request_gets_an_answer() {
        let (pipe, dev) = setup();
        let mut worker = PipelineWorker::spawn(pipe, dev).unwrap();
        for _ in 0..5 {
            worker.submit(ProcessRequest::new(Roi::new(0, 0, 2, 2, 1.0)));
        }
        let mut seen = Vec::new();
        while seen.len() < 5 {
            seen.push(worker.recv().unwrap().generation);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
