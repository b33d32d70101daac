//! Background solve worker.
//!
//! The controller moves onto a dedicated thread. The control loop hands it
//! one request at a time and collects the outcome either blocking or by
//! polling, depending on its stale policy.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use rover_core::error::{OptimizationError, SimError};
use rover_mpc::{MpcController, MpcRequest, OptimizerResult};
use tracing::debug;

/// What the worker sends back for one request.
pub type SolveOutcome = Result<OptimizerResult, OptimizationError>;

/// Owns the solver thread. At most one request is in flight.
pub struct SolveWorker {
    requests: Option<Sender<MpcRequest>>,
    results: Receiver<SolveOutcome>,
    handle: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl SolveWorker {
    /// Move `controller` onto a new thread named `mpc-solver`.
    pub fn spawn(controller: MpcController) -> Result<Self, SimError> {
        let (request_tx, request_rx) = bounded::<MpcRequest>(1);
        let (result_tx, result_rx) = bounded::<SolveOutcome>(1);

        let handle = thread::Builder::new()
            .name("mpc-solver".into())
            .spawn(move || {
                for request in &request_rx {
                    let outcome = controller.solve(&request);
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
                debug!("solve worker exiting");
            })?;

        Ok(Self {
            requests: Some(request_tx),
            results: result_rx,
            handle: Some(handle),
            in_flight: false,
        })
    }

    /// A request was submitted and its outcome not yet collected.
    pub const fn is_busy(&self) -> bool {
        self.in_flight
    }

    /// Hand a request to the worker. Callers check [`is_busy`](Self::is_busy) first;
    /// submitting while busy waits for the worker to take the request.
    pub fn submit(&mut self, request: MpcRequest) -> Result<(), SimError> {
        let sender = self.requests.as_ref().ok_or(SimError::WorkerDisconnected)?;
        sender.send(request).map_err(|_| SimError::WorkerDisconnected)?;
        self.in_flight = true;
        Ok(())
    }

    /// Collect the outcome if it is ready.
    pub fn try_recv(&mut self) -> Result<Option<SolveOutcome>, SimError> {
        match self.results.try_recv() {
            Ok(outcome) => {
                self.in_flight = false;
                Ok(Some(outcome))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SimError::WorkerDisconnected),
        }
    }

    /// Wait for the outcome of the in-flight request.
    pub fn recv(&mut self) -> Result<SolveOutcome, SimError> {
        let outcome = self.results.recv().map_err(|_| SimError::WorkerDisconnected)?;
        self.in_flight = false;
        Ok(outcome)
    }
}

impl std::fmt::Debug for SolveWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolveWorker")
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl Drop for SolveWorker {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
