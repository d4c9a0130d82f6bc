use crate::model::{InferenceModel, RequestMetadata};
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

type Metadata<M> = <<M as InferenceModel>::Request as RequestMetadata>::Metadata;

type EngineReply<M> =
    Result<EngineResponse<Metadata<M>, <M as InferenceModel>::Response>, EngineError>;

/// Represents the current state of the inference engine.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineState {
    /// The engine is waiting for requests.
    Idle,
    /// The engine is running an inference.
    Processing,
}

impl EngineState {
    /// Returns the state as a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Processing => "processing",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Inference engine is stopped")]
    Stopped,

    #[error("Inference worker exited unexpectedly")]
    WorkerExited,

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Response returned by the engine with the model's response and telemetry data.
pub struct EngineResponse<Metadata, Res> {
    /// Identifier assigned to the request when it was submitted.
    pub id: u64,
    /// Timestamp when the inference started.
    pub start_time: Instant,
    /// Total time taken for the inference.
    pub duration: Duration,
    /// Lightweight metadata extracted from the original request.
    pub request_metadata: Metadata,
    /// The actual response from the model.
    pub response: Res,
}

struct EngineRequest<M: InferenceModel> {
    id: u64,
    request: M::Request,
    reply: oneshot::Sender<EngineReply<M>>,
}

/// Runs a model on a dedicated thread and serves requests one at a time.
///
/// The model is moved into the worker thread so inference never blocks the
/// async runtime. Each request carries its own reply channel; callers await
/// the result with [`InferenceEngine::run`].
pub struct InferenceEngine<M: InferenceModel + Send + 'static>
where
    M::Request: Send + 'static,
    M::Response: Send + 'static,
{
    state: Arc<Mutex<EngineState>>,
    req_tx: Option<mpsc::Sender<EngineRequest<M>>>,
    inference_handle: Option<JoinHandle<()>>,
    id_counter: AtomicU64,
}

impl<M: InferenceModel + Send + 'static> InferenceEngine<M>
where
    M::Request: Send + 'static,
    M::Response: Send + 'static,
{
    /// Creates a new inference engine and moves the model to its worker thread.
    pub fn new(mut model: M) -> Self {
        let (req_tx, req_rx) = mpsc::channel::<EngineRequest<M>>();
        let state = Arc::new(Mutex::new(EngineState::Idle));

        let inference_handle = std::thread::spawn({
            let state = state.clone();
            move || {
                while let Ok(EngineRequest { id, request, reply }) = req_rx.recv() {
                    log::debug!("Running inference {id}");

                    // Extract lightweight metadata before consuming the request
                    let request_metadata = request.metadata();

                    set_state(&state, EngineState::Processing);
                    let start_time = Instant::now();
                    // a panicking model fails this request only
                    let result = catch_unwind(AssertUnwindSafe(|| model.run(request)));
                    let duration = start_time.elapsed();
                    set_state(&state, EngineState::Idle);

                    let result = match result {
                        Ok(Ok(response)) => {
                            log::debug!("Inference {id} completed in {duration:?}");
                            Ok(EngineResponse {
                                id,
                                start_time,
                                duration,
                                request_metadata,
                                response,
                            })
                        }
                        Ok(Err(e)) => {
                            log::error!("Inference {id} failed: {e}");
                            Err(EngineError::Inference(e.to_string()))
                        }
                        Err(payload) => {
                            let msg = panic_message(payload.as_ref());
                            log::error!("Inference {id} panicked: {msg}");
                            Err(EngineError::Inference(format!("model panicked: {msg}")))
                        }
                    };

                    if reply.send(result).is_err() {
                        log::warn!("Caller of inference {id} went away before the result");
                    }
                }
                log::debug!("Inference worker finished");
            }
        });

        Self {
            state,
            req_tx: Some(req_tx),
            inference_handle: Some(inference_handle),
            id_counter: AtomicU64::new(0),
        }
    }

    /// Returns the current state of the inference engine.
    pub fn state(&self) -> EngineState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Submits a request and waits for the model's response.
    ///
    /// Requests are served in arrival order. A model error fails only this
    /// request; the worker keeps running.
    pub async fn run(&self, request: M::Request) -> EngineReply<M> {
        let tx = self.req_tx.as_ref().ok_or(EngineError::Stopped)?;
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        // the worker only drops its receiver or a reply sender when it dies
        tx.send(EngineRequest { id, request, reply })
            .map_err(|_| EngineError::WorkerExited)?;

        rx.await.map_err(|_| EngineError::WorkerExited)?
    }

    /// Stops the inference engine and joins the worker thread.
    ///
    /// Requests already queued are still processed before the worker exits.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(handle) = self.inference_handle.take() {
            if handle.join().is_err() {
                log::error!("Inference worker panicked");
            }
        }
    }
}

impl<M: InferenceModel + Send + 'static> Drop for InferenceEngine<M>
where
    M::Request: Send + 'static,
    M::Response: Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<EngineState>, value: EngineState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Number(u32);

    impl RequestMetadata for Number {
        type Metadata = u32;

        fn metadata(&self) -> Self::Metadata {
            self.0
        }
    }

    // doubles its input, fails on zero and panics on 13
    struct Doubler;

    impl InferenceModel for Doubler {
        type Request = Number;
        type Response = u32;
        type Error = std::io::Error;

        fn run(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error> {
            if request.0 == 0 {
                return Err(std::io::Error::other("zero is not allowed"));
            }
            if request.0 == 13 {
                panic!("unlucky number");
            }
            Ok(request.0 * 2)
        }
    }

    #[tokio::test]
    async fn run_returns_response_and_metadata() -> Result<(), EngineError> {
        let engine = InferenceEngine::new(Doubler);

        let first = engine.run(Number(21)).await?;
        assert_eq!(first.response, 42);
        assert_eq!(first.request_metadata, 21);
        assert_eq!(first.id, 0);

        let second = engine.run(Number(5)).await?;
        assert_eq!(second.response, 10);
        assert_eq!(second.id, 1);

        assert_eq!(engine.state(), EngineState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn model_error_does_not_stop_the_worker() -> Result<(), EngineError> {
        let engine = InferenceEngine::new(Doubler);

        match engine.run(Number(0)).await {
            Err(EngineError::Inference(msg)) => assert!(msg.contains("zero")),
            other => panic!("unexpected result: {:?}", other.map(|r| r.response)),
        }

        let response = engine.run(Number(3)).await?;
        assert_eq!(response.response, 6);
        Ok(())
    }

    #[tokio::test]
    async fn model_panic_fails_only_that_request() -> Result<(), EngineError> {
        let engine = InferenceEngine::new(Doubler);

        match engine.run(Number(13)).await {
            Err(EngineError::Inference(msg)) => assert!(msg.contains("unlucky number"), "{msg}"),
            other => panic!("unexpected result: {:?}", other.map(|r| r.response)),
        }
        assert_eq!(engine.state(), EngineState::Idle);

        let response = engine.run(Number(4)).await?;
        assert_eq!(response.response, 8);
        assert_eq!(engine.state(), EngineState::Idle);
        Ok(())
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_replies() -> Result<(), EngineError> {
        let engine = Arc::new(InferenceEngine::new(Doubler));

        let handles = (1..=8)
            .map(|n| {
                let engine = engine.clone();
                tokio::spawn(async move { (n, engine.run(Number(n)).await) })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            let (n, result) = handle.await.expect("task panicked");
            let result = result?;
            assert_eq!(result.response, n * 2);
            assert_eq!(result.request_metadata, n);
        }
        Ok(())
    }

    // a request whose metadata extraction brings the worker down
    struct Poison;

    impl RequestMetadata for Poison {
        type Metadata = ();

        fn metadata(&self) -> Self::Metadata {
            panic!("cannot describe request");
        }
    }

    struct Unreachable;

    impl InferenceModel for Unreachable {
        type Request = Poison;
        type Response = ();
        type Error = std::io::Error;

        fn run(&mut self, _request: Self::Request) -> Result<Self::Response, Self::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn dead_worker_is_not_reported_as_stopped() {
        let engine = InferenceEngine::new(Unreachable);

        assert!(matches!(
            engine.run(Poison).await,
            Err(EngineError::WorkerExited)
        ));
        assert!(matches!(
            engine.run(Poison).await,
            Err(EngineError::WorkerExited)
        ));
    }

    #[tokio::test]
    async fn run_after_stop_fails() {
        let mut engine = InferenceEngine::new(Doubler);
        engine.stop();
        assert!(matches!(
            engine.run(Number(1)).await,
            Err(EngineError::Stopped)
        ));
    }

    #[test]
    fn state_as_str() {
        assert_eq!(EngineState::Idle.as_str(), "idle");
        assert_eq!(EngineState::Processing.as_str(), "processing");
    }
}
