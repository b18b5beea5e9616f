//! Chat engine
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain raw
//! pointers that are not `Send`, and the context borrows the model. The engine
//! therefore loads the model on a dedicated worker thread and keeps the model,
//! the runtime and the [`ChatSession`] in that thread's stack frame until
//! shutdown. The caller talks to the session over a command channel; each call
//! blocks until the worker answers.
//!
//! Events are delivered to the sink on the worker thread. Cancellation goes
//! through the shared [`SessionControl`] and needs no round trip. A turn is
//! claimed on the caller's side before it is sent, so a second turn arriving
//! while one runs is rejected with [`ChatError::Busy`] instead of queued.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::inference::error::ChatError;
use crate::inference::generate::LoopState;
use crate::inference::llama::ModelBundle;
use crate::inference::runtime::{ModalitySupport, ModelRuntime};
use crate::inference::session::{report, ChatSession, SessionConfig, SessionControl};
use crate::inference::streaming::{EventSink, SharedSink};

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadMedia {
        path: PathBuf,
        response_tx: Sender<Result<(), ChatError>>,
    },
    Respond {
        prompt: String,
        response_tx: Sender<Result<LoopState, ChatError>>,
    },
    ClearHistory {
        response_tx: Sender<Result<(), ChatError>>,
    },
    Shutdown,
}

/// Handle on a chat session running on its own thread.
pub struct ChatEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    control: SessionControl,
    modality: ModalitySupport,
    /// Same sink the session reports to, for rejections raised here
    sink: SharedSink,
}

impl ChatEngine {
    /// Loads the model and projector described by `config` and starts a session.
    ///
    /// Blocks until loading finished. Failures are reported through `sink`
    /// before they are returned.
    pub fn start(config: SessionConfig, sink: Box<dyn EventSink>) -> Result<Self, ChatError> {
        let control = SessionControl::new();
        let worker_control = control.clone();
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("llamaratti-worker".to_string())
            .spawn(move || {
                llama_worker_main(config, sink, worker_control, ready_tx, command_rx);
            })
            .map_err(|e| ChatError::Worker(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok((modality, sink))) => {
                tracing::info!("Chat engine worker thread started");
                Ok(Self {
                    command_tx: Some(command_tx),
                    worker_handle: Some(handle),
                    control,
                    modality,
                    sink,
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(e) => {
                let _ = handle.join();
                Err(ChatError::Worker(format!("worker exited during load: {e}")))
            }
        }
    }

    /// Runs an already initialized session on a worker thread.
    pub fn with_session<R>(session: ChatSession<R>) -> Result<Self, ChatError>
    where
        R: ModelRuntime + Send + 'static,
        R::Media: Send,
    {
        let control = session.control();
        let modality = session.modality();
        let sink = session.sink();
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let handle = thread::Builder::new()
            .name("llamaratti-worker".to_string())
            .spawn(move || serve(session, command_rx))
            .map_err(|e| ChatError::Worker(e.to_string()))?;

        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            control,
            modality,
            sink,
        })
    }

    /// Media kinds the loaded projector accepts
    pub fn modality(&self) -> ModalitySupport {
        self.modality
    }

    /// Handle for cancelling generation from any thread
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Requests cancellation of the running turn
    pub fn stop_generating(&self) {
        self.control.stop_generating();
    }

    pub fn is_generating(&self) -> bool {
        self.control.is_generating()
    }

    /// Returns true from the moment a turn is accepted until it returns
    pub fn is_responding(&self) -> bool {
        self.control.is_turn_active()
    }

    /// Queues a media file for the next turn.
    pub fn load_media<P: AsRef<Path>>(&self, path: P) -> Result<(), ChatError> {
        let path = path.as_ref().to_path_buf();
        self.request(|response_tx| WorkerCommand::LoadMedia { path, response_tx })?
    }

    /// Runs a full turn and returns once the response has been streamed.
    ///
    /// Fails with [`ChatError::Busy`] while another turn is in progress.
    pub fn respond(&self, prompt: &str) -> Result<LoopState, ChatError> {
        if !self.control.try_begin_turn() {
            let mut sink = self.sink.clone();
            return Err(report(&mut sink, "respond", ChatError::Busy));
        }

        let prompt = prompt.to_string();
        let result = self.request(|response_tx| WorkerCommand::Respond {
            prompt,
            response_tx,
        });
        self.control.end_turn();
        result?
    }

    /// Starts a new conversation on the loaded model.
    pub fn clear_history(&self) -> Result<(), ChatError> {
        self.request(|response_tx| WorkerCommand::ClearHistory { response_tx })
            .map_err(|e| ChatError::History(e.to_string()))?
    }

    fn request<T>(
        &self,
        command: impl FnOnce(Sender<T>) -> WorkerCommand,
    ) -> Result<T, ChatError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| ChatError::Worker("engine is shut down".to_string()))?;

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(command(response_tx))
            .map_err(|e| ChatError::Worker(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| ChatError::Worker(e.to_string()))
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        self.control.stop_generating();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
        tracing::debug!("Chat engine stopped");
    }
}

/// Worker thread entry for a llama.cpp session.
///
/// The model bundle lives in this frame; the runtime and session borrow it.
fn llama_worker_main(
    config: SessionConfig,
    mut sink: Box<dyn EventSink>,
    control: SessionControl,
    ready_tx: Sender<Result<(ModalitySupport, SharedSink), ChatError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    const OP: &str = "initialize";

    let bundle = match config.validate().and_then(|()| ModelBundle::load(&config)) {
        Ok(bundle) => bundle,
        Err(e) => {
            let _ = ready_tx.send(Err(report(sink.as_mut(), OP, e)));
            return;
        }
    };

    let runtime = match bundle.runtime(&config) {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(report(sink.as_mut(), OP, e)));
            return;
        }
    };

    let session = match ChatSession::initialize_with_control(runtime, &config, sink, control) {
        Ok(session) => session,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if ready_tx.send(Ok((session.modality(), session.sink()))).is_err() {
        tracing::debug!("Engine handle dropped during load");
        return;
    }

    serve(session, command_rx);
}

/// Processes commands until shutdown or until the engine handle is dropped.
fn serve<R: ModelRuntime>(mut session: ChatSession<R>, command_rx: Receiver<WorkerCommand>) {
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::LoadMedia { path, response_tx }) => {
                let _ = response_tx.send(session.load_media(&path));
            }
            Ok(WorkerCommand::Respond {
                prompt,
                response_tx,
            }) => {
                let _ = response_tx.send(session.respond(&prompt));
            }
            Ok(WorkerCommand::ClearHistory { response_tx }) => {
                let _ = response_tx.send(session.clear_history());
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}
