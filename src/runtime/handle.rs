//! Thread-safe handle to a session running on its own thread.
//!
//! A [`ScriptRuntimeSession`] is bound to the thread that created it. The
//! handle spawns a dedicated OS thread with a single-threaded Tokio runtime,
//! creates the session there and forwards work through [`SessionCommand`].
//! Values cross the thread boundary as JSON.

use crate::runtime::config::SessionConfig;
use crate::runtime::error::HostError;
use crate::runtime::logging::LoggingSink;
use crate::runtime::session::ScriptRuntimeSession;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce(&mut ScriptRuntimeSession) + Send>;

/// Commands sent to the session thread.
pub enum SessionCommand {
    Execute(Job),
    Shutdown { responder: mpsc::Sender<()> },
}

fn spawn_session_thread(
    config: SessionConfig,
    sink: LoggingSink,
) -> Result<async_mpsc::UnboundedSender<SessionCommand>, HostError> {
    let (cmd_tx, cmd_rx) = async_mpsc::unbounded_channel::<SessionCommand>();
    let (init_tx, init_rx) = mpsc::channel::<Result<(), HostError>>();

    std::thread::Builder::new()
        .name("script-host-session".to_string())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(HostError::Thread(format!(
                        "failed to build tokio runtime: {err}"
                    ))));
                    return;
                }
            };

            let session = match ScriptRuntimeSession::with_logging_sink(config, sink) {
                Ok(session) => {
                    let _ = init_tx.send(Ok(()));
                    session
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            tokio_rt.block_on(run(session, cmd_rx));
        })
        .map_err(|e| HostError::Thread(format!("failed to spawn session thread: {e}")))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(cmd_tx),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(HostError::Thread("session thread initialization failed".to_string())),
    }
}

async fn run(
    mut session: ScriptRuntimeSession,
    mut rx: async_mpsc::UnboundedReceiver<SessionCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SessionCommand::Execute(job) => job(&mut session),
            SessionCommand::Shutdown { responder } => {
                session.destroy();
                let _ = responder.send(());
                return;
            }
        }
    }
    session.destroy();
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: Option<async_mpsc::UnboundedSender<SessionCommand>>,
    shutdown: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn spawn(config: SessionConfig) -> Result<Self, HostError> {
        Self::spawn_with_logging_sink(config, LoggingSink::process())
    }

    pub fn spawn_with_logging_sink(
        config: SessionConfig,
        sink: LoggingSink,
    ) -> Result<Self, HostError> {
        let tx = spawn_session_thread(config, sink)?;
        Ok(Self {
            tx: Some(tx),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    fn sender(&self) -> Result<&async_mpsc::UnboundedSender<SessionCommand>, HostError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(HostError::Shutdown);
        }
        self.tx.as_ref().ok_or(HostError::Shutdown)
    }

    /// Run `f` against the session and wait for its result.
    pub fn with_session<F, R>(&self, f: F) -> Result<R, HostError>
    where
        F: FnOnce(&mut ScriptRuntimeSession) -> R + Send + 'static,
        R: Send + 'static,
    {
        let sender = self.sender()?;
        let (result_tx, result_rx) = mpsc::channel();

        sender
            .send(SessionCommand::Execute(Box::new(move |session| {
                let _ = result_tx.send(f(session));
            })))
            .map_err(|_| HostError::Thread("failed to send command".to_string()))?;

        result_rx
            .recv()
            .map_err(|_| HostError::Thread("failed to receive result".to_string()))
    }

    /// Async variant of [`with_session`](Self::with_session).
    pub async fn with_session_async<F, R>(&self, f: F) -> Result<R, HostError>
    where
        F: FnOnce(&mut ScriptRuntimeSession) -> R + Send + 'static,
        R: Send + 'static,
    {
        let sender = self.sender()?.clone();
        let (result_tx, result_rx) = oneshot::channel();

        sender
            .send(SessionCommand::Execute(Box::new(move |session| {
                let _ = result_tx.send(f(session));
            })))
            .map_err(|_| HostError::Thread("failed to send command".to_string()))?;

        result_rx
            .await
            .map_err(|_| HostError::Thread("failed to receive result".to_string()))
    }

    pub fn run_script_sync(
        &self,
        source: &str,
        source_url: &str,
    ) -> Result<serde_json::Value, HostError> {
        let (source, source_url) = (source.to_string(), source_url.to_string());
        self.with_session(move |session| {
            let value = session.run_script(&source, &source_url)?;
            session.to_json_value(&value)
        })?
    }

    pub async fn run_script_async(
        &self,
        source: &str,
        source_url: &str,
    ) -> Result<serde_json::Value, HostError> {
        let (source, source_url) = (source.to_string(), source_url.to_string());
        self.with_session_async(move |session| {
            let value = session.run_script(&source, &source_url)?;
            session.to_json_value(&value)
        })
        .await?
    }

    pub fn run_from_path_sync(
        &self,
        path: impl Into<PathBuf>,
        source_url: &str,
    ) -> Result<serde_json::Value, HostError> {
        let (path, source_url) = (path.into(), source_url.to_string());
        self.with_session(move |session| {
            let value = session.run_from_path(&path, &source_url)?;
            session.to_json_value(&value)
        })?
    }

    pub fn compile_cache_sync(
        &self,
        source_path: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
    ) -> Result<(), HostError> {
        let (source_path, cache_path) = (source_path.into(), cache_path.into());
        self.with_session(move |session| session.compile_cache(&source_path, &cache_path))?
    }

    pub fn run_with_cache_sync(
        &self,
        source_path: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
        source_url: &str,
    ) -> Result<serde_json::Value, HostError> {
        let (source_path, cache_path) = (source_path.into(), cache_path.into());
        let source_url = source_url.to_string();
        self.with_session(move |session| {
            let value = session.run_with_cache(&source_path, &cache_path, &source_url)?;
            session.to_json_value(&value)
        })?
    }

    pub fn get_global_sync(&self, name: &str) -> Result<String, HostError> {
        let name = name.to_string();
        self.with_session(move |session| session.get_global(&name))?
    }

    pub fn set_global_sync(&self, name: &str, json: &str) -> Result<(), HostError> {
        let (name, json) = (name.to_string(), json.to_string());
        self.with_session(move |session| session.set_global(&name, &json))?
    }

    pub fn register_sync_hook<F>(&self, handler: F) -> Result<(), HostError>
    where
        F: Fn(u32, u32, &str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.with_session(move |session| session.register_sync_hook(handler))?
    }

    pub fn register_flush_hook<F>(&self, handler: F) -> Result<(), HostError>
    where
        F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    {
        self.with_session(move |session| session.register_flush_hook(handler))?
    }

    pub fn call_function_return_flushed_queue(
        &self,
        module: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, HostError> {
        let (module, method) = (module.to_string(), method.to_string());
        self.with_session(move |session| {
            session.call_function_return_flushed_queue(&module, &method, &args)
        })?
    }

    pub fn invoke_callback_and_return_flushed_queue(
        &self,
        callback_id: i64,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, HostError> {
        self.with_session(move |session| {
            session.invoke_callback_and_return_flushed_queue(callback_id, &args)
        })?
    }

    pub fn flushed_queue(&self) -> Result<serde_json::Value, HostError> {
        self.with_session(|session| session.flushed_queue())?
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the session thread. Idempotent.
    pub fn close(&mut self) -> Result<(), HostError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            self.tx.take();
            return Ok(());
        }

        if let Some(tx) = self.tx.take() {
            let (result_tx, result_rx) = mpsc::channel();
            tx.send(SessionCommand::Shutdown {
                responder: result_tx,
            })
            .map_err(|_| HostError::Thread("failed to send shutdown command".to_string()))?;
            result_rx
                .recv()
                .map_err(|_| HostError::Thread("failed to confirm shutdown".to_string()))?;
        }
        Ok(())
    }
}
