//! Process-wide interpreter façade.
//!
//! Embedding hosts usually want a single VM per process that comes up on
//! first use. [`Interpreter`] provides that: the first `enqueue` creates and
//! starts the VM and registers it globally; later calls, from any
//! `Interpreter`, reuse it. [`Vm`] handles remain available for hosts that
//! manage lifecycles themselves.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use vmhost_common::{RuntimeConfig, VmError};

use crate::completion::{Completion, CompletionTask};
use crate::listener::LogListener;
use crate::script::Script;
use crate::vm::Vm;

/// Completion result when the VM could not be created.
pub const STATUS_CREATE_FAILED: i32 = 2;

/// Completion result when the VM could not be started.
pub const STATUS_START_FAILED: i32 = 3;

type VmFactory = dyn Fn(&RuntimeConfig) -> Result<Vm, VmError> + Send + Sync;

static GLOBAL_VM: Mutex<Option<Arc<Vm>>> = Mutex::new(None);

/// Handle to the process-wide VM.
pub struct Interpreter {
    config: RuntimeConfig,
    listener: Option<Arc<dyn LogListener>>,
    factory: Arc<VmFactory>,
    vm: Option<Arc<Vm>>,
}

impl Interpreter {
    /// Create a handle whose VM, if this handle creates it, runs the shell
    /// engine from `config`.
    pub fn new(config: RuntimeConfig, listener: Option<Arc<dyn LogListener>>) -> Self {
        Self::with_engine(config, listener, Vm::from_config)
    }

    /// Create a handle with a custom VM factory.
    pub fn with_engine<F>(
        config: RuntimeConfig,
        listener: Option<Arc<dyn LogListener>>,
        factory: F,
    ) -> Self
    where
        F: Fn(&RuntimeConfig) -> Result<Vm, VmError> + Send + Sync + 'static,
    {
        Self {
            config,
            listener,
            factory: Arc::new(factory),
            vm: GLOBAL_VM.lock().clone(),
        }
    }

    /// Queue a script on the process-wide VM, creating and starting it on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns the creation or start error. The completion has then already
    /// been invoked with [`STATUS_CREATE_FAILED`] or [`STATUS_START_FAILED`].
    pub fn enqueue(&mut self, script: Script, completion: CompletionTask) -> Result<Uuid, VmError> {
        let vm = match self.acquire() {
            Ok(vm) => vm,
            Err((status, e)) => {
                completion.invoke(status);
                return Err(e);
            }
        };

        Ok(vm.enqueue(script, completion))
    }

    /// Queue a script and get a future for its result.
    ///
    /// # Errors
    ///
    /// Returns the creation or start error of the process-wide VM.
    pub fn submit(&mut self, script: Script) -> Result<Completion, VmError> {
        let (task, completion) = Completion::channel();
        self.enqueue(script, task)?;
        Ok(completion)
    }

    fn acquire(&mut self) -> Result<Arc<Vm>, (i32, VmError)> {
        let mut global = GLOBAL_VM.lock();

        if let Some(vm) = global.as_ref() {
            vm.set_log_listener(self.listener.clone());
            self.vm = Some(Arc::clone(vm));
            return Ok(Arc::clone(vm));
        }

        debug!("Creating process-wide VM");
        let vm = Arc::new((self.factory)(&self.config).map_err(|e| (STATUS_CREATE_FAILED, e))?);
        vm.set_log_listener(self.listener.clone());

        // A VM that failed to start stays reachable through this handle for
        // error queries, but is not registered.
        self.vm = Some(Arc::clone(&vm));
        vm.start().map_err(|e| (STATUS_START_FAILED, e))?;

        info!("Process-wide VM started");
        *global = Some(Arc::clone(&vm));
        Ok(vm)
    }

    /// Start output capture on this handle's VM.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidParam`] if no VM exists yet, or the
    /// capture error.
    pub fn enable_logging(&self) -> Result<(), VmError> {
        self.require_vm()?.enable_logging()
    }

    /// Stop output capture.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidParam`] if no VM exists yet.
    pub fn disable_logging(&self) -> Result<(), VmError> {
        self.require_vm()?.disable_logging();
        Ok(())
    }

    fn require_vm(&self) -> Result<&Arc<Vm>, VmError> {
        self.vm
            .as_ref()
            .ok_or_else(|| VmError::invalid_param("Interpreter not initialized"))
    }

    /// Description of the last error of this handle's VM.
    pub fn error_message(&self) -> String {
        match &self.vm {
            None => "Interpreter not initialized".to_string(),
            Some(vm) => vm
                .error_message()
                .unwrap_or_else(|| "No error".to_string()),
        }
    }

    /// The VM this handle is bound to, if any.
    pub fn vm(&self) -> Option<&Arc<Vm>> {
        self.vm.as_ref()
    }

    /// The registered process-wide VM, if any.
    pub fn global() -> Option<Arc<Vm>> {
        GLOBAL_VM.lock().clone()
    }

    /// Unregister and tear down the process-wide VM.
    ///
    /// Handles still holding the VM see it as destroyed.
    pub fn destroy_global() {
        let vm = GLOBAL_VM.lock().take();
        if let Some(vm) = vm {
            vm.destroy();
            info!("Process-wide VM destroyed");
        }
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("vm", &self.vm)
            .field("listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}
