//! Chat-inference session bound to one native chat module.
//!
//! Construction resolves every entry point the session needs up front, so a module missing a
//! symbol fails immediately instead of on first use. Ordering between calls (e.g. decoding before
//! any prefill) is left to the native module.

use crate::error::SessionError;
use crate::native::{
    Device, ModuleHandle, NativeModule, NativeRegistry, NativeValue, PackedFunc,
};
use std::sync::Arc;

pub const CHAT_CREATE_GLOBAL: &str = "mlc.llm_chat_create";
pub const SYSTEM_LIB_GLOBAL: &str = "runtime.SystemLib";

/// Entry points every chat module must expose.
pub const REQUIRED_ENTRY_POINTS: [&str; 10] = [
    "reload",
    "unload",
    "prefill",
    "decode",
    "get_message",
    "stopped",
    "reset_chat",
    "runtime_stats_text",
    "verbose_runtime_stats_text",
    "evaluate",
];

/// Prefix under which the runtime registers a model library: `-` becomes `_`, plus a trailing `_`.
pub fn library_prefix(model_lib: &str) -> String {
    format!("{}_", model_lib.replace('-', "_"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Chat module bound; holds weights once a reload succeeded.
    Loaded,
    /// Resources released by `unload`.
    Unloaded,
}

/// The model most recently loaded by a successful reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModel {
    pub model_lib: String,
    pub model_path: String,
}

/// A system library resolved for a model, ready to be handed to reload.
#[derive(Clone)]
pub struct ModelLibrary {
    model_lib: String,
    prefix: String,
    module: ModuleHandle,
}

impl ModelLibrary {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl std::fmt::Debug for ModelLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLibrary")
            .field("model_lib", &self.model_lib)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Binding {
    entry_point: &'static str,
    func: PackedFunc,
}

impl Binding {
    fn call(&self, args: &[NativeValue]) -> Result<NativeValue, SessionError> {
        self.func
            .invoke(args)
            .map_err(|source| SessionError::NativeCall {
                entry_point: self.entry_point,
                source,
            })
    }

    fn call_string(&self, args: &[NativeValue]) -> Result<String, SessionError> {
        self.call(args)?
            .into_string()
            .map_err(|source| SessionError::NativeCall {
                entry_point: self.entry_point,
                source,
            })
    }
}

#[derive(Debug)]
struct ChatBindings {
    reload: Binding,
    unload: Binding,
    prefill: Binding,
    decode: Binding,
    get_message: Binding,
    stopped: Binding,
    reset_chat: Binding,
    runtime_stats_text: Binding,
    verbose_runtime_stats_text: Binding,
    evaluate: Binding,
}

impl ChatBindings {
    fn bind(module: &dyn NativeModule) -> Result<Self, SessionError> {
        let require = |entry_point: &'static str| {
            let func =
                module
                    .get_function(entry_point)
                    .ok_or_else(|| SessionError::MissingEntryPoint {
                        module: module.type_key().to_string(),
                        entry_point,
                    })?;
            log::debug!("Bound entry point '{entry_point}' of '{}'", module.type_key());
            Ok::<_, SessionError>(Binding { entry_point, func })
        };
        let [
            reload,
            unload,
            prefill,
            decode,
            get_message,
            stopped,
            reset_chat,
            runtime_stats_text,
            verbose_runtime_stats_text,
            evaluate,
        ] = REQUIRED_ENTRY_POINTS;
        Ok(Self {
            reload: require(reload)?,
            unload: require(unload)?,
            prefill: require(prefill)?,
            decode: require(decode)?,
            get_message: require(get_message)?,
            stopped: require(stopped)?,
            reset_chat: require(reset_chat)?,
            runtime_stats_text: require(runtime_stats_text)?,
            verbose_runtime_stats_text: require(verbose_runtime_stats_text)?,
            evaluate: require(evaluate)?,
        })
    }
}

/// One conversational session over a native chat module.
pub struct InferenceSession {
    registry: Arc<dyn NativeRegistry>,
    device: Device,
    module: ModuleHandle,
    bindings: ChatBindings,
    state: SessionState,
    loaded: Option<LoadedModel>,
}

impl InferenceSession {
    /// Create the chat module on `device` and bind its entry points.
    pub fn new(registry: Arc<dyn NativeRegistry>, device: Device) -> Result<Self, SessionError> {
        let create = registry
            .get_global(CHAT_CREATE_GLOBAL)
            .ok_or(SessionError::MissingGlobal(CHAT_CREATE_GLOBAL))?;
        let module = create
            .invoke(&[
                NativeValue::Int(device.kind.type_code()),
                NativeValue::Int(device.id),
            ])
            .and_then(NativeValue::into_module)
            .map_err(|source| SessionError::CreateFailed { device, source })?;
        let bindings = ChatBindings::bind(module.as_ref())?;
        log::debug!("Created chat module '{}' on {device}", module.type_key());

        Ok(Self {
            registry,
            device,
            module,
            bindings,
            state: SessionState::Loaded,
            loaded: None,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn loaded_model(&self) -> Option<&LoadedModel> {
        self.loaded.as_ref()
    }

    /// Resolve the system library registered for `model_lib`.
    pub fn resolve_library(&self, model_lib: &str) -> Result<ModelLibrary, SessionError> {
        let prefix = library_prefix(model_lib);
        let system_lib = self
            .registry
            .get_global(SYSTEM_LIB_GLOBAL)
            .ok_or(SessionError::MissingGlobal(SYSTEM_LIB_GLOBAL))?;
        let module = system_lib
            .invoke(&[prefix.as_str().into()])
            .and_then(NativeValue::into_module)
            .map_err(|source| SessionError::LibraryNotFound {
                prefix: prefix.clone(),
                source,
            })?;
        Ok(ModelLibrary {
            model_lib: model_lib.to_string(),
            prefix,
            module,
        })
    }

    /// Load the weights at `model_path` using an already resolved library.
    pub fn reload_with_library(
        &mut self,
        library: ModelLibrary,
        model_path: &str,
    ) -> Result<(), SessionError> {
        log::debug!(
            "Reloading '{}' from {model_path} (library prefix '{}')",
            library.model_lib,
            library.prefix
        );
        self.bindings.reload.call(&[
            NativeValue::Module(library.module),
            model_path.into(),
        ])?;
        self.state = SessionState::Loaded;
        self.loaded = Some(LoadedModel {
            model_lib: library.model_lib,
            model_path: model_path.to_string(),
        });
        Ok(())
    }

    pub fn reload(&mut self, model_lib: &str, model_path: &str) -> Result<(), SessionError> {
        let library = self.resolve_library(model_lib)?;
        self.reload_with_library(library, model_path)
    }

    pub fn reset_chat(&mut self) -> Result<(), SessionError> {
        self.bindings.reset_chat.call(&[]).map(drop)
    }

    pub fn prefill(&mut self, input: &str) -> Result<(), SessionError> {
        self.bindings.prefill.call(&[input.into()]).map(drop)
    }

    pub fn decode(&mut self) -> Result<(), SessionError> {
        self.bindings.decode.call(&[]).map(drop)
    }

    pub fn get_message(&mut self) -> Result<String, SessionError> {
        self.bindings.get_message.call_string(&[])
    }

    pub fn stopped(&mut self) -> Result<bool, SessionError> {
        let value = self.bindings.stopped.call(&[])?;
        let flag = value.as_i64().map_err(|source| SessionError::NativeCall {
            entry_point: self.bindings.stopped.entry_point,
            source,
        })?;
        Ok(flag != 0)
    }

    pub fn runtime_stats_text(&mut self) -> Result<String, SessionError> {
        self.bindings.runtime_stats_text.call_string(&[])
    }

    pub fn verbose_runtime_stats_text(&mut self) -> Result<String, SessionError> {
        self.bindings.verbose_runtime_stats_text.call_string(&[])
    }

    pub fn evaluate(&mut self) -> Result<(), SessionError> {
        self.bindings.evaluate.call(&[]).map(drop)
    }

    pub fn unload(&mut self) -> Result<(), SessionError> {
        self.bindings.unload.call(&[])?;
        self.state = SessionState::Unloaded;
        self.loaded = None;
        Ok(())
    }
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("device", &self.device)
            .field("module", &self.module.type_key())
            .field("state", &self.state)
            .field("loaded", &self.loaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::simulated::SimulatedRegistry;
    use rstest::rstest;

    fn session(registry: SimulatedRegistry) -> InferenceSession {
        InferenceSession::new(Arc::new(registry), Device::default()).unwrap()
    }

    #[rstest]
    #[case("my-model", "my_model_")]
    #[case("Llama-2-7b-chat-hf-q4f16_1", "Llama_2_7b_chat_hf_q4f16_1_")]
    #[case("plain", "plain_")]
    fn library_prefixes(#[case] model_lib: &str, #[case] prefix: &str) {
        assert_eq!(library_prefix(model_lib), prefix);
    }

    #[rstest]
    #[case("reload")]
    #[case("stopped")]
    #[case("evaluate")]
    fn missing_entry_point_fails_construction(#[case] entry_point: &str) {
        let registry = SimulatedRegistry::new().without_entry_point(entry_point);
        let err = InferenceSession::new(Arc::new(registry), Device::default()).unwrap_err();
        match err {
            SessionError::MissingEntryPoint {
                entry_point: missing,
                ..
            } => assert_eq!(missing, entry_point),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_create_global_fails_construction() {
        let registry = SimulatedRegistry::new().without_global(CHAT_CREATE_GLOBAL);
        let err = InferenceSession::new(Arc::new(registry), Device::default()).unwrap_err();
        assert!(matches!(err, SessionError::MissingGlobal(CHAT_CREATE_GLOBAL)));
    }

    #[test]
    fn unknown_library_fails_reload() {
        let mut session = session(SimulatedRegistry::new().with_system_lib("other_"));
        let err = session.reload("my-model", "/path").unwrap_err();
        match err {
            SessionError::LibraryNotFound { prefix, .. } => assert_eq!(prefix, "my_model_"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.loaded_model(), None);
    }

    #[test]
    fn loaded_model_tracks_latest_reload() {
        let registry = SimulatedRegistry::new()
            .with_system_lib("first_")
            .with_system_lib("second_");
        let mut session = session(registry);
        session.reload("first", "/models/first").unwrap();
        session.reload("second", "/models/second").unwrap();
        assert!(session.reload("third", "/models/third").is_err());

        let loaded = session.loaded_model().unwrap();
        assert_eq!(loaded.model_lib, "second");
        assert_eq!(loaded.model_path, "/models/second");
    }

    #[test]
    fn canonical_protocol() {
        let mut session = session(SimulatedRegistry::new().with_system_lib("m_"));
        session.reload("m", "/models/m").unwrap();
        session.reset_chat().unwrap();
        session.prefill("one two").unwrap();
        while !session.stopped().unwrap() {
            session.decode().unwrap();
        }
        assert_eq!(session.get_message().unwrap(), "one two");
        assert!(session.runtime_stats_text().unwrap().starts_with('{'));
        assert!(session.verbose_runtime_stats_text().unwrap().contains("prefill"));
        session.evaluate().unwrap();
    }

    #[test]
    fn unload_releases_model() {
        let mut session = session(SimulatedRegistry::new().with_system_lib("m_"));
        session.reload("m", "/models/m").unwrap();
        session.unload().unwrap();
        assert_eq!(session.state(), SessionState::Unloaded);
        assert_eq!(session.loaded_model(), None);
    }
}
