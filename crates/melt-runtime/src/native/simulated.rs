//! In-process stand-in for the native chat module.
//!
//! The simulated chat echoes the words of each prompt back, one word per decode step, and keeps
//! prefill/decode statistics in the same text formats as the real runtime. It backs the test suite
//! and the CLI dry-run mode, where the measurement protocol is rehearsed without a device.

use super::{
    ModuleHandle, NativeError, NativeModule, NativeRegistry, NativeValue, PackedFunc,
    expect_args,
};
use crate::session::{CHAT_CREATE_GLOBAL, SYSTEM_LIB_GLOBAL};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const SYSTEM_LIB_TYPE_KEY: &str = "system_lib";
const LIBRARY_PREFIX_FN: &str = "library_prefix";

#[derive(Debug, Clone)]
struct SimulationSettings {
    libraries: HashSet<String>,
    missing_globals: HashSet<String>,
    missing_entry_points: HashSet<String>,
    failing_entry_points: HashSet<String>,
    max_gen_len: usize,
    token_latency: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            libraries: HashSet::new(),
            missing_globals: HashSet::new(),
            missing_entry_points: HashSet::new(),
            failing_entry_points: HashSet::new(),
            max_gen_len: 256,
            token_latency: Duration::ZERO,
        }
    }
}

/// Global registry exposing `mlc.llm_chat_create` and `runtime.SystemLib`.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRegistry {
    settings: Arc<SimulationSettings>,
}

impl SimulatedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn settings_mut(&mut self) -> &mut SimulationSettings {
        Arc::make_mut(&mut self.settings)
    }

    /// Register a system library under the given prefix (e.g. `Llama_2_7b_`).
    pub fn with_system_lib(mut self, prefix: impl Into<String>) -> Self {
        self.settings_mut().libraries.insert(prefix.into());
        self
    }

    /// Maximum number of words generated per prompt.
    pub fn with_max_gen_len(mut self, max_gen_len: usize) -> Self {
        self.settings_mut().max_gen_len = max_gen_len;
        self
    }

    /// Time spent per prefilled or decoded token.
    pub fn with_token_latency(mut self, latency: Duration) -> Self {
        self.settings_mut().token_latency = latency;
        self
    }

    pub fn without_global(mut self, name: impl Into<String>) -> Self {
        self.settings_mut().missing_globals.insert(name.into());
        self
    }

    /// Leave an entry point out of the chat module.
    pub fn without_entry_point(mut self, name: impl Into<String>) -> Self {
        self.settings_mut().missing_entry_points.insert(name.into());
        self
    }

    /// Make an entry point of the chat module fail on every call.
    pub fn failing_entry_point(mut self, name: impl Into<String>) -> Self {
        self.settings_mut().failing_entry_points.insert(name.into());
        self
    }
}

impl NativeRegistry for SimulatedRegistry {
    fn get_global(&self, name: &str) -> Option<PackedFunc> {
        if self.settings.missing_globals.contains(name) {
            return None;
        }
        let settings = self.settings.clone();
        match name {
            CHAT_CREATE_GLOBAL => Some(PackedFunc::new(name, move |args| {
                expect_args(CHAT_CREATE_GLOBAL, args, 2)?;
                let kind_code = args[0].as_i64()?;
                let device_id = args[1].as_i64()?;
                log::debug!("Creating simulated chat module on device {kind_code}:{device_id}");
                let chat: ModuleHandle = Arc::new(SimulatedChat::new(settings.clone()));
                Ok(NativeValue::Module(chat))
            })),
            SYSTEM_LIB_GLOBAL => Some(PackedFunc::new(name, move |args| {
                expect_args(SYSTEM_LIB_GLOBAL, args, 1)?;
                let prefix = args[0].as_str()?;
                if !settings.libraries.contains(prefix) {
                    return Err(NativeError::CallFailed(format!(
                        "no system library registered with prefix '{prefix}'"
                    )));
                }
                let lib: ModuleHandle = Arc::new(SystemLibrary {
                    prefix: prefix.to_string(),
                });
                Ok(NativeValue::Module(lib))
            })),
            _ => None,
        }
    }
}

struct SystemLibrary {
    prefix: String,
}

impl NativeModule for SystemLibrary {
    fn type_key(&self) -> &str {
        SYSTEM_LIB_TYPE_KEY
    }

    fn get_function(&self, name: &str) -> Option<PackedFunc> {
        if name != LIBRARY_PREFIX_FN {
            return None;
        }
        let prefix = self.prefix.clone();
        Some(PackedFunc::new(name, move |_| Ok(prefix.clone().into())))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PhaseCounter {
    tokens: u64,
    time: Duration,
}

impl PhaseCounter {
    fn throughput(&self) -> f64 {
        let secs = self.time.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Default)]
struct ChatState {
    model: Option<(String, String)>,
    pending: VecDeque<String>,
    message: String,
    prefill: PhaseCounter,
    decode: PhaseCounter,
}

impl ChatState {
    fn require_model(&self, entry_point: &str) -> Result<(), NativeError> {
        match self.model {
            Some(_) => Ok(()),
            None => Err(NativeError::CallFailed(format!(
                "{entry_point}: no model loaded"
            ))),
        }
    }

    fn reset_conversation(&mut self) {
        self.pending.clear();
        self.message.clear();
        self.prefill = PhaseCounter::default();
        self.decode = PhaseCounter::default();
    }

    fn stopped(&self) -> bool {
        self.pending.is_empty()
    }

    fn stats_json(&self) -> String {
        let phase = |c: &PhaseCounter| {
            serde_json::json!({
                "throughput": format!("{:.3} tok/s", c.throughput()),
                "total tokens": format!("{} tok", c.tokens),
                "total time": format!("{:.3} s", c.time.as_secs_f64()),
            })
        };
        serde_json::json!({
            "prefill": phase(&self.prefill),
            "decode": phase(&self.decode),
        })
        .to_string()
    }

    fn stats_text(&self) -> String {
        let mut out = String::new();
        for (name, c) in [("prefill", &self.prefill), ("decode", &self.decode)] {
            out.push_str(&format!("----------- {name} -----------\n"));
            out.push_str(&format!("throughput: {:.3} tok/s\n", c.throughput()));
            out.push_str(&format!("total tokens: {} tok\n", c.tokens));
            out.push_str(&format!("total time: {:.3} s\n", c.time.as_secs_f64()));
        }
        out
    }
}

struct SimulatedChat {
    settings: Arc<SimulationSettings>,
    state: Arc<Mutex<ChatState>>,
}

impl SimulatedChat {
    fn new(settings: Arc<SimulationSettings>) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(ChatState::default())),
        }
    }
}

fn lock(state: &Mutex<ChatState>) -> MutexGuard<'_, ChatState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

type ChatOp = fn(&mut ChatState, &SimulationSettings, &[NativeValue]) -> Result<NativeValue, NativeError>;

fn chat_op(name: &str) -> Option<ChatOp> {
    let op: ChatOp = match name {
        "reload" => |state, _, args| {
            expect_args("reload", args, 2)?;
            let lib = args[0].clone().into_module()?;
            let prefix = lib
                .get_function(LIBRARY_PREFIX_FN)
                .ok_or_else(|| {
                    NativeError::CallFailed(format!(
                        "reload: expected a system library, got '{}'",
                        lib.type_key()
                    ))
                })?
                .invoke(&[])?
                .into_string()?;
            let path = args[1].as_str()?.to_string();
            state.model = Some((prefix, path));
            state.reset_conversation();
            Ok(NativeValue::Null)
        },
        "unload" => |state, _, _| {
            state.model = None;
            state.reset_conversation();
            Ok(NativeValue::Null)
        },
        "reset_chat" => |state, _, _| {
            state.require_model("reset_chat")?;
            state.reset_conversation();
            Ok(NativeValue::Null)
        },
        "prefill" => |state, settings, args| {
            expect_args("prefill", args, 1)?;
            state.require_model("prefill")?;
            let started = Instant::now();
            let words: Vec<String> = args[0]
                .as_str()?
                .split_whitespace()
                .map(str::to_string)
                .collect();
            std::thread::sleep(settings.token_latency * words.len() as u32);
            state.prefill.tokens += words.len() as u64;
            state.message.clear();
            state.pending = words.into_iter().take(settings.max_gen_len).collect();
            state.prefill.time += started.elapsed();
            Ok(NativeValue::Null)
        },
        "decode" => |state, settings, _| {
            state.require_model("decode")?;
            let started = Instant::now();
            if let Some(word) = state.pending.pop_front() {
                std::thread::sleep(settings.token_latency);
                if !state.message.is_empty() {
                    state.message.push(' ');
                }
                state.message.push_str(&word);
                state.decode.tokens += 1;
            }
            state.decode.time += started.elapsed();
            Ok(NativeValue::Null)
        },
        "get_message" => |state, _, _| {
            state.require_model("get_message")?;
            Ok(state.message.clone().into())
        },
        "stopped" => |state, _, _| {
            state.require_model("stopped")?;
            Ok(state.stopped().into())
        },
        "runtime_stats_text" => |state, _, _| {
            state.require_model("runtime_stats_text")?;
            Ok(state.stats_json().into())
        },
        "verbose_runtime_stats_text" => |state, _, _| {
            state.require_model("verbose_runtime_stats_text")?;
            Ok(state.stats_text().into())
        },
        "evaluate" => |state, _, _| {
            state.require_model("evaluate")?;
            log::debug!(
                "Simulated evaluation: {} prefill / {} decode tokens so far",
                state.prefill.tokens,
                state.decode.tokens
            );
            Ok(NativeValue::Null)
        },
        _ => return None,
    };
    Some(op)
}

impl NativeModule for SimulatedChat {
    fn type_key(&self) -> &str {
        "simulated_chat"
    }

    fn get_function(&self, name: &str) -> Option<PackedFunc> {
        if self.settings.missing_entry_points.contains(name) {
            return None;
        }
        let op = chat_op(name)?;
        let failing = self.settings.failing_entry_points.contains(name);
        let settings = self.settings.clone();
        let state = self.state.clone();
        let fn_name = name.to_string();
        Some(PackedFunc::new(name, move |args| {
            if failing {
                return Err(NativeError::CallFailed(format!("{fn_name}: injected failure")));
            }
            op(&mut lock(&state), &settings, args)
        }))
    }
}

/// Convenience for tests and dry runs: a registry knowing the library of `model_lib`.
pub fn registry_for(model_lib: &str) -> SimulatedRegistry {
    SimulatedRegistry::new().with_system_lib(crate::session::library_prefix(model_lib))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn chat() -> ModuleHandle {
        SimulatedRegistry::new()
            .get_global(CHAT_CREATE_GLOBAL)
            .unwrap()
            .invoke(&[NativeValue::Int(4), NativeValue::Int(0)])
            .unwrap()
            .into_module()
            .unwrap()
    }

    fn call(module: &ModuleHandle, name: &str, args: &[NativeValue]) -> NativeValue {
        module.get_function(name).unwrap().invoke(args).unwrap()
    }

    #[test]
    fn unknown_library_is_rejected() {
        let registry = SimulatedRegistry::new().with_system_lib("known_");
        let system_lib = registry.get_global(SYSTEM_LIB_GLOBAL).unwrap();
        assert!(system_lib.invoke(&["known_".into()]).is_ok());
        assert!(system_lib.invoke(&["other_".into()]).is_err());
    }

    fn loaded_chat(registry: SimulatedRegistry, prefix: &str) -> ModuleHandle {
        let lib = registry
            .get_global(SYSTEM_LIB_GLOBAL)
            .unwrap()
            .invoke(&[prefix.into()])
            .unwrap();
        let chat = registry
            .get_global(CHAT_CREATE_GLOBAL)
            .unwrap()
            .invoke(&[NativeValue::Int(4), NativeValue::Int(0)])
            .unwrap()
            .into_module()
            .unwrap();
        call(&chat, "reload", &[lib, "/models/m".into()]);
        chat
    }

    #[rstest]
    #[case("prefill", &["hello"])]
    #[case("decode", &[])]
    #[case("reset_chat", &[])]
    #[case("get_message", &[])]
    #[case("stopped", &[])]
    #[case("runtime_stats_text", &[])]
    #[case("verbose_runtime_stats_text", &[])]
    #[case("evaluate", &[])]
    fn calls_before_reload_fail(#[case] entry_point: &str, #[case] args: &[&str]) {
        let args: Vec<NativeValue> = args.iter().map(|a| (*a).into()).collect();
        let err = chat()
            .get_function(entry_point)
            .unwrap()
            .invoke(&args)
            .unwrap_err();
        assert!(err.to_string().contains("no model loaded"), "{entry_point}: {err}");
    }

    #[test]
    fn unload_clears_the_model() {
        let chat = loaded_chat(SimulatedRegistry::new().with_system_lib("m_"), "m_");
        call(&chat, "unload", &[]);
        assert!(chat.get_function("stopped").unwrap().invoke(&[]).is_err());
    }

    #[test]
    fn max_gen_len_bounds_the_answer() {
        let registry = SimulatedRegistry::new()
            .with_system_lib("m_")
            .with_max_gen_len(2);
        let chat = loaded_chat(registry, "m_");
        call(&chat, "prefill", &["a b c d".into()]);
        while call(&chat, "stopped", &[]).as_i64().unwrap() == 0 {
            call(&chat, "decode", &[]);
        }
        assert_eq!(call(&chat, "get_message", &[]).as_str().unwrap(), "a b");
    }

    #[test]
    fn echoes_prompt_word_by_word() {
        let chat = loaded_chat(SimulatedRegistry::new().with_system_lib("m_"), "m_");
        call(&chat, "prefill", &["hello there world".into()]);

        let mut steps = 0;
        while call(&chat, "stopped", &[]).as_i64().unwrap() == 0 {
            call(&chat, "decode", &[]);
            steps += 1;
        }
        assert_eq!(steps, 3);
        assert_eq!(
            call(&chat, "get_message", &[]).as_str().unwrap(),
            "hello there world"
        );

        let stats = call(&chat, "runtime_stats_text", &[]).into_string().unwrap();
        let json: serde_json::Value = serde_json::from_str(&stats).unwrap();
        assert_eq!(json["prefill"]["total tokens"], "3 tok");
        assert_eq!(json["decode"]["total tokens"], "3 tok");
    }

    #[test]
    fn injected_failures_and_missing_entry_points() {
        let registry = SimulatedRegistry::new()
            .without_entry_point("evaluate")
            .failing_entry_point("decode");
        let chat = registry
            .get_global(CHAT_CREATE_GLOBAL)
            .unwrap()
            .invoke(&[NativeValue::Int(1), NativeValue::Int(0)])
            .unwrap()
            .into_module()
            .unwrap();
        assert!(chat.get_function("evaluate").is_none());
        assert!(chat.get_function("decode").unwrap().invoke(&[]).is_err());
    }
}
