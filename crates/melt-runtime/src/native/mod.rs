//! Boundary types for the native chat-inference module.
//!
//! The native side exposes *packed functions*: callables looked up by name that take an untyped
//! argument list and return a single [`NativeValue`]. Functions live either in the global
//! [`NativeRegistry`] or inside a [`NativeModule`] (the chat module, a system library, ...).
//!
//! An in-process implementation of the whole contract lives in [`simulated`].
pub mod simulated;

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Shared handle to a native module.
pub type ModuleHandle = Arc<dyn NativeModule>;

type PackedFn = dyn Fn(&[NativeValue]) -> Result<NativeValue, NativeError> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum NativeError {
    #[error("Function '{function}' expected {expected} argument(s), got {actual}")]
    ArgumentCount {
        function: String,
        expected: usize,
        actual: usize,
    },
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Native call failed: {0}")]
    CallFailed(String),
}

/// A value crossing the native boundary.
#[derive(Clone)]
pub enum NativeValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Module(ModuleHandle),
}

impl NativeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            NativeValue::Null => "null",
            NativeValue::Int(_) => "int",
            NativeValue::Float(_) => "float",
            NativeValue::Str(_) => "str",
            NativeValue::Module(_) => "module",
        }
    }

    pub fn as_i64(&self) -> Result<i64, NativeError> {
        match self {
            NativeValue::Int(v) => Ok(*v),
            other => Err(NativeError::TypeMismatch {
                expected: "int",
                actual: other.type_name(),
            }),
        }
    }

    pub fn as_str(&self) -> Result<&str, NativeError> {
        match self {
            NativeValue::Str(s) => Ok(s),
            other => Err(NativeError::TypeMismatch {
                expected: "str",
                actual: other.type_name(),
            }),
        }
    }

    pub fn into_string(self) -> Result<String, NativeError> {
        match self {
            NativeValue::Str(s) => Ok(s),
            other => Err(NativeError::TypeMismatch {
                expected: "str",
                actual: other.type_name(),
            }),
        }
    }

    pub fn into_module(self) -> Result<ModuleHandle, NativeError> {
        match self {
            NativeValue::Module(m) => Ok(m),
            other => Err(NativeError::TypeMismatch {
                expected: "module",
                actual: other.type_name(),
            }),
        }
    }
}

impl Debug for NativeValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NativeValue::Null => write!(f, "Null"),
            NativeValue::Int(v) => write!(f, "Int({v})"),
            NativeValue::Float(v) => write!(f, "Float({v})"),
            NativeValue::Str(s) => write!(f, "Str({s:?})"),
            NativeValue::Module(m) => write!(f, "Module({})", m.type_key()),
        }
    }
}

impl From<&str> for NativeValue {
    fn from(value: &str) -> Self {
        NativeValue::Str(value.to_string())
    }
}

impl From<String> for NativeValue {
    fn from(value: String) -> Self {
        NativeValue::Str(value)
    }
}

impl From<i64> for NativeValue {
    fn from(value: i64) -> Self {
        NativeValue::Int(value)
    }
}

impl From<bool> for NativeValue {
    fn from(value: bool) -> Self {
        NativeValue::Int(value as i64)
    }
}

impl From<ModuleHandle> for NativeValue {
    fn from(value: ModuleHandle) -> Self {
        NativeValue::Module(value)
    }
}

/// A resolved, named native callable.
#[derive(Clone)]
pub struct PackedFunc {
    name: String,
    inner: Arc<PackedFn>,
}

impl PackedFunc {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&[NativeValue]) -> Result<NativeValue, NativeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, args: &[NativeValue]) -> Result<NativeValue, NativeError> {
        (self.inner)(args)
    }
}

impl Debug for PackedFunc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackedFunc({})", self.name)
    }
}

/// A loaded native module exposing entry points by name.
pub trait NativeModule: Send + Sync {
    fn type_key(&self) -> &str;

    fn get_function(&self, name: &str) -> Option<PackedFunc>;
}

/// Process-wide lookup of global native functions.
pub trait NativeRegistry: Send + Sync {
    fn get_global(&self, name: &str) -> Option<PackedFunc>;
}

/// Compute device kind understood by the native runtime.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    #[default]
    OpenCl,
    Vulkan,
    Metal,
}

impl DeviceKind {
    /// Device type code passed to the native runtime.
    pub fn type_code(self) -> i64 {
        match self {
            DeviceKind::Cpu => 1,
            DeviceKind::Cuda => 2,
            DeviceKind::OpenCl => 4,
            DeviceKind::Vulkan => 7,
            DeviceKind::Metal => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    #[serde(default)]
    pub id: i64,
}

impl Device {
    pub fn new(kind: DeviceKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Check the argument count of a packed call.
pub(crate) fn expect_args(
    function: &str,
    args: &[NativeValue],
    expected: usize,
) -> Result<(), NativeError> {
    if args.len() != expected {
        return Err(NativeError::ArgumentCount {
            function: function.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn device_kind_parses_case_insensitively() {
        assert_eq!(DeviceKind::from_str("OpenCL").unwrap(), DeviceKind::OpenCl);
        assert_eq!(DeviceKind::from_str("metal").unwrap(), DeviceKind::Metal);
        assert!(DeviceKind::from_str("tpu").is_err());
    }

    #[test]
    fn device_type_codes() {
        assert_eq!(DeviceKind::Cpu.type_code(), 1);
        assert_eq!(DeviceKind::OpenCl.type_code(), 4);
        assert_eq!(Device::default().to_string(), "opencl:0");
    }

    #[test]
    fn value_conversions_report_mismatch() {
        let value = NativeValue::from("hi");
        assert_eq!(value.as_str().unwrap(), "hi");
        let err = value.as_i64().unwrap_err();
        assert!(matches!(
            err,
            NativeError::TypeMismatch {
                expected: "int",
                actual: "str"
            }
        ));
    }

    #[test]
    fn packed_func_invokes_closure() {
        let add = PackedFunc::new("add", |args| {
            expect_args("add", args, 2)?;
            Ok(NativeValue::Int(args[0].as_i64()? + args[1].as_i64()?))
        });
        let out = add.invoke(&[NativeValue::Int(1), NativeValue::Int(2)]).unwrap();
        assert_eq!(out.as_i64().unwrap(), 3);
        assert!(add.invoke(&[NativeValue::Int(1)]).is_err());
    }
}
