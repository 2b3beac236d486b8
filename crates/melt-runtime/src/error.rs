use crate::native::NativeError;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Global function '{0}' is not registered")]
    MissingGlobal(&'static str),
    #[error("Chat module '{module}' does not expose required entry point '{entry_point}'")]
    MissingEntryPoint {
        module: String,
        entry_point: &'static str,
    },
    #[error("Failed to create chat module on {device}: {source}")]
    CreateFailed {
        device: crate::native::Device,
        #[source]
        source: NativeError,
    },
    #[error("System library '{prefix}' could not be resolved: {source}")]
    LibraryNotFound {
        prefix: String,
        #[source]
        source: NativeError,
    },
    #[error("Native call '{entry_point}' failed: {source}")]
    NativeCall {
        entry_point: &'static str,
        #[source]
        source: NativeError,
    },
}
