use uuid::Uuid;

pub type Program = String;
pub type Args = Vec<String>;
pub type Tag = Option<String>;
pub type StreamName = String;
pub type JobId = Uuid;
pub type Pid = u32;
pub type ExitCode = i32;
pub type Frame = bytes::Bytes;

/// Boxed error returned by user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
