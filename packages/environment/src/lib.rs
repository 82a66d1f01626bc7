// ABOUTME: Sandboxed execution environments for file and shell operations
// ABOUTME: Local, Docker and cloud backends share one capability trait and a process session registry

pub mod backends;
pub mod container;
pub mod error;
pub mod paths;
pub mod process;
pub mod response;
pub mod types;

pub use backends::{
    create_environment, CloudConfig, CloudEnvironment, DockerEnvironment, Environment,
    LocalEnvironment,
};
pub use container::{ContainerConfig, ContainerState, PortMappingChange, VolumeMount};
pub use error::{ContainerStartError, EnvironmentError, Result};
pub use process::{
    ProcessOutput, ProcessRegistry, ProcessStatus, SessionId, SessionState, StreamType,
};
pub use response::Response;
pub use types::{
    BackendKind, DeleteFileResult, DirectoryResult, EntryType, FileContent, FileEntry,
    ListFilesResult, ReadFileResult, ReadMode, ShellOutcome, ShellOutput, ShellRequest,
    ShellStatus, WriteFileResult, WriteMode,
};
