pub mod archive;
pub mod auditor;
pub mod backup;
pub mod cleanup;
pub mod command;
pub mod controller;
pub mod dataset;
pub mod decide;
pub mod gateway;
pub mod gzheader;
pub mod hashing;
pub mod lock;
pub mod models;
pub mod preflight;
pub mod retry;
pub mod transfer_engine;
pub mod validator;

pub use auditor::{AuditReport, IntegrityAuditor};
pub use command::{CommandOutput, CommandRunner};
pub use controller::{ConversionRequest, ConversionSummary, PipelineController};
pub use decide::{Choice, Decider, FixedDecider, TerminalDecider};
pub use gateway::ToolGateway;
pub use hashing::HashVerifier;
pub use models::{PipelineState, SourceTree};
