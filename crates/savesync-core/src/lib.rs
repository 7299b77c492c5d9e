//! Worker-isolated native-module harness and live save ingestion pipeline.
//!
//! The client half stages save bytes into a sandboxed module that runs on a
//! dedicated worker thread ([`bridge::WorkerBridge`]), compresses them there
//! ([`compression::CompressionPipeline`]) and pushes them to the server
//! ([`upload::ChunkedUploader`]). The server half
//! ([`ingest::IngestionActor`]) stores and validates each upload concurrently
//! and only commits and notifies live subscribers once both succeed.
//!
//! ```text
//! caller --stage--> OwnershipHarness --compress--> ChunkedUploader
//!                        (worker thread)               |
//!                                                      v  multipart POST
//!                                              IngestionActor
//!                                          store || validate
//!                                          /                \
//!                                  commit + notify      delete (compensate)
//! ```

pub mod bridge;
pub mod compression;
pub mod harness;
pub mod ingest;
pub mod module;
pub mod upload;

pub use bridge::{BridgeClient, BridgeError, BridgeOptions, BridgeState, TransferBuffer, WorkerBridge};
pub use compression::{CompressedPayload, CompressionPipeline, ContentProbe, InputKind};
pub use harness::{HarnessError, OwnershipHarness, Provenance, ResultHandle, StagedInput};
pub use ingest::{IngestError, IngestionActor, LiveArtifact, SubjectId};
pub use module::{ModuleError, ModuleLoadError, ModuleLoader, NativeHandle, NativeModule};
pub use upload::{ChunkedUploader, UploadError, UploadMetadata, UploadProgress};
