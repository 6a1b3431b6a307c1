pub mod artifact;
pub mod catalog;
pub mod config;
pub mod job;
pub mod provider;

pub use artifact::{ArtifactReference, DurableRecord, StorageTier, StoredObject};
pub use catalog::CatalogEntry;
pub use config::{ClassifierConfig, ProviderConfig, RemoteConfig, VaultConfig};
pub use job::{GenerationJob, JobOutcome, JobStatus};
pub use provider::{GenerationRequest, ProviderStatus, RawPollResponse, SubmitResponse};
