//! Rust SDK for model-relay
//!
//! This SDK provides two usage modes:
//!
//! # HTTP Client (default feature)
//!
//! Create a job, then read its event stream. Events for every model in the
//! job arrive interleaved on one stream and are demultiplexed by `targetId`:
//!
//! ```rust,no_run
//! use model_relay_sdk::{Client, CreateJobRequest, ModelSelection, StreamEnd};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new("http://localhost:3000")?;
//!
//!     let job = client
//!         .jobs()
//!         .create(&CreateJobRequest::new(
//!             "Say hello",
//!             vec![
//!                 ModelSelection::new("openai", "gpt-4o"),
//!                 ModelSelection::new("anthropic", "claude-sonnet-4-5"),
//!             ],
//!         ))
//!         .await?;
//!
//!     let mut reader = client.jobs().stream(&job.uid)?;
//!     reader
//!         .on_error(|e| eprintln!("{} failed: {}", e.target_id, e.error))
//!         .on_connection_error(|e| eprintln!("stream failed: {e}"));
//!
//!     match reader.run().await {
//!         StreamEnd::Complete => {
//!             for (target, state) in reader.registry().iter() {
//!                 println!("{target}: {}", state.text);
//!             }
//!         }
//!         StreamEnd::JobFailed(e) => eprintln!("job failed: {}", e.error),
//!         StreamEnd::Closed | StreamEnd::Failed(_) => {}
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Embedded Runtime (feature = "embedded")
//!
//! Run the relay in process:
//!
//! ```rust,ignore
//! use model_relay_sdk::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::builder()
//!         .config_path("config.yaml")
//!         .build()
//!         .await?;
//!
//!     runtime.start().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod types;

#[cfg(feature = "http-client")]
pub mod client;

#[cfg(feature = "http-client")]
pub mod stream;

#[cfg(feature = "embedded")]
pub mod runtime;

// Re-exports
pub use error::Error;
pub use types::*;

#[cfg(feature = "http-client")]
pub use client::{Client, JobsApi};

#[cfg(feature = "http-client")]
pub use stream::{CloseHandle, ConnectionError, StreamEnd, StreamReader, TargetRegistry, TargetState};

#[cfg(feature = "embedded")]
pub use runtime::Runtime;
