//! Storage array access
//!
//! Everything the reconciler needs to talk to the array:
//! - Transport contract and status-checking JSON client
//! - `reqwest` HTTPS transport
//! - Endpoint path builders
//! - Per-run inventory cache
//! - PIT metadata stored in the array's key-value store
//! - In-memory array simulator

pub mod endpoints;
pub mod http;
pub mod inventory;
pub mod metadata;
pub mod simulator;
pub mod transport;

pub use http::{HttpTransport, HttpTransportConfig};
pub use inventory::{InventoryCache, PoolIndex, VolumeIndex};
pub use metadata::{MetadataStore, PitMetadata};
pub use simulator::{RecordedRequest, SimulatedArray, GIB, TIB};
pub use transport::{ArrayClient, ArrayResponse, ArrayTransport, Method, TransportError};
