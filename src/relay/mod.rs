// Relay endpoint - receives client uploads and forwards them to the
// external map upload API.

pub mod assembly;
pub mod external;
pub mod server;

pub use assembly::{ChunkAssembler, ChunkOutcome};
pub use external::{MapApiClient, RetryPolicy};
pub use server::{router, serve, AppState};
