pub mod clock;
pub mod model;
pub mod error;
pub mod config;
pub mod idempotency;
pub mod breaker;
pub mod source;
pub mod integrity;
pub mod archiver;
pub mod delivery;
pub mod coordinator;
pub mod observability;
pub mod sim;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{ConfigError, RelayConfig};
pub use coordinator::{BatchCoordinator, BatchReport, Collaborators, Deadline, DeliveryStatus};
pub use error::{BatchError, StoreError};
pub use model::{BatchOutcome, IngestNotification};
