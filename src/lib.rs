pub mod backend;
pub mod broadcast;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gpio;
pub mod routes;
pub mod shutdown;

pub use broadcast::{Broadcaster, Delivery, Subscriber, SubscriberState};
pub use config::{AppConfig, HttpConfig, LineConfig};
pub use dispatcher::{Command, Reply, Status, dispatch};
pub use error::{AppError, ErrorKind, HardwareError};
pub use gpio::{
    ChangeEvent, ChangeObserver, Direction, LineBackend, LineHandle, LineSnapshot, PinManager,
};
pub use routes::AppState;
pub use shutdown::{DrainOutcome, DrainReport, ShutdownCoordinator, ShutdownState};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
